//! # personlink Engine
//!
//! Resumable auto-linking over a document store.
//!
//! - [`Autolinker`] - One pass over changed contacts, merging and splitting persons
//! - [`LinkerContext`] - Single-pass guard, watermark, watch activity and manual overrides
//! - [`LocalScheduler`] - Polling watch scheduler delivering callbacks on a channel
//! - [`LinkerPlugin`] - Person lifecycle notifications
//! - [`JobIdGenerator`] / [`YieldController`] - Cooperative yielding between contacts
//!
//! ## Example
//!
//! ```rust
//! use personlink_core::{Contact, DocumentStore, MemoryStore};
//! use personlink_engine::{LinkerConfig, LinkerContext, LocalScheduler};
//! use std::sync::Arc;
//!
//! # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
//! let store = Arc::new(MemoryStore::new());
//! let (scheduler, _fired) = LocalScheduler::new(store.clone());
//! let context = LinkerContext::new(store.clone(), Arc::new(scheduler), LinkerConfig::default());
//!
//! for email in ["kai@example.com", "KAI@example.com"] {
//!     let contact = Contact::new().with_email(email);
//!     store.put(vec![contact.to_document().unwrap()]).await.unwrap();
//! }
//!
//! let report = context.force_autolink().await.unwrap();
//! assert_eq!(report.processed, 2);
//! # });
//! ```

pub mod autolinker;
pub mod config;
pub mod jobs;
pub mod plugins;
pub mod scheduler;
pub mod service;
pub mod watermark;

pub use autolinker::{Autolinker, LinkAction, PassOutcome, PassReport, SavedPerson};
pub use config::LinkerConfig;
pub use jobs::{JobIdGenerator, YieldController, JOB_ID_SPACE};
pub use plugins::{LinkerPlugin, LoggingPlugin, PluginDispatcher, PluginEvent, RecordingPlugin};
pub use scheduler::{
    ActivityDescriptor, ActivityFired, ActivityId, CompleteRequest, LocalScheduler, Scheduler,
    WatchCallback, LINKER_WATCH,
};
pub use service::{LinkerContext, ManualLinkResult, ManualUnlinkResult};
pub use watermark::{WatchRevisionNumber, WatermarkStore};
