//! # personlink
//!
//! Groups synced contact records into persons, one per real-world identity.
//!
//! Each changed contact is scored against existing persons by name, phone,
//! email and IM overlap. Manual link and unlink decisions made by the user
//! are kept in a ledger and override the scoring on every later pass.
//!
//! ## Quick Start
//!
//! ### As a Server
//!
//! ```bash
//! personlink --data-dir ./data --http-port 6340
//! curl -X POST localhost:6340/forceAutolink
//! ```
//!
//! ### As a Library
//!
//! ```rust,no_run
//! use personlink::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<()> {
//! let storage = Arc::new(StorageManager::open("./data")?);
//! let (scheduler, _fired) = LocalScheduler::new(storage.clone());
//! let context = LinkerContext::new(storage.clone(), Arc::new(scheduler), LinkerConfig::default());
//!
//! storage
//!     .put(vec![Contact::new().with_email("ada@example.com").to_document()?])
//!     .await?;
//! let report = context.force_autolink().await?;
//! println!("linked {} contacts", report.processed);
//! # Ok(())
//! # }
//! ```
//!
//! ## Crate Structure
//!
//! - `personlink-core` - Contacts, persons, link hashes, the document store contract
//! - `personlink-similarity` - Similarity rules and the scorer
//! - `personlink-ledger` - Manual link and unlink records
//! - `personlink-storage` - Durable store (WAL and snapshots)
//! - `personlink-engine` - Autolinker, scheduler, plugins and the linker context
//! - `personlink-api` - REST API

// Re-export core types
pub use personlink_core::{
    Contact, CurrentPerson, DocumentStore, Error, FilterCondition, ListSortOrder, MemoryStore,
    Person, PhoneType, Query, Result,
};

pub use personlink_similarity::{SimilarityScorer, WeightMap};

pub use personlink_ledger::ManualLinkLedger;

// Re-export storage
pub use personlink_storage::StorageManager;

pub use personlink_engine::{
    Autolinker, LinkerConfig, LinkerContext, LinkerPlugin, LocalScheduler, LoggingPlugin,
    PassOutcome, PassReport,
};

// Re-export API
pub use personlink_api::RestApi;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        Contact, DocumentStore, Error, LinkerConfig, LinkerContext, LocalScheduler, MemoryStore,
        PassOutcome, PassReport, Person, PhoneType, Query, Result, RestApi, StorageManager,
    };
}
