//! # personlink Core
//!
//! Core data model for the personlink contact linker.
//!
//! This crate provides the records the linker reads and writes, plus the
//! contract of the document store it runs against:
//!
//! - [`Contact`] - A single synced contact record
//! - [`Person`] - An identity aggregating linked contacts
//! - [`link_hash`] - Versioned identity hashes used by the manual-link ledger
//! - [`PhoneNumberComparator`] - Opaque phone parsing and comparison
//! - [`DocumentStore`] - Async find/get/put/merge/del contract
//! - [`MemoryStore`] - In-memory implementation of the store
//!
//! ## Example
//!
//! ```rust
//! use personlink_core::{Contact, DocumentStore, MemoryStore, PhoneType, Query};
//!
//! # tokio_test_block(async {
//! let store = MemoryStore::new();
//! let contact = Contact::new()
//!     .with_name("Ada", "Lovelace")
//!     .with_phone("+1 555 0100", PhoneType::Mobile);
//! store.put(vec![contact.to_document().unwrap()]).await.unwrap();
//!
//! let found = store.find(&Query::new("contact")).await.unwrap();
//! assert_eq!(found.results.len(), 1);
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
//! # }
//! ```

pub mod contact;
pub mod error;
pub mod filter;
pub mod link_hash;
pub mod memory;
pub mod person;
pub mod phone;
pub mod store;

pub use contact::{Address, Contact, Name, Organization, PhoneNumber, PhoneType};
pub use error::{Error, Result};
pub use filter::{Filter, FilterCondition, Query};
pub use memory::MemoryStore;
pub use person::{ListSortOrder, Person};
pub use phone::{DigitComparator, ParsedPhoneNumber, PhoneNumberComparator};
pub use store::{
    BatchOperation, BatchResponse, DocumentStore, FindResult, PutResult, DEFAULT_PAGE_SIZE,
};

/// Whether `contact` is attached to a person yet.
#[derive(Debug, Clone, PartialEq)]
pub enum CurrentPerson {
    NoCurrentPerson,
    AttachedTo(Person),
}

impl CurrentPerson {
    pub fn person(&self) -> Option<&Person> {
        match self {
            CurrentPerson::NoCurrentPerson => None,
            CurrentPerson::AttachedTo(person) => Some(person),
        }
    }

    pub fn person_id(&self) -> Option<&str> {
        self.person().and_then(|p| p.id.as_deref())
    }
}
