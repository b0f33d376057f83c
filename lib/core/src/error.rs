use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    #[error("Person not found: {0}")]
    PersonNotFound(String),

    #[error("Contact not found: {0}")]
    ContactNotFound(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    #[error("Contact has no identity fields to derive a link hash from: {0}")]
    MissingLinkHash(String),

    #[error("Invariant violated: {0}")]
    Invariant(String),

    #[error("An autolink pass is already running")]
    AutolinkRunning,

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl Error {
    /// True for errors caused by the caller rather than by the engine or the store.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidParameter(_)
                | Error::PersonNotFound(_)
                | Error::ContactNotFound(_)
                | Error::DocumentNotFound(_)
        )
    }
}
