//! Durable persistence: the archival record store and the dead-letter log
//!
//! The SQLite archive is the source of truth for the whole system; the query
//! index is a derived view rebuilt from it. Dead-lettered payloads go to an
//! append-only JSONL file so a malformed item never blocks its batch.

pub mod dead_letter;
pub mod durable;

pub use dead_letter::{DeadLetterEntry, DeadLetterLog};
pub use durable::{BacklogEntry, CommitSummary, DurableStore};

#[derive(Debug)]
pub enum StoreError {
    /// Transient storage failure; the batch is retried as a unit
    StorageUnavailable(String),
    /// The batch violates a storage constraint; retried then fatal
    ConstraintViolation(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, _)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::ConstraintViolation(err.to_string())
            }
            _ => StoreError::StorageUnavailable(err.to_string()),
        }
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::StorageUnavailable(msg) => write!(f, "storage unavailable: {}", msg),
            StoreError::ConstraintViolation(msg) => write!(f, "constraint violation: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}
