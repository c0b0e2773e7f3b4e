//! Error types for the persistence layer.

use storage::{RusqliteError, StorageError};
use thiserror::Error;

/// Errors surfaced by [`PersistenceService`](crate::PersistenceService)
/// operations.
///
/// A missing value on a read is never an error; those operations return
/// `Ok(None)`.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// The store could not be opened: missing or corrupt file, wrong
    /// passphrase, failed migration, or a schema newer than this crate
    /// supports.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// A ratchet tuple referenced a bundle id absent from both bundle tables.
    #[error("bundle not found: {}", hex::encode(.0))]
    BundleNotFound(Vec<u8>),

    /// Database operation failed.
    #[error("database error: {0}")]
    Database(#[from] RusqliteError),

    /// Field-level encryption failed.
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Field-level decryption failed.
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// A stored row is malformed.
    #[error("corrupted record: {0}")]
    Corrupted(String),
}

// Substrate errors only arise while opening the store.
impl From<StorageError> for PersistenceError {
    fn from(e: StorageError) -> Self {
        PersistenceError::StoreUnavailable(e.to_string())
    }
}
