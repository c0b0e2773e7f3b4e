use thiserror::Error;

/// Common storage errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// The file could not be read as a database: wrong passphrase or a
    /// corrupt/foreign file at the configured path.
    #[error("cannot read database: {0}")]
    Unreadable(String),
}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError::Database(e.to_string())
    }
}
