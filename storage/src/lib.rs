//! Shared storage layer for the keystore workspace.
//!
//! Provides a thin connection wrapper over SQLite that domain crates build
//! their tables and queries on top of.
//!
//! Uses SQLCipher for encrypted at-rest storage.

mod error;
mod sqlite;

pub use error::StorageError;
pub use sqlite::{SqliteDb, StorageConfig};

// Re-export rusqlite types that domain crates will need
pub use rusqlite::{
    Connection, Error as RusqliteError, OptionalExtension, Row, ToSql, Transaction, params,
};
