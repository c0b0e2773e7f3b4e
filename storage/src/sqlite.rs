//! SQLite connection wrapper with optional SQLCipher at-rest encryption.

use std::fmt;
use std::path::Path;

use rusqlite::Connection;
use zeroize::Zeroizing;

use crate::StorageError;

/// Configuration for SQLite storage.
#[derive(Clone)]
pub enum StorageConfig {
    /// In-memory database (isolated, for simple testing).
    InMemory,
    /// Shared in-memory database with a name (multiple connections share data).
    /// Use this when you need multiple storage instances to share the same in-memory DB.
    SharedInMemory(String),
    /// File-based SQLite database, unencrypted.
    File(String),
    /// SQLCipher encrypted database keyed by a passphrase.
    Encrypted {
        path: String,
        key: Zeroizing<String>,
    },
}

impl fmt::Debug for StorageConfig {
    // Manual impl so the passphrase never reaches log output.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageConfig::InMemory => f.write_str("InMemory"),
            StorageConfig::SharedInMemory(name) => {
                f.debug_tuple("SharedInMemory").field(name).finish()
            }
            StorageConfig::File(path) => f.debug_tuple("File").field(path).finish(),
            StorageConfig::Encrypted { path, .. } => f
                .debug_struct("Encrypted")
                .field("path", path)
                .field("key", &"<redacted>")
                .finish(),
        }
    }
}

/// SQLite database wrapper.
///
/// This provides the core database connection and can be shared
/// across different domain-specific storage implementations.
#[derive(Debug)]
pub struct SqliteDb {
    conn: Connection,
}

impl SqliteDb {
    /// Creates a new SQLite database with the given configuration.
    ///
    /// For [`StorageConfig::Encrypted`] the SQLCipher key pragma is applied
    /// before any other statement, and the schema header is probed so that a
    /// wrong passphrase or an unreadable file fails here rather than on the
    /// first query.
    pub fn new(config: StorageConfig) -> Result<Self, StorageError> {
        let conn = match config {
            StorageConfig::InMemory => Connection::open_in_memory()?,
            StorageConfig::SharedInMemory(ref name) => {
                // URI mode creates a named in-memory database; connections
                // opened with the same name share the same data.
                let uri = format!("file:{}?mode=memory&cache=shared", name);
                Connection::open_with_flags(
                    &uri,
                    rusqlite::OpenFlags::SQLITE_OPEN_URI
                        | rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                        | rusqlite::OpenFlags::SQLITE_OPEN_CREATE,
                )?
            }
            StorageConfig::File(ref path) => Connection::open(path)?,
            StorageConfig::Encrypted { ref path, ref key } => {
                let conn = Connection::open(path)?;
                conn.pragma_update(None, "key", key.as_str())?;
                conn.query_row("SELECT count(*) FROM sqlite_master", [], |_| Ok(()))
                    .map_err(|e| StorageError::Unreadable(e.to_string()))?;
                conn
            }
        };

        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        Ok(Self { conn })
    }

    /// Opens an unencrypted database file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        Self::new(StorageConfig::File(
            path.as_ref().to_string_lossy().into_owned(),
        ))
    }

    /// Creates an in-memory database (useful for testing).
    pub fn in_memory() -> Result<Self, StorageError> {
        Self::new(StorageConfig::InMemory)
    }

    /// Opens a SQLCipher encrypted database file.
    pub fn sqlcipher(path: &str, key: &str) -> Result<Self, StorageError> {
        Self::new(StorageConfig::Encrypted {
            path: path.to_string(),
            key: Zeroizing::new(key.to_string()),
        })
    }

    /// Returns a reference to the underlying connection.
    ///
    /// Use this for domain-specific storage operations.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Begins a transaction.
    pub fn transaction(&mut self) -> Result<rusqlite::Transaction<'_>, StorageError> {
        Ok(self.conn.transaction()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_in_memory() {
        let db = SqliteDb::in_memory().unwrap();
        db.connection()
            .execute_batch("CREATE TABLE t (x INTEGER);")
            .unwrap();
    }

    #[test]
    fn encrypted_reopen_with_same_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("enc.db");
        let path = path.to_str().unwrap();

        {
            let db = SqliteDb::sqlcipher(path, "passphrase").unwrap();
            db.connection()
                .execute_batch("CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (1);")
                .unwrap();
        }

        let db = SqliteDb::sqlcipher(path, "passphrase").unwrap();
        let x: i64 = db
            .connection()
            .query_row("SELECT x FROM t", [], |row| row.get(0))
            .unwrap();
        assert_eq!(x, 1);
    }

    #[test]
    fn encrypted_open_with_wrong_key_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("enc.db");
        let path = path.to_str().unwrap();

        {
            let db = SqliteDb::sqlcipher(path, "correct").unwrap();
            db.connection()
                .execute_batch("CREATE TABLE t (x INTEGER);")
                .unwrap();
        }

        let err = SqliteDb::sqlcipher(path, "wrong").unwrap_err();
        assert!(matches!(err, StorageError::Unreadable(_)));
    }

    #[test]
    fn debug_output_redacts_key() {
        let config = StorageConfig::Encrypted {
            path: "/tmp/x.db".to_string(),
            key: Zeroizing::new("super-secret".to_string()),
        };
        let printed = format!("{:?}", config);
        assert!(!printed.contains("super-secret"));
        assert!(printed.contains("<redacted>"));
    }
}
