//! Persistent key store for multi-device end-to-end encrypted messaging.
//!
//! This crate holds the durable state a messaging client needs around session
//! establishment: its own pre-key bundles (public and private halves), the
//! latest pre-key bundles published by each installation of its peers, the
//! per-session ratchet initialization tuples, and the set of peer
//! installations currently eligible to receive traffic.
//!
//! # Main API
//!
//! - [`PersistenceService`] - the storage contract
//! - [`SqlitePersistence`] - SQLCipher-backed implementation with field-level
//!   encryption for private keys
//!
//! # Security
//!
//! The database file is encrypted at rest with SQLCipher, keyed by the
//! passphrase supplied at open time. Private signed pre-keys and ratchet
//! symmetric keys are additionally encrypted with ChaCha20Poly1305 under a
//! key derived from the same passphrase, so secrets stay sealed even in
//! database dumps.
//!
//! # Example
//!
//! ```no_run
//! use keystore::{PersistenceService, SqlitePersistence};
//!
//! let store = SqlitePersistence::open("keys.db", "correct horse battery staple").unwrap();
//! store
//!     .add_installations(b"peer-identity", 1, &["laptop", "phone"], true)
//!     .unwrap();
//! let active = store.get_active_installations(3, b"peer-identity").unwrap();
//! assert_eq!(active.unwrap().len(), 2);
//! ```

mod error;
pub mod identity;
mod schema;
mod service;
mod sqlite;
mod types;

pub use error::PersistenceError;
pub use service::PersistenceService;
pub use sqlite::SqlitePersistence;
pub use types::{Bundle, BundleContainer, RatchetInfo, SignedPreKeyRecord};
