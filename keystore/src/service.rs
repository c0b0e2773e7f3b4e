//! The persistence contract.

use x25519_dalek::PublicKey;

use crate::error::PersistenceError;
use crate::types::{Bundle, BundleContainer, RatchetInfo};

/// Durable state required to publish, consume, and resume encrypted sessions
/// across the installations of an identity.
///
/// All operations are synchronous and individually atomic: a write either
/// applies entirely or leaves the store as if the call never happened.
/// Missing values on reads are `Ok(None)`, never errors.
pub trait PersistenceService: Send + Sync {
    /// Stores one of our own bundles: the private half of each installation's
    /// signed pre-key, the public row peers would see, and the installation
    /// registration, all in one atomic scope. Idempotent on re-submission.
    fn add_private_bundle(&self, container: &BundleContainer) -> Result<(), PersistenceError>;

    /// Returns the private signed pre-key stored under `bundle_id`.
    fn get_private_key_bundle(&self, bundle_id: &[u8])
        -> Result<Option<Vec<u8>>, PersistenceError>;

    /// Reconstructs, in public form, the most recent of our own bundles for
    /// `identity`, restricted to the given installations.
    fn get_any_private_bundle(
        &self,
        identity: &[u8],
        installation_ids: &[&str],
    ) -> Result<Option<Bundle>, PersistenceError>;

    /// Stores a peer bundle, one row per installation record, and registers
    /// each installation as enabled. Re-adding an already-present row is a
    /// no-op; rows with other versions coexist.
    fn add_public_bundle(&self, bundle: &Bundle) -> Result<(), PersistenceError>;

    /// Returns one bundle holding, for each requested installation that has
    /// any row, its current (highest-version) record. Installations without
    /// rows are silently omitted.
    fn get_public_bundle(
        &self,
        identity_key: &PublicKey,
        installation_ids: &[&str],
    ) -> Result<Option<Bundle>, PersistenceError>;

    /// Records ratchet initialization state for a session.
    ///
    /// `bundle_id` is resolved against our own bundles first, then peers';
    /// if it is absent from both, the call fails with
    /// [`PersistenceError::BundleNotFound`]. A repeat call for the same
    /// (bundle, peer, installation) updates the symmetric and ephemeral keys
    /// in place.
    fn add_ratchet_info(
        &self,
        sk: &[u8],
        their_identity: &[u8],
        bundle_id: &[u8],
        ephemeral_key: &[u8],
        installation_id: &str,
    ) -> Result<(), PersistenceError>;

    /// Exact-key lookup of a ratchet tuple.
    fn get_ratchet_info(
        &self,
        bundle_id: &[u8],
        their_identity: &[u8],
        installation_id: &str,
    ) -> Result<Option<RatchetInfo>, PersistenceError>;

    /// Returns the most recently added ratchet tuple for the peer pair.
    fn get_any_ratchet_info(
        &self,
        their_identity: &[u8],
        installation_id: &str,
    ) -> Result<Option<RatchetInfo>, PersistenceError>;

    /// Creates or refreshes installation rows. The timestamp always updates;
    /// a previously disabled installation stays disabled regardless of
    /// `enabled`.
    fn add_installations(
        &self,
        identity: &[u8],
        timestamp: i64,
        installation_ids: &[&str],
        enabled: bool,
    ) -> Result<(), PersistenceError>;

    /// Returns up to `max_n` enabled installations for `identity`, windowed
    /// by recency and presented in lexicographic order. `None` when the
    /// active set is empty.
    fn get_active_installations(
        &self,
        max_n: usize,
        identity: &[u8],
    ) -> Result<Option<Vec<String>>, PersistenceError>;

    /// Marks an installation eligible for traffic again. Idempotent.
    fn enable_installation(
        &self,
        identity: &[u8],
        installation_id: &str,
    ) -> Result<(), PersistenceError>;

    /// Marks an installation ineligible for traffic. Idempotent; only
    /// [`enable_installation`](Self::enable_installation) reverses it.
    fn disable_installation(
        &self,
        identity: &[u8],
        installation_id: &str,
    ) -> Result<(), PersistenceError>;
}
