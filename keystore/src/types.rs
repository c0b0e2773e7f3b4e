//! Value types exchanged with the persistence layer.
//!
//! The store treats key material as opaque bytes; nothing here is interpreted
//! cryptographically.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// One installation's published signed pre-key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPreKeyRecord {
    /// The public signed pre-key. Doubles as the bundle id for the row.
    pub signed_pre_key: Vec<u8>,
    /// Monotonically increasing per (identity, installation); the largest
    /// version is the current one.
    pub version: u32,
}

/// A pre-key bundle published by one identity, keyed by installation id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bundle {
    /// Canonical identity bytes of the publisher.
    pub identity: Vec<u8>,
    /// Per-installation signed pre-key records.
    pub signed_pre_keys: HashMap<String, SignedPreKeyRecord>,
    /// Signature over the bundle by the identity key, stored opaquely.
    pub signature: Vec<u8>,
    /// Creation time reported by the publisher.
    pub timestamp: i64,
}

/// A bundle together with the private half of its signed pre-key.
///
/// This is the shape in which one's own freshly generated bundles arrive;
/// peers' bundles never carry the private half.
#[derive(Clone)]
pub struct BundleContainer {
    pub bundle: Bundle,
    pub private_signed_pre_key: Vec<u8>,
}

impl BundleContainer {
    pub fn new(bundle: Bundle, private_signed_pre_key: Vec<u8>) -> Self {
        Self {
            bundle,
            private_signed_pre_key,
        }
    }
}

impl fmt::Debug for BundleContainer {
    // Manually implemented so the private pre-key never reaches log output.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BundleContainer")
            .field("bundle", &self.bundle)
            .finish_non_exhaustive()
    }
}

/// Per-session ratchet initialization state.
#[derive(Clone, PartialEq, Eq)]
pub struct RatchetInfo {
    /// Stable row id, derived from (bundle id, identity, installation id).
    pub id: Vec<u8>,
    /// Root key for the ratchet.
    pub sk: Vec<u8>,
    /// Private half of the originating bundle; present only when the bundle
    /// was one of our own.
    pub private_key: Option<Vec<u8>>,
    /// Canonical identity bytes of the remote peer.
    pub identity: Vec<u8>,
    /// The signed pre-key that identifies the originating bundle.
    pub bundle_id: Vec<u8>,
    /// Public half of the originating bundle's signed pre-key.
    pub public_key: Vec<u8>,
    /// The ratchet ephemeral public key.
    pub ephemeral_key: Vec<u8>,
    pub installation_id: String,
}

impl fmt::Debug for RatchetInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RatchetInfo")
            .field("id", &hex::encode(&self.id))
            .field("identity", &hex::encode(&self.identity))
            .field("bundle_id", &hex::encode(&self.bundle_id))
            .field("installation_id", &self.installation_id)
            .field("sk", &"<redacted>")
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_container() -> BundleContainer {
        let mut signed_pre_keys = HashMap::new();
        signed_pre_keys.insert(
            "1".to_string(),
            SignedPreKeyRecord {
                signed_pre_key: vec![1, 2, 3],
                version: 0,
            },
        );
        BundleContainer::new(
            Bundle {
                identity: vec![9; 32],
                signed_pre_keys,
                signature: vec![4, 5, 6],
                timestamp: 1,
            },
            b"very-secret-pre-key".to_vec(),
        )
    }

    #[test]
    fn container_debug_redacts_private_key() {
        let printed = format!("{:?}", test_container());
        assert!(!printed.contains("very-secret"));
        assert!(!printed.contains("118")); // no byte dump of the secret either
    }

    #[test]
    fn ratchet_info_debug_redacts_secrets() {
        let info = RatchetInfo {
            id: vec![1],
            sk: b"root-key-material".to_vec(),
            private_key: Some(b"private-half".to_vec()),
            identity: vec![2],
            bundle_id: vec![3],
            public_key: vec![3],
            ephemeral_key: vec![4],
            installation_id: "1".to_string(),
        };
        let printed = format!("{:?}", info);
        assert!(!printed.contains("root-key-material"));
        assert!(!printed.contains("private-half"));
        assert!(printed.contains("<redacted>"));
    }
}
