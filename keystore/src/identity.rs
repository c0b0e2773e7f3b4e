//! Canonical identity encoding.
//!
//! Every table keys peer data by the canonical byte form of the peer's
//! identity public key. The encoding must collide exactly with the raw byte
//! strings the crypto layer presents, so it is defined as the key's 32-byte
//! wire form and nothing else.

use x25519_dalek::PublicKey;

/// Byte length of a canonical identity.
pub const IDENTITY_LEN: usize = 32;

/// Returns the canonical byte identity for a public key.
pub fn canonical(public_key: &PublicKey) -> Vec<u8> {
    public_key.as_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use x25519_dalek::StaticSecret;

    #[test]
    fn canonical_form_is_the_wire_form() {
        let secret = StaticSecret::random_from_rng(rand_core::OsRng);
        let public = PublicKey::from(&secret);

        let id = canonical(&public);
        assert_eq!(id.len(), IDENTITY_LEN);
        assert_eq!(id, public.as_bytes().to_vec());
        // Stable across calls.
        assert_eq!(id, canonical(&public));
    }
}
