//! SQLCipher-backed persistence with field-level encryption for secrets.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use blake2::{Blake2s256, Digest};
use chacha20poly1305::{
    ChaCha20Poly1305, Nonce,
    aead::{Aead, KeyInit},
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use storage::{
    OptionalExtension, Row, RusqliteError, SqliteDb, StorageConfig, ToSql, Transaction, params,
};
use x25519_dalek::PublicKey;
use zeroize::Zeroizing;

use crate::error::PersistenceError;
use crate::identity;
use crate::schema;
use crate::service::PersistenceService;
use crate::types::{Bundle, BundleContainer, RatchetInfo, SignedPreKeyRecord};

/// Domain separation for deriving the field-encryption key from the store
/// passphrase.
const FIELD_KEY_INFO: &[u8] = b"keystore field encryption v1";

/// SQLCipher-backed [`PersistenceService`] implementation.
///
/// The database file is encrypted at rest; on top of that, private signed
/// pre-keys and ratchet symmetric keys are sealed per-row with
/// ChaCha20Poly1305 under a key derived from the passphrase, each row
/// carrying its own random nonce.
///
/// Every write operation runs as a single transaction; concurrent callers
/// serialize on the connection.
#[derive(Debug)]
pub struct SqlitePersistence {
    db: Mutex<SqliteDb>,
    field_key: Zeroizing<[u8; 32]>,
}

impl SqlitePersistence {
    /// Opens or creates the encrypted store at `path`, keyed by `key`.
    ///
    /// Reopening an existing store with the correct key upgrades its schema
    /// in place. A wrong key, an unreadable file, or a schema from a newer
    /// crate version fails with [`PersistenceError::StoreUnavailable`].
    pub fn open<P: AsRef<Path>>(path: P, key: &str) -> Result<Self, PersistenceError> {
        let path = path.as_ref().to_string_lossy().into_owned();
        tracing::debug!(%path, "opening key store");
        let db = SqliteDb::new(StorageConfig::Encrypted {
            path,
            key: Zeroizing::new(key.to_string()),
        })?;
        Self::initialize(db, key)
    }

    /// Creates an in-memory store (for testing).
    pub fn open_in_memory(key: &str) -> Result<Self, PersistenceError> {
        let db = SqliteDb::in_memory()?;
        Self::initialize(db, key)
    }

    fn initialize(db: SqliteDb, key: &str) -> Result<Self, PersistenceError> {
        schema::apply(db.connection())?;
        Ok(Self {
            db: Mutex::new(db),
            field_key: derive_field_key(key),
        })
    }

    /// Encrypt a secret value, returning the ciphertext and the nonce used.
    fn encrypt_secret(&self, secret: &[u8]) -> Result<(Vec<u8>, [u8; 12]), PersistenceError> {
        let cipher = ChaCha20Poly1305::new((&*self.field_key).into());

        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, secret)
            .map_err(|e| PersistenceError::Encryption(e.to_string()))?;

        Ok((ciphertext, nonce_bytes))
    }

    /// Decrypt a secret value previously sealed by [`Self::encrypt_secret`].
    fn decrypt_secret(&self, ciphertext: &[u8], nonce: &[u8]) -> Result<Vec<u8>, PersistenceError> {
        if nonce.len() != 12 {
            return Err(PersistenceError::Corrupted(
                "stored nonce has wrong length".to_string(),
            ));
        }
        let cipher = ChaCha20Poly1305::new((&*self.field_key).into());

        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| PersistenceError::Decryption(e.to_string()))
    }

    /// Creates or refreshes one installation row within the caller's
    /// transaction. A row disabled by `disable_installation` keeps its flag;
    /// only the timestamp moves.
    fn upsert_installation(
        tx: &Transaction<'_>,
        identity: &[u8],
        installation_id: &str,
        timestamp: i64,
        enabled: bool,
    ) -> Result<(), PersistenceError> {
        let existing: Option<bool> = tx
            .query_row(
                "SELECT enabled FROM installations WHERE identity = ?1 AND installation_id = ?2",
                params![identity, installation_id],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            Some(false) => {
                tx.execute(
                    "UPDATE installations SET timestamp = ?3 \
                     WHERE identity = ?1 AND installation_id = ?2",
                    params![identity, installation_id, timestamp],
                )?;
            }
            Some(true) => {
                tx.execute(
                    "UPDATE installations SET enabled = ?3, timestamp = ?4 \
                     WHERE identity = ?1 AND installation_id = ?2",
                    params![identity, installation_id, enabled, timestamp],
                )?;
            }
            None => {
                tx.execute(
                    "INSERT INTO installations (identity, installation_id, enabled, timestamp) \
                     VALUES (?1, ?2, ?3, ?4)",
                    params![identity, installation_id, enabled, timestamp],
                )?;
            }
        }

        Ok(())
    }

    fn set_installation_enabled(
        &self,
        identity: &[u8],
        installation_id: &str,
        enabled: bool,
    ) -> Result<(), PersistenceError> {
        let db = self.db.lock().unwrap();
        db.connection().execute(
            "UPDATE installations SET enabled = ?3 \
             WHERE identity = ?1 AND installation_id = ?2",
            params![identity, installation_id, enabled],
        )?;
        Ok(())
    }

    fn decode_ratchet_row(&self, row: RatchetRow) -> Result<RatchetInfo, PersistenceError> {
        let (id, peer, bundle_id, installation_id, sk_ct, sk_nonce, pk_ct, pk_nonce, ephemeral_key) =
            row;

        let sk = self.decrypt_secret(&sk_ct, &sk_nonce)?;
        let private_key = match (pk_ct, pk_nonce) {
            (Some(ct), Some(nonce)) => Some(self.decrypt_secret(&ct, &nonce)?),
            (None, None) => None,
            _ => {
                return Err(PersistenceError::Corrupted(
                    "ratchet row has mismatched private-key columns".to_string(),
                ));
            }
        };

        Ok(RatchetInfo {
            id,
            sk,
            private_key,
            identity: peer,
            public_key: bundle_id.clone(),
            bundle_id,
            ephemeral_key,
            installation_id,
        })
    }
}

type RatchetRow = (
    Vec<u8>,         // id
    Vec<u8>,         // identity
    Vec<u8>,         // bundle_id
    String,          // installation_id
    Vec<u8>,         // symmetric_key
    Vec<u8>,         // symmetric_key_nonce
    Option<Vec<u8>>, // private_key
    Option<Vec<u8>>, // private_key_nonce
    Vec<u8>,         // ephemeral_key
);

const RATCHET_COLUMNS: &str = "id, identity, bundle_id, installation_id, \
     symmetric_key, symmetric_key_nonce, private_key, private_key_nonce, ephemeral_key";

fn read_ratchet_row(row: &Row<'_>) -> Result<RatchetRow, RusqliteError> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

impl PersistenceService for SqlitePersistence {
    fn add_private_bundle(&self, container: &BundleContainer) -> Result<(), PersistenceError> {
        let bundle = &container.bundle;
        let db = self.db.lock().unwrap();
        let tx = db.connection().unchecked_transaction()?;
        let now = current_timestamp();

        for (installation_id, record) in &bundle.signed_pre_keys {
            let (private_key, nonce) = self.encrypt_secret(&container.private_signed_pre_key)?;

            tx.execute(
                "INSERT OR IGNORE INTO private_bundles \
                 (bundle_id, identity, installation_id, private_key, private_key_nonce, timestamp) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.signed_pre_key,
                    bundle.identity,
                    installation_id,
                    private_key,
                    nonce.as_slice(),
                    bundle.timestamp,
                ],
            )?;

            // The public half is also a peer-visible bundle row.
            tx.execute(
                "INSERT OR IGNORE INTO public_bundles \
                 (identity, installation_id, version, signed_pre_key, signature, timestamp) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    bundle.identity,
                    installation_id,
                    record.version,
                    record.signed_pre_key,
                    bundle.signature,
                    bundle.timestamp,
                ],
            )?;

            Self::upsert_installation(&tx, &bundle.identity, installation_id, now, true)?;
        }

        tx.commit()?;
        Ok(())
    }

    fn get_private_key_bundle(
        &self,
        bundle_id: &[u8],
    ) -> Result<Option<Vec<u8>>, PersistenceError> {
        let db = self.db.lock().unwrap();

        let row: Option<(Vec<u8>, Vec<u8>)> = db
            .connection()
            .query_row(
                "SELECT private_key, private_key_nonce FROM private_bundles WHERE bundle_id = ?1",
                params![bundle_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match row {
            Some((ciphertext, nonce)) => Ok(Some(self.decrypt_secret(&ciphertext, &nonce)?)),
            None => Ok(None),
        }
    }

    fn get_any_private_bundle(
        &self,
        identity: &[u8],
        installation_ids: &[&str],
    ) -> Result<Option<Bundle>, PersistenceError> {
        if installation_ids.is_empty() {
            return Ok(None);
        }
        let db = self.db.lock().unwrap();

        let sql = format!(
            "SELECT p.installation_id, p.bundle_id, b.version, b.signature, p.timestamp \
             FROM private_bundles p \
             JOIN public_bundles b ON b.signed_pre_key = p.bundle_id \
                 AND b.identity = p.identity AND b.installation_id = p.installation_id \
             WHERE p.identity = ? AND p.installation_id IN ({}) \
             ORDER BY p.timestamp DESC, p.rowid DESC",
            placeholders(installation_ids.len())
        );
        let mut stmt = db.connection().prepare(&sql)?;

        let mut sql_params: Vec<&dyn ToSql> = Vec::with_capacity(installation_ids.len() + 1);
        sql_params.push(&identity);
        for id in installation_ids {
            sql_params.push(id);
        }

        let rows = stmt.query_map(sql_params.as_slice(), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Vec<u8>>(1)?,
                row.get::<_, u32>(2)?,
                row.get::<_, Vec<u8>>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;

        collect_bundle(identity.to_vec(), rows)
    }

    fn add_public_bundle(&self, bundle: &Bundle) -> Result<(), PersistenceError> {
        let db = self.db.lock().unwrap();
        let tx = db.connection().unchecked_transaction()?;
        let now = current_timestamp();

        for (installation_id, record) in &bundle.signed_pre_keys {
            tx.execute(
                "INSERT OR IGNORE INTO public_bundles \
                 (identity, installation_id, version, signed_pre_key, signature, timestamp) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    bundle.identity,
                    installation_id,
                    record.version,
                    record.signed_pre_key,
                    bundle.signature,
                    bundle.timestamp,
                ],
            )?;

            Self::upsert_installation(&tx, &bundle.identity, installation_id, now, true)?;
        }

        tx.commit()?;
        Ok(())
    }

    fn get_public_bundle(
        &self,
        identity_key: &PublicKey,
        installation_ids: &[&str],
    ) -> Result<Option<Bundle>, PersistenceError> {
        if installation_ids.is_empty() {
            return Ok(None);
        }
        let identity = identity::canonical(identity_key);
        let db = self.db.lock().unwrap();

        // Best row first; among equal versions the later write wins.
        let sql = format!(
            "SELECT installation_id, signed_pre_key, version, signature, timestamp \
             FROM public_bundles \
             WHERE identity = ? AND installation_id IN ({}) \
             ORDER BY version DESC, timestamp DESC, rowid DESC",
            placeholders(installation_ids.len())
        );
        let mut stmt = db.connection().prepare(&sql)?;

        let mut sql_params: Vec<&dyn ToSql> = Vec::with_capacity(installation_ids.len() + 1);
        sql_params.push(&identity);
        for id in installation_ids {
            sql_params.push(id);
        }

        let rows = stmt.query_map(sql_params.as_slice(), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Vec<u8>>(1)?,
                row.get::<_, u32>(2)?,
                row.get::<_, Vec<u8>>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;

        collect_bundle(identity, rows)
    }

    fn add_ratchet_info(
        &self,
        sk: &[u8],
        their_identity: &[u8],
        bundle_id: &[u8],
        ephemeral_key: &[u8],
        installation_id: &str,
    ) -> Result<(), PersistenceError> {
        let db = self.db.lock().unwrap();
        let tx = db.connection().unchecked_transaction()?;

        // Resolve the referenced bundle, own side first.
        let private: Option<(Vec<u8>, Vec<u8>)> = tx
            .query_row(
                "SELECT private_key, private_key_nonce FROM private_bundles WHERE bundle_id = ?1",
                params![bundle_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        if private.is_none() {
            let known: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM public_bundles WHERE signed_pre_key = ?1 LIMIT 1",
                    params![bundle_id],
                    |row| row.get(0),
                )
                .optional()?;
            if known.is_none() {
                return Err(PersistenceError::BundleNotFound(bundle_id.to_vec()));
            }
        }

        let id = ratchet_row_id(bundle_id, their_identity, installation_id);
        let (sk_ct, sk_nonce) = self.encrypt_secret(sk)?;
        // The sealed private key is copied as-is; it stays under its
        // original nonce.
        let (private_key, private_key_nonce) = match private {
            Some((ct, nonce)) => (Some(ct), Some(nonce)),
            None => (None, None),
        };

        tx.execute(
            "INSERT INTO ratchet_info \
             (id, identity, bundle_id, installation_id, symmetric_key, symmetric_key_nonce, \
              private_key, private_key_nonce, ephemeral_key) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
             ON CONFLICT(bundle_id, identity, installation_id) DO UPDATE SET \
                 symmetric_key = excluded.symmetric_key, \
                 symmetric_key_nonce = excluded.symmetric_key_nonce, \
                 ephemeral_key = excluded.ephemeral_key",
            params![
                id,
                their_identity,
                bundle_id,
                installation_id,
                sk_ct,
                sk_nonce.as_slice(),
                private_key,
                private_key_nonce,
                ephemeral_key,
            ],
        )?;

        tx.commit()?;
        tracing::trace!(installation_id, "stored ratchet info");
        Ok(())
    }

    fn get_ratchet_info(
        &self,
        bundle_id: &[u8],
        their_identity: &[u8],
        installation_id: &str,
    ) -> Result<Option<RatchetInfo>, PersistenceError> {
        let db = self.db.lock().unwrap();

        let row = db
            .connection()
            .query_row(
                &format!(
                    "SELECT {RATCHET_COLUMNS} FROM ratchet_info \
                     WHERE bundle_id = ?1 AND identity = ?2 AND installation_id = ?3"
                ),
                params![bundle_id, their_identity, installation_id],
                read_ratchet_row,
            )
            .optional()?;

        row.map(|r| self.decode_ratchet_row(r)).transpose()
    }

    fn get_any_ratchet_info(
        &self,
        their_identity: &[u8],
        installation_id: &str,
    ) -> Result<Option<RatchetInfo>, PersistenceError> {
        let db = self.db.lock().unwrap();

        let row = db
            .connection()
            .query_row(
                &format!(
                    "SELECT {RATCHET_COLUMNS} FROM ratchet_info \
                     WHERE identity = ?1 AND installation_id = ?2 \
                     ORDER BY rowid DESC LIMIT 1"
                ),
                params![their_identity, installation_id],
                read_ratchet_row,
            )
            .optional()?;

        row.map(|r| self.decode_ratchet_row(r)).transpose()
    }

    fn add_installations(
        &self,
        identity: &[u8],
        timestamp: i64,
        installation_ids: &[&str],
        enabled: bool,
    ) -> Result<(), PersistenceError> {
        let db = self.db.lock().unwrap();
        let tx = db.connection().unchecked_transaction()?;

        for installation_id in installation_ids {
            Self::upsert_installation(&tx, identity, installation_id, timestamp, enabled)?;
        }

        tx.commit()?;
        Ok(())
    }

    fn get_active_installations(
        &self,
        max_n: usize,
        identity: &[u8],
    ) -> Result<Option<Vec<String>>, PersistenceError> {
        let db = self.db.lock().unwrap();

        let mut stmt = db.connection().prepare(
            "SELECT installation_id FROM installations \
             WHERE identity = ?1 AND enabled = 1 \
             ORDER BY timestamp DESC, installation_id ASC \
             LIMIT ?2",
        )?;
        let mut ids: Vec<String> = stmt
            .query_map(params![identity, max_n as i64], |row| row.get(0))?
            .collect::<Result<_, _>>()?;

        if ids.is_empty() {
            return Ok(None);
        }

        // The window is selected by recency; the projection is presented
        // sorted.
        ids.sort_unstable();
        Ok(Some(ids))
    }

    fn enable_installation(
        &self,
        identity: &[u8],
        installation_id: &str,
    ) -> Result<(), PersistenceError> {
        self.set_installation_enabled(identity, installation_id, true)
    }

    fn disable_installation(
        &self,
        identity: &[u8],
        installation_id: &str,
    ) -> Result<(), PersistenceError> {
        self.set_installation_enabled(identity, installation_id, false)
    }
}

/// Folds best-first rows into one bundle, keeping the first record seen per
/// installation. The bundle-level signature and timestamp come from the
/// newest kept row.
fn collect_bundle<I>(identity: Vec<u8>, rows: I) -> Result<Option<Bundle>, PersistenceError>
where
    I: Iterator<Item = Result<(String, Vec<u8>, u32, Vec<u8>, i64), RusqliteError>>,
{
    let mut signed_pre_keys = HashMap::new();
    let mut signature = Vec::new();
    let mut timestamp = 0_i64;

    for row in rows {
        let (installation_id, signed_pre_key, version, row_signature, row_timestamp) = row?;
        if signed_pre_keys.contains_key(&installation_id) {
            continue;
        }
        if signed_pre_keys.is_empty() {
            signature = row_signature;
        }
        if row_timestamp > timestamp {
            timestamp = row_timestamp;
        }
        signed_pre_keys.insert(
            installation_id,
            SignedPreKeyRecord {
                signed_pre_key,
                version,
            },
        );
    }

    if signed_pre_keys.is_empty() {
        return Ok(None);
    }

    Ok(Some(Bundle {
        identity,
        signed_pre_keys,
        signature,
        timestamp,
    }))
}

/// Stable content-derived id for a ratchet row.
fn ratchet_row_id(bundle_id: &[u8], identity: &[u8], installation_id: &str) -> Vec<u8> {
    let mut hasher = Blake2s256::new();
    // Length-prefixed so adjacent fields cannot alias.
    for part in [bundle_id, identity, installation_id.as_bytes()] {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    hasher.finalize().to_vec()
}

fn derive_field_key(passphrase: &str) -> Zeroizing<[u8; 32]> {
    let hk = Hkdf::<Sha256>::new(None, passphrase.as_bytes());
    let mut key = Zeroizing::new([0u8; 32]);
    hk.expand(FIELD_KEY_INFO, key.as_mut_slice())
        .expect("32 bytes is a valid HKDF output length");
    key
}

fn current_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_store() -> SqlitePersistence {
        SqlitePersistence::open_in_memory("test-passphrase").unwrap()
    }

    #[test]
    fn secret_round_trip() {
        let store = create_test_store();
        let secret = b"private-signed-pre-key";

        let (ciphertext, nonce) = store.encrypt_secret(secret).unwrap();
        assert_ne!(ciphertext.as_slice(), secret.as_slice());

        let plaintext = store.decrypt_secret(&ciphertext, &nonce).unwrap();
        assert_eq!(plaintext, secret);
    }

    #[test]
    fn encryption_uses_fresh_nonces() {
        let store = create_test_store();

        let (ct1, nonce1) = store.encrypt_secret(b"secret").unwrap();
        let (ct2, nonce2) = store.encrypt_secret(b"secret").unwrap();

        assert_ne!(nonce1, nonce2);
        assert_ne!(ct1, ct2);
    }

    #[test]
    fn decrypt_rejects_bad_nonce_length() {
        let store = create_test_store();
        let (ciphertext, _) = store.encrypt_secret(b"secret").unwrap();

        let err = store.decrypt_secret(&ciphertext, &[0u8; 3]).unwrap_err();
        assert!(matches!(err, PersistenceError::Corrupted(_)));
    }

    #[test]
    fn field_keys_differ_per_passphrase() {
        let a = derive_field_key("one");
        let b = derive_field_key("two");
        assert_ne!(*a, *b);
    }

    #[test]
    fn ratchet_row_id_is_stable_and_distinct() {
        let id = ratchet_row_id(b"bundle", b"peer", "1");
        assert_eq!(id, ratchet_row_id(b"bundle", b"peer", "1"));
        assert_eq!(id.len(), 32);

        assert_ne!(id, ratchet_row_id(b"bundle", b"peer", "2"));
        // Field boundaries matter.
        assert_ne!(id, ratchet_row_id(b"bundlep", b"eer", "1"));
    }

    #[test]
    fn wrong_passphrase_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.db");

        drop(SqlitePersistence::open(&path, "correct").unwrap());

        let err = SqlitePersistence::open(&path, "wrong").unwrap_err();
        assert!(matches!(err, PersistenceError::StoreUnavailable(_)));
    }
}
