//! Schema and migrations for the key store tables.
//!
//! Migrations are forward-only and gated on `PRAGMA user_version`; each step
//! is idempotent DDL, so reopening an already-migrated store is a no-op.

use storage::{Connection, RusqliteError};

use crate::error::PersistenceError;

const V1: &str = "
    -- Our own bundles: the private half of each published signed pre-key.
    -- The private key is sealed with the field-encryption key; the nonce
    -- column carries the AEAD nonce used for that row.
    CREATE TABLE IF NOT EXISTS private_bundles (
        bundle_id BLOB PRIMARY KEY,
        identity BLOB NOT NULL,
        installation_id TEXT NOT NULL,
        private_key BLOB NOT NULL,
        private_key_nonce BLOB NOT NULL,
        timestamp INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_private_bundles_identity
        ON private_bundles(identity, installation_id);

    -- Peers' bundles, one row per published (identity, installation, version)
    -- generation. Lower-version and duplicate rows coexist; selection picks
    -- the current one.
    CREATE TABLE IF NOT EXISTS public_bundles (
        identity BLOB NOT NULL,
        installation_id TEXT NOT NULL,
        version INTEGER NOT NULL,
        signed_pre_key BLOB NOT NULL,
        signature BLOB NOT NULL,
        timestamp INTEGER NOT NULL,
        UNIQUE(identity, installation_id, version, signed_pre_key)
    );

    CREATE INDEX IF NOT EXISTS idx_public_bundles_prekey
        ON public_bundles(signed_pre_key);

    -- Per-session ratchet initialization tuples. bundle_id is a weak
    -- reference into private_bundles/public_bundles, checked at write time.
    CREATE TABLE IF NOT EXISTS ratchet_info (
        id BLOB NOT NULL,
        identity BLOB NOT NULL,
        bundle_id BLOB NOT NULL,
        installation_id TEXT NOT NULL,
        symmetric_key BLOB NOT NULL,
        symmetric_key_nonce BLOB NOT NULL,
        private_key BLOB,
        private_key_nonce BLOB,
        ephemeral_key BLOB NOT NULL,
        UNIQUE(bundle_id, identity, installation_id)
    );

    CREATE INDEX IF NOT EXISTS idx_ratchet_info_identity
        ON ratchet_info(identity, installation_id);

    -- Known installations per identity. Rows are never deleted; the active
    -- window is computed at read time.
    CREATE TABLE IF NOT EXISTS installations (
        identity BLOB NOT NULL,
        installation_id TEXT NOT NULL,
        enabled INTEGER NOT NULL DEFAULT 1,
        timestamp INTEGER NOT NULL,
        PRIMARY KEY(identity, installation_id)
    );
";

const MIGRATIONS: &[&str] = &[V1];

/// Brings the store up to the current schema version.
///
/// Fails with [`PersistenceError::StoreUnavailable`] when the store was
/// written by a newer crate version.
pub(crate) fn apply(conn: &Connection) -> Result<(), PersistenceError> {
    let unavailable = |e: RusqliteError| PersistenceError::StoreUnavailable(e.to_string());

    let version: i64 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(unavailable)?;
    let current = MIGRATIONS.len() as i64;
    if version > current {
        return Err(PersistenceError::StoreUnavailable(format!(
            "schema version {version} is newer than the supported version {current}"
        )));
    }

    for (i, migration) in MIGRATIONS.iter().enumerate().skip(version as usize) {
        let tx = conn.unchecked_transaction().map_err(unavailable)?;
        tx.execute_batch(migration).map_err(unavailable)?;
        tx.pragma_update(None, "user_version", (i + 1) as i64)
            .map_err(unavailable)?;
        tx.commit().map_err(unavailable)?;
        tracing::debug!(version = i + 1, "applied schema migration");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        apply(&conn).unwrap();
        apply(&conn).unwrap();

        let version: i64 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, MIGRATIONS.len() as i64);
    }

    #[test]
    fn newer_store_is_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", 99_i64).unwrap();

        let err = apply(&conn).unwrap_err();
        assert!(matches!(err, PersistenceError::StoreUnavailable(_)));
    }
}
