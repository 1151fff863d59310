//! `SQLite`-backed chain persistence.
//!
//! Append-only storage of canonical breadcrumb encodings, keyed by
//! `(identity, index)`, in WAL mode for concurrent reads. Recovery
//! replays every stored record through the full chain validator, so a
//! restored chain reproduces exactly the verdicts of the original given
//! the same configuration.
//!
//! Mutex poisoning indicates a panic in another thread, which is
//! unrecoverable.

#![allow(clippy::missing_panics_doc)]

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;

use crate::breadcrumb::{Breadcrumb, IdentityKey};
use crate::chain::{Chain, ChainError};
use crate::config::ChainConfig;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS breadcrumbs (
    identity    BLOB    NOT NULL,
    idx         INTEGER NOT NULL,
    timestamp   INTEGER NOT NULL,
    payload     BLOB    NOT NULL,
    block_hash  BLOB    NOT NULL,
    PRIMARY KEY (identity, idx)
) WITHOUT ROWID;
";

/// Errors from chain persistence.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Attempted to overwrite an existing record.
    #[error("append-only violation at index {index}")]
    AppendOnlyViolation {
        /// The index that already exists.
        index: u64,
    },

    /// A stored record failed revalidation on load.
    #[error("stored chain failed revalidation: {0}")]
    Revalidation(#[from] ChainError),
}

/// Append-only breadcrumb store.
#[derive(Debug)]
pub struct ChainStore {
    conn: Mutex<Connection>,
}

impl ChainStore {
    /// Opens (or creates) a store at `path` with WAL journaling.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on open or schema failure.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Opens an in-memory store for tests.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on schema failure.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Persists one validated breadcrumb.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AppendOnlyViolation`] if the index already
    /// exists for the identity.
    pub fn append(&self, crumb: &Breadcrumb) -> Result<(), StoreError> {
        let payload = crumb.encode().map_err(ChainError::from)?;
        let hash = crumb.block_hash().map_err(ChainError::from)?;

        let conn = self.conn.lock().expect("lock poisoned");
        let result = conn.execute(
            "INSERT INTO breadcrumbs (identity, idx, timestamp, payload, block_hash)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                crumb.identity.0.as_slice(),
                crumb.index,
                crumb.timestamp,
                payload,
                hash.as_slice(),
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::AppendOnlyViolation { index: crumb.index })
            },
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    /// Loads and revalidates the chain for `identity`.
    ///
    /// Returns `None` when no records exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Revalidation`] if any stored record fails
    /// the validator, or [`StoreError::Database`] on read failure.
    pub fn load_chain(
        &self,
        identity: IdentityKey,
        config: &ChainConfig,
    ) -> Result<Option<Chain>, StoreError> {
        let conn = self.conn.lock().expect("lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT payload FROM breadcrumbs WHERE identity = ?1 ORDER BY idx ASC",
        )?;
        let payloads: Vec<Vec<u8>> = stmt
            .query_map(params![identity.0.as_slice()], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        drop(stmt);
        drop(conn);

        if payloads.is_empty() {
            return Ok(None);
        }

        let mut chain = Chain::new(identity);
        for payload in payloads {
            let crumb = Breadcrumb::decode(&payload).map_err(ChainError::from)?;
            chain.append(crumb, config)?;
        }
        Ok(Some(chain))
    }

    /// Highest stored index for `identity`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on read failure.
    pub fn head_index(&self, identity: IdentityKey) -> Result<Option<u64>, StoreError> {
        let conn = self.conn.lock().expect("lock poisoned");
        let index = conn
            .query_row(
                "SELECT MAX(idx) FROM breadcrumbs WHERE identity = ?1",
                params![identity.0.as_slice()],
                |row| row.get::<_, Option<u64>>(0),
            )
            .optional()?
            .flatten();
        Ok(index)
    }

    /// All identities with stored chains.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on read failure.
    pub fn identities(&self) -> Result<Vec<IdentityKey>, StoreError> {
        let conn = self.conn.lock().expect("lock poisoned");
        let mut stmt = conn.prepare("SELECT DISTINCT identity FROM breadcrumbs ORDER BY identity")?;
        let identities = stmt
            .query_map([], |row| {
                let bytes: Vec<u8> = row.get(0)?;
                Ok(bytes)
            })?
            .filter_map(|r| {
                r.ok()
                    .and_then(|b| b.try_into().ok())
                    .map(IdentityKey)
            })
            .collect();
        Ok(identities)
    }

    /// Deletes every record for `identity` (identity purge).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on write failure.
    pub fn purge(&self, identity: IdentityKey) -> Result<usize, StoreError> {
        let conn = self.conn.lock().expect("lock poisoned");
        let removed = conn.execute(
            "DELETE FROM breadcrumbs WHERE identity = ?1",
            params![identity.0.as_slice()],
        )?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use ed25519_dalek::SigningKey;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use tempfile::TempDir;

    use super::*;
    use crate::breadcrumb::{CellId, MetaFlags};

    fn chain_fixture(key: &SigningKey, n: usize) -> Vec<Breadcrumb> {
        let origin = h3o::LatLng::new(52.52, 13.405)
            .unwrap()
            .to_cell(h3o::Resolution::Ten);
        let cells: Vec<CellId> = origin
            .grid_disk::<Vec<_>>(4)
            .into_iter()
            .map(|c| CellId(c.into()))
            .collect();

        let mut crumbs: Vec<Breadcrumb> = Vec::new();
        for i in 0..n {
            let prev_hash = crumbs.last().map(|p: &Breadcrumb| p.block_hash().unwrap());
            crumbs.push(
                Breadcrumb::signed(
                    key,
                    i as u64,
                    1_700_000_000 + i as u64 * 900,
                    cells[i % cells.len()],
                    10,
                    [0x66; 32],
                    prev_hash,
                    MetaFlags::new(),
                )
                .unwrap(),
            );
        }
        crumbs
    }

    #[test]
    fn append_load_roundtrip() {
        let key = SigningKey::generate(&mut StdRng::seed_from_u64(21));
        let crumbs = chain_fixture(&key, 8);
        let store = ChainStore::open_in_memory().unwrap();

        for crumb in &crumbs {
            store.append(crumb).unwrap();
        }

        let identity = crumbs[0].identity;
        let chain = store
            .load_chain(identity, &ChainConfig::default())
            .unwrap()
            .unwrap();
        assert_eq!(chain.len(), 8);
        assert_eq!(
            chain.head_hash(),
            Some(crumbs.last().unwrap().block_hash().unwrap())
        );
        assert_eq!(store.head_index(identity).unwrap(), Some(7));
    }

    #[test]
    fn double_append_rejected() {
        let key = SigningKey::generate(&mut StdRng::seed_from_u64(22));
        let crumbs = chain_fixture(&key, 1);
        let store = ChainStore::open_in_memory().unwrap();

        store.append(&crumbs[0]).unwrap();
        assert!(matches!(
            store.append(&crumbs[0]),
            Err(StoreError::AppendOnlyViolation { index: 0 })
        ));
    }

    #[test]
    fn recovery_survives_reopen() {
        let key = SigningKey::generate(&mut StdRng::seed_from_u64(23));
        let crumbs = chain_fixture(&key, 5);
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chains.db");

        {
            let store = ChainStore::open(&path).unwrap();
            for crumb in &crumbs {
                store.append(crumb).unwrap();
            }
        }

        let store = ChainStore::open(&path).unwrap();
        let chain = store
            .load_chain(crumbs[0].identity, &ChainConfig::default())
            .unwrap()
            .unwrap();
        assert_eq!(chain.len(), 5);
        assert_eq!(store.identities().unwrap(), vec![crumbs[0].identity]);
    }

    #[test]
    fn purge_removes_identity() {
        let key = SigningKey::generate(&mut StdRng::seed_from_u64(24));
        let crumbs = chain_fixture(&key, 3);
        let store = ChainStore::open_in_memory().unwrap();
        for crumb in &crumbs {
            store.append(crumb).unwrap();
        }

        assert_eq!(store.purge(crumbs[0].identity).unwrap(), 3);
        assert!(store
            .load_chain(crumbs[0].identity, &ChainConfig::default())
            .unwrap()
            .is_none());
    }

    #[test]
    fn missing_identity_loads_none() {
        let store = ChainStore::open_in_memory().unwrap();
        assert!(store
            .load_chain(IdentityKey([0x11; 32]), &ChainConfig::default())
            .unwrap()
            .is_none());
    }
}
