//! LMDB-backed structured store.
//!
//! Uses the heed crate (Rust bindings for LMDB). The environment lives at
//! `<path>/<app_name>`; cache entries go into a named database, [`CACHE_DATABASE`],
//! created on first use.
//!
//! # Thread Safety
//!
//! LMDB provides ACID transactions:
//! - Read transactions for `read` and `read_all`
//! - Write transactions for every mutation, including the compare step of
//!   `remove_if_unchanged`, so the check and the delete are atomic
//!
//! Transactions are opened and closed inside synchronous helpers and never
//! live across an `.await`.
//!
//! # Keys
//!
//! LMDB rejects empty keys and keys over 511 bytes, so cache keys are stored
//! under their SHA-256 hex digest. The record keeps the original key next to
//! the value so `read_all` can hand it back.

use std::path::Path;

use async_trait::async_trait;
use heed::types::Str;
use heed::{Database, Env, EnvOpenOptions};
use rampart_core::StorageError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::OnceCell;

use super::StorageBackend;

/// Name of the database holding cache entries.
pub const CACHE_DATABASE: &str = "cache";

type CacheDb = Database<Str, Str>;

/// Value stored under a digest key.
#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    key: String,
    value: String,
}

fn db_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

fn encode_record(key: &str, value: &str) -> Result<String, StorageError> {
    let record = StoredRecord {
        key: key.to_string(),
        value: value.to_string(),
    };
    serde_json::to_string(&record).map_err(|e| StorageError::Serialization {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

fn decode_record(db_key: &str, raw: &str) -> Result<StoredRecord, StorageError> {
    serde_json::from_str(raw).map_err(|e| StorageError::Serialization {
        key: db_key.to_string(),
        reason: e.to_string(),
    })
}

/// Value held for `key`, if the record under its digest belongs to it.
fn value_for(key: &str, digest: &str, raw: Option<&str>) -> Result<Option<String>, StorageError> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let record = decode_record(digest, raw)?;
    Ok((record.key == key).then_some(record.value))
}

/// Structured persistent backend on top of LMDB.
///
/// # Example
///
/// ```ignore
/// use rampart_storage::backend::{LmdbBackend, StorageBackend};
///
/// let backend = LmdbBackend::open("/var/lib/app", "marketplace", 64)?;
/// backend.write("events", r#"{"data":[]}"#).await?;
/// ```
pub struct LmdbBackend {
    env: Env,
    db: OnceCell<CacheDb>,
}

impl std::fmt::Debug for LmdbBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LmdbBackend")
            .field("path", &self.env.path())
            .field("db_ready", &self.db.initialized())
            .finish()
    }
}

impl LmdbBackend {
    /// Open the environment under `path/app_name`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory cannot be created
    /// - The LMDB environment cannot be opened
    pub fn open(
        path: impl AsRef<Path>,
        app_name: &str,
        map_size_mb: usize,
    ) -> Result<Self, StorageError> {
        let dir = path.as_ref().join(app_name);
        std::fs::create_dir_all(&dir).map_err(|e| StorageError::io(&dir, e))?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(&dir)
        }
        .map_err(|e| StorageError::io(&dir, e))?;

        Ok(Self {
            env,
            db: OnceCell::new(),
        })
    }

    async fn database(&self) -> Result<CacheDb, StorageError> {
        self.db
            .get_or_try_init(|| async { create_cache_db(&self.env) })
            .await
            .cloned()
    }
}

fn create_cache_db(env: &Env) -> Result<CacheDb, StorageError> {
    let mut wtxn = env.write_txn().map_err(StorageError::transaction)?;
    let db: CacheDb = env
        .create_database(&mut wtxn, Some(CACHE_DATABASE))
        .map_err(StorageError::transaction)?;
    wtxn.commit().map_err(StorageError::transaction)?;
    tracing::debug!(path = %env.path().display(), "created cache database");
    Ok(db)
}

fn read_one(env: &Env, db: CacheDb, key: &str) -> Result<Option<String>, StorageError> {
    let digest = db_key(key);
    let rtxn = env.read_txn().map_err(StorageError::transaction)?;
    let raw = db.get(&rtxn, &digest).map_err(StorageError::transaction)?;
    value_for(key, &digest, raw)
}

fn read_every(env: &Env, db: CacheDb) -> Result<Vec<(String, String)>, StorageError> {
    let rtxn = env.read_txn().map_err(StorageError::transaction)?;
    let mut pairs = Vec::new();
    for result in db.iter(&rtxn).map_err(StorageError::transaction)? {
        let (digest, raw) = result.map_err(StorageError::transaction)?;
        match decode_record(digest, raw) {
            Ok(record) => pairs.push((record.key, record.value)),
            Err(e) => tracing::warn!(digest, error = %e, "skipping unreadable lmdb record"),
        }
    }
    Ok(pairs)
}

fn put_one(env: &Env, db: CacheDb, key: &str, value: &str) -> Result<(), StorageError> {
    let record = encode_record(key, value)?;
    let mut wtxn = env.write_txn().map_err(StorageError::transaction)?;
    db.put(&mut wtxn, &db_key(key), &record)
        .map_err(StorageError::transaction)?;
    wtxn.commit().map_err(StorageError::transaction)
}

fn delete_one(env: &Env, db: CacheDb, key: &str) -> Result<(), StorageError> {
    let mut wtxn = env.write_txn().map_err(StorageError::transaction)?;
    db.delete(&mut wtxn, &db_key(key))
        .map_err(StorageError::transaction)?;
    wtxn.commit().map_err(StorageError::transaction)
}

fn delete_matching(env: &Env, db: CacheDb, key: &str, expected: &str) -> Result<bool, StorageError> {
    let digest = db_key(key);
    let mut wtxn = env.write_txn().map_err(StorageError::transaction)?;
    let raw = db.get(&wtxn, &digest).map_err(StorageError::transaction)?;
    let matches = value_for(key, &digest, raw)?.is_some_and(|current| current == expected);
    if !matches {
        wtxn.abort();
        return Ok(false);
    }
    db.delete(&mut wtxn, &digest)
        .map_err(StorageError::transaction)?;
    wtxn.commit().map_err(StorageError::transaction)?;
    Ok(true)
}

fn clear_all(env: &Env, db: CacheDb) -> Result<(), StorageError> {
    let mut wtxn = env.write_txn().map_err(StorageError::transaction)?;
    db.clear(&mut wtxn).map_err(StorageError::transaction)?;
    wtxn.commit().map_err(StorageError::transaction)
}

#[async_trait]
impl StorageBackend for LmdbBackend {
    fn kind(&self) -> &'static str {
        "structured"
    }

    async fn read(&self, key: &str) -> Result<Option<String>, StorageError> {
        let db = self.database().await?;
        read_one(&self.env, db, key)
    }

    async fn write(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let db = self.database().await?;
        put_one(&self.env, db, key, value)
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        let db = self.database().await?;
        delete_one(&self.env, db, key)
    }

    async fn remove_if_unchanged(&self, key: &str, expected: &str) -> Result<bool, StorageError> {
        let db = self.database().await?;
        delete_matching(&self.env, db, key, expected)
    }

    async fn clear(&self) -> Result<(), StorageError> {
        let db = self.database().await?;
        clear_all(&self.env, db)
    }

    async fn read_all(&self) -> Result<Vec<(String, String)>, StorageError> {
        let db = self.database().await?;
        read_every(&self.env, db)
    }

    async fn flush(&self) -> Result<(), StorageError> {
        self.env
            .force_sync()
            .map_err(|e| StorageError::io(self.env.path(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_backend() -> (LmdbBackend, TempDir) {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let backend = LmdbBackend::open(temp_dir.path(), "marketplace", 10)
            .expect("backend creation should succeed");
        (backend, temp_dir)
    }

    #[tokio::test]
    async fn test_lmdb_backend_contract() {
        let (backend, _temp_dir) = create_test_backend();
        super::super::contract::exercise(&backend).await;
    }

    #[tokio::test]
    async fn test_environment_lives_under_app_name() {
        let (backend, temp_dir) = create_test_backend();
        backend.write("k", "v").await.expect("write should succeed");
        assert!(temp_dir.path().join("marketplace").is_dir());
    }

    #[tokio::test]
    async fn test_database_created_lazily() {
        let (backend, _temp_dir) = create_test_backend();
        assert!(!backend.db.initialized());
        assert_eq!(backend.read("k").await.expect("read should succeed"), None);
        assert!(backend.db.initialized());
    }

    #[tokio::test]
    async fn test_keys_beyond_lmdb_limits_are_stored() {
        let (backend, _temp_dir) = create_test_backend();
        let long = "x".repeat(600);
        backend.write(&long, "long").await.expect("write should succeed");
        backend.write("", "empty").await.expect("write should succeed");

        assert_eq!(backend.read(&long).await.unwrap().as_deref(), Some("long"));
        assert_eq!(backend.read("").await.unwrap().as_deref(), Some("empty"));

        let mut keys: Vec<_> = backend
            .read_all()
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        keys.sort();
        assert_eq!(keys, vec![String::new(), long]);
    }

    #[tokio::test]
    async fn test_contents_survive_reopen() {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        {
            let backend = LmdbBackend::open(temp_dir.path(), "marketplace", 10).unwrap();
            backend.write("events", "[1,2,3]").await.unwrap();
            backend.flush().await.unwrap();
        }
        let reopened = LmdbBackend::open(temp_dir.path(), "marketplace", 10).unwrap();
        assert_eq!(
            reopened.read("events").await.unwrap().as_deref(),
            Some("[1,2,3]")
        );
    }
}
