//! Content-addressed cache for LLM outputs, embeddings, judge verdicts, and
//! derived artifacts.
//!
//! Keys are deterministic hashes of a structured payload; values are JSON
//! text. The backing store is pluggable: an in-memory map for tests and
//! short runs, or a sqlite file under a scratch directory with a size-based
//! eviction pass at open.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{Error, Result};

/// Cache namespaces, one per concern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheNamespace {
    /// Raw model generations
    Generation,
    /// Embedding vectors
    Embeddings,
    /// Judge verdicts for LLM criteria
    JudgeVerdicts,
    /// Extracted key points
    KeyPointExtraction,
    /// External grading service responses
    ExternalServices,
    /// Derived artifacts
    Derived,
}

impl CacheNamespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generation => "generation",
            Self::Embeddings => "embeddings",
            Self::JudgeVerdicts => "judge-verdicts",
            Self::KeyPointExtraction => "key-point-extraction",
            Self::ExternalServices => "external-services",
            Self::Derived => "derived",
        }
    }
}

/// Deterministic cache key derived from a structured payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(pub String);

impl CacheKey {
    /// Hash a serializable payload into a key.
    pub fn from_payload<T: Serialize>(payload: &T) -> Result<Self> {
        let value = serde_json::to_value(payload)?;
        Ok(Self::from_value(&value))
    }

    /// Hash a JSON value into a key. Object keys are serialized in sorted
    /// order so logically-equal payloads produce equal keys.
    pub fn from_value(value: &Value) -> Self {
        let mut hasher = Sha256::new();
        hash_value(&mut hasher, value);
        CacheKey(format!("{:x}", hasher.finalize()))
    }
}

fn hash_value(hasher: &mut Sha256, value: &Value) {
    match value {
        Value::Null => hasher.update(b"n"),
        Value::Bool(b) => hasher.update(if *b { b"t" } else { b"f" }),
        Value::Number(n) => {
            hasher.update(b"#");
            hasher.update(n.to_string().as_bytes());
        }
        Value::String(s) => {
            hasher.update(b"s");
            hasher.update(s.len().to_le_bytes());
            hasher.update(s.as_bytes());
        }
        Value::Array(items) => {
            hasher.update(b"[");
            for item in items {
                hash_value(hasher, item);
            }
            hasher.update(b"]");
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            hasher.update(b"{");
            for key in keys {
                hasher.update(key.len().to_le_bytes());
                hasher.update(key.as_bytes());
                hash_value(hasher, &map[key]);
            }
            hasher.update(b"}");
        }
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short form for logs
        write!(f, "{}", &self.0[..self.0.len().min(16)])
    }
}

/// Pluggable backing store. Writes are last-writer-wins and idempotent by
/// content hash; concurrent reads are safe.
pub trait CacheStore: Send + Sync {
    fn get(&self, namespace: CacheNamespace, key: &CacheKey) -> Result<Option<String>>;
    fn put(&self, namespace: CacheNamespace, key: &CacheKey, value: &str) -> Result<()>;
}

/// In-memory store for tests and cache-disabled runs.
#[derive(Default)]
pub struct MemoryCacheStore {
    entries: RwLock<HashMap<(CacheNamespace, String), String>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheStore for MemoryCacheStore {
    fn get(&self, namespace: CacheNamespace, key: &CacheKey) -> Result<Option<String>> {
        let entries = self.entries.read().unwrap_or_else(|p| p.into_inner());
        Ok(entries.get(&(namespace, key.0.clone())).cloned())
    }

    fn put(&self, namespace: CacheNamespace, key: &CacheKey, value: &str) -> Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
        entries.insert((namespace, key.0.clone()), value.to_string());
        Ok(())
    }
}

/// Sqlite-backed store living under a scratch directory.
pub struct SqliteCacheStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCacheStore {
    /// Open or create the store and evict oldest entries until the payload
    /// size is under `max_megabytes`.
    pub fn open(path: impl AsRef<Path>, max_megabytes: u64) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| Error::Cache(e.to_string()))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.initialize()?;
        store.evict_to_cap(max_megabytes * 1024 * 1024)?;
        Ok(store)
    }

    /// In-memory sqlite store (for tests).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| Error::Cache(e.to_string()))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.initialize()?;
        Ok(store)
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("failed to lock cache connection: {e}")))?;
        f(&conn).map_err(|e| Error::Cache(e.to_string()))
    }

    fn initialize(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS cache_entries (
                    namespace  TEXT NOT NULL,
                    key        TEXT NOT NULL,
                    value      TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    PRIMARY KEY (namespace, key)
                );
                CREATE INDEX IF NOT EXISTS idx_cache_created
                    ON cache_entries (created_at);",
            )
        })
    }

    fn evict_to_cap(&self, cap_bytes: u64) -> Result<()> {
        loop {
            let total: u64 = self.with_conn(|conn| {
                conn.query_row(
                    "SELECT COALESCE(SUM(LENGTH(value)), 0) FROM cache_entries",
                    [],
                    |row| row.get::<_, i64>(0),
                )
            })? as u64;
            if total <= cap_bytes {
                return Ok(());
            }
            debug!(total, cap_bytes, "evicting oldest cache entries");
            let deleted = self.with_conn(|conn| {
                conn.execute(
                    "DELETE FROM cache_entries WHERE rowid IN (
                        SELECT rowid FROM cache_entries
                        ORDER BY created_at, rowid LIMIT 64
                    )",
                    [],
                )
            })?;
            if deleted == 0 {
                return Ok(());
            }
        }
    }

    /// Number of stored entries.
    pub fn entry_count(&self) -> Result<u64> {
        let count: i64 = self.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM cache_entries", [], |row| row.get(0))
        })?;
        Ok(count as u64)
    }
}

impl CacheStore for SqliteCacheStore {
    fn get(&self, namespace: CacheNamespace, key: &CacheKey) -> Result<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT value FROM cache_entries WHERE namespace = ?1 AND key = ?2",
                params![namespace.as_str(), key.0],
                |row| row.get(0),
            )
            .optional()
        })
    }

    fn put(&self, namespace: CacheNamespace, key: &CacheKey, value: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO cache_entries (namespace, key, value, created_at)
                 VALUES (?1, ?2, ?3, STRFTIME('%s', 'now'))",
                params![namespace.as_str(), key.0, value],
            )
        })?;
        Ok(())
    }
}

/// Typed facade over a [`CacheStore`].
pub struct CacheService {
    store: Arc<dyn CacheStore>,
    enabled: bool,
}

impl CacheService {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self {
            store,
            enabled: true,
        }
    }

    /// A service that never hits the store.
    pub fn disabled() -> Self {
        Self {
            store: Arc::new(MemoryCacheStore::new()),
            enabled: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Look up a typed entry; cache errors degrade to a miss.
    pub fn get<T: DeserializeOwned>(&self, namespace: CacheNamespace, key: &CacheKey) -> Option<T> {
        if !self.enabled {
            return None;
        }
        match self.store.get(namespace, key) {
            Ok(Some(text)) => serde_json::from_str(&text).ok(),
            Ok(None) => None,
            Err(e) => {
                debug!(namespace = namespace.as_str(), error = %e, "cache read failed");
                None
            }
        }
    }

    /// Store a typed entry; cache errors are logged, not surfaced.
    pub fn put<T: Serialize>(&self, namespace: CacheNamespace, key: &CacheKey, value: &T) {
        if !self.enabled {
            return;
        }
        let Ok(text) = serde_json::to_string(value) else {
            return;
        };
        if let Err(e) = self.store.put(namespace, key, &text) {
            debug!(namespace = namespace.as_str(), error = %e, "cache write failed");
        }
    }
}
