//! Persistent backend on the redb embedded database.
//!
//! Every namespace is its own redb table. A read cache keyed by
//! `(namespace, key)` sits in front of the database and only ever holds
//! committed records.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use lru::LruCache;
use redb::{Database, ReadableTable, TableDefinition, TableError};
use tally_core::storage::{Result, StorageBackend, StorageError};

const DEFAULT_CACHE_CAPACITY: usize = 1024;

type Table<'a> = TableDefinition<'a, &'static str, &'static [u8]>;
type CacheKey = (String, String);

fn table(namespace: &str) -> Table<'_> {
    TableDefinition::new(namespace)
}

fn backend_err(e: impl std::fmt::Display) -> StorageError {
    StorageError::Backend(e.to_string())
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct RedbBackendConfig {
    pub path: PathBuf,

    /// Create missing parent directories of `path`.
    #[serde(default = "default_true")]
    pub create_dirs: bool,

    /// Cached records; 0 disables the cache.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    /// Remove the database file when the backend is dropped.
    #[serde(skip)]
    temporary: bool,
}

fn default_true() -> bool {
    true
}

fn default_cache_capacity() -> usize {
    DEFAULT_CACHE_CAPACITY
}

impl RedbBackendConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            create_dirs: true,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            temporary: false,
        }
    }

    pub fn with_create_dirs(mut self, create_dirs: bool) -> Self {
        self.create_dirs = create_dirs;
        self
    }

    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// Database in a uniquely named temp file, deleted on drop.
    pub fn temporary() -> Self {
        let path = std::env::temp_dir().join(format!("tally-{}.redb", uuid::Uuid::new_v4()));
        Self {
            temporary: true,
            create_dirs: false,
            ..Self::new(path)
        }
    }
}

pub struct RedbBackend {
    db: Database,
    path: PathBuf,
    temporary: bool,
    cache: Option<Mutex<LruCache<CacheKey, Vec<u8>>>>,
}

impl RedbBackend {
    pub fn new(config: RedbBackendConfig) -> Result<Self> {
        if config.create_dirs {
            if let Some(parent) = config.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = Database::create(&config.path).map_err(backend_err)?;
        let cache = NonZeroUsize::new(config.cache_capacity).map(|cap| Mutex::new(LruCache::new(cap)));

        tracing::debug!(
            path = %config.path.display(),
            cached = cache.is_some(),
            temporary = config.temporary,
            "Opened redb database"
        );

        Ok(Self {
            db,
            path: config.path,
            temporary: config.temporary,
            cache,
        })
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::new(RedbBackendConfig::new(path.as_ref()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_cache(&self, f: impl FnOnce(&mut LruCache<CacheKey, Vec<u8>>)) {
        if let Some(cache) = &self.cache {
            if let Ok(mut cache) = cache.lock() {
                f(&mut cache);
            }
        }
    }

    fn cached(&self, namespace: &str, key: &str) -> Option<Vec<u8>> {
        let mut cache = self.cache.as_ref()?.lock().ok()?;
        cache.get(&(namespace.to_string(), key.to_string())).cloned()
    }
}

impl StorageBackend for RedbBackend {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>> {
        if let Some(record) = self.cached(namespace, key) {
            return Ok(Some(record));
        }

        let txn = self.db.begin_read().map_err(backend_err)?;
        let records = match txn.open_table(table(namespace)) {
            Ok(records) => records,
            Err(TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(backend_err(e)),
        };
        let Some(record) = records.get(key).map_err(backend_err)? else {
            return Ok(None);
        };
        let record = record.value().to_vec();
        self.with_cache(|cache| {
            cache.put((namespace.to_string(), key.to_string()), record.clone());
        });
        Ok(Some(record))
    }

    fn put(&self, namespace: &str, key: &str, record: &[u8]) -> Result<()> {
        let txn = self.db.begin_write().map_err(backend_err)?;
        {
            let mut records = txn.open_table(table(namespace)).map_err(backend_err)?;
            records.insert(key, record).map_err(backend_err)?;
        }
        txn.commit().map_err(backend_err)?;

        self.with_cache(|cache| {
            cache.put((namespace.to_string(), key.to_string()), record.to_vec());
        });
        Ok(())
    }

    fn remove(&self, namespace: &str, key: &str) -> Result<bool> {
        self.with_cache(|cache| {
            cache.pop(&(namespace.to_string(), key.to_string()));
        });

        let txn = self.db.begin_write().map_err(backend_err)?;
        let removed = {
            let mut records = txn.open_table(table(namespace)).map_err(backend_err)?;
            let removed = records.remove(key).map_err(backend_err)?.is_some();
            removed
        };
        txn.commit().map_err(backend_err)?;
        Ok(removed)
    }

    fn entries(&self, namespace: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let txn = self.db.begin_read().map_err(backend_err)?;
        let records = match txn.open_table(table(namespace)) {
            Ok(records) => records,
            Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(backend_err(e)),
        };

        let entries = records
            .iter()
            .map_err(backend_err)?
            .map(|item| {
                let (key, record) = item.map_err(backend_err)?;
                Ok((key.value().to_string(), record.value().to_vec()))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(entries)
    }

    fn is_persistent(&self) -> bool {
        !self.temporary
    }
}

impl Drop for RedbBackend {
    fn drop(&mut self) {
        if self.temporary {
            if let Err(e) = std::fs::remove_file(&self.path) {
                tracing::debug!(path = %self.path.display(), error = %e, "Temporary database not removed");
            }
        }
    }
}
