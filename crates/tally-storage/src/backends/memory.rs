//! Non-persistent backend for tests and dry runs.

use std::collections::BTreeMap;
use std::sync::RwLock;

use tally_core::storage::{Result, StorageBackend, StorageError};

#[derive(Debug, Clone, Default, serde::Deserialize, serde::Serialize)]
pub struct MemoryBackendConfig {
    /// Total record limit across namespaces. Inserting past it fails.
    #[serde(default)]
    pub max_entries: Option<usize>,
}

type Namespaces = BTreeMap<String, BTreeMap<String, Vec<u8>>>;

#[derive(Debug, Default)]
pub struct MemoryBackend {
    namespaces: RwLock<Namespaces>,
    max_entries: Option<usize>,
}

impl MemoryBackend {
    pub fn new(config: MemoryBackendConfig) -> Self {
        Self {
            namespaces: RwLock::default(),
            max_entries: config.max_entries,
        }
    }

    /// Records across all namespaces.
    pub fn len(&self) -> usize {
        self.namespaces
            .read()
            .map(|ns| ns.values().map(BTreeMap::len).sum())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> StorageError {
    StorageError::Backend("memory backend lock poisoned".to_string())
}

impl StorageBackend for MemoryBackend {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let namespaces = self.namespaces.read().map_err(|_| poisoned())?;
        Ok(namespaces.get(namespace).and_then(|records| records.get(key)).cloned())
    }

    fn put(&self, namespace: &str, key: &str, record: &[u8]) -> Result<()> {
        let mut namespaces = self.namespaces.write().map_err(|_| poisoned())?;
        if let Some(max) = self.max_entries {
            let exists = namespaces
                .get(namespace)
                .is_some_and(|records| records.contains_key(key));
            let total: usize = namespaces.values().map(BTreeMap::len).sum();
            if !exists && total >= max {
                return Err(StorageError::Backend(format!("memory backend full ({} records)", max)));
            }
        }
        namespaces
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), record.to_vec());
        Ok(())
    }

    fn remove(&self, namespace: &str, key: &str) -> Result<bool> {
        let mut namespaces = self.namespaces.write().map_err(|_| poisoned())?;
        Ok(namespaces
            .get_mut(namespace)
            .and_then(|records| records.remove(key))
            .is_some())
    }

    fn entries(&self, namespace: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let namespaces = self.namespaces.read().map_err(|_| poisoned())?;
        Ok(namespaces
            .get(namespace)
            .map(|records| records.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    fn is_persistent(&self) -> bool {
        false
    }
}
