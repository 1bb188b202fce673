//! Storage backend implementations.
//!
//! Each backend is feature-gated. [`open_backend`] builds one from the
//! `[storage]` section of the configuration.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tally_core::storage::{Result, StorageBackend, StorageError};

#[cfg(feature = "redb")]
pub mod redb;

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "redb")]
pub use redb::{RedbBackend, RedbBackendConfig};

#[cfg(feature = "memory")]
pub use memory::{MemoryBackend, MemoryBackendConfig};

/// Backend type identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Redb,
    Memory,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Redb => "redb",
            Self::Memory => "memory",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: BackendKind,
    /// Database file, required by persistent backends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Read cache entries of the redb backend (0 disables the cache).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_capacity: Option<usize>,
    /// Entry limit of the memory backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_entries: Option<usize>,
}

impl StorageConfig {
    pub fn redb(path: impl Into<PathBuf>) -> Self {
        Self {
            backend: BackendKind::Redb,
            path: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn memory() -> Self {
        Self {
            backend: BackendKind::Memory,
            ..Self::default()
        }
    }
}

/// Open the configured backend.
///
/// # Example
/// ```no_run
/// use tally_storage::{open_backend, StorageConfig};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = open_backend(&StorageConfig::redb("./data/counters.redb"))?;
/// assert!(backend.is_persistent());
/// # Ok(())
/// # }
/// ```
pub fn open_backend(config: &StorageConfig) -> Result<Arc<dyn StorageBackend>> {
    tracing::debug!(backend = %config.backend, path = ?config.path, "Opening storage backend");
    match config.backend {
        BackendKind::Redb => open_redb(config),
        BackendKind::Memory => open_memory(config),
    }
}

#[cfg(feature = "redb")]
fn open_redb(config: &StorageConfig) -> Result<Arc<dyn StorageBackend>> {
    let path = config.path.as_ref().ok_or_else(|| {
        StorageError::Configuration("redb backend requires a path".to_string())
    })?;
    let mut redb_config = RedbBackendConfig::new(path.clone());
    if let Some(capacity) = config.cache_capacity {
        redb_config = redb_config.with_cache_capacity(capacity);
    }
    Ok(Arc::new(RedbBackend::new(redb_config)?))
}

#[cfg(not(feature = "redb"))]
fn open_redb(_config: &StorageConfig) -> Result<Arc<dyn StorageBackend>> {
    Err(unavailable(BackendKind::Redb))
}

#[cfg(feature = "memory")]
fn open_memory(config: &StorageConfig) -> Result<Arc<dyn StorageBackend>> {
    Ok(Arc::new(MemoryBackend::new(MemoryBackendConfig {
        max_entries: config.max_entries,
    })))
}

#[cfg(not(feature = "memory"))]
fn open_memory(_config: &StorageConfig) -> Result<Arc<dyn StorageBackend>> {
    Err(unavailable(BackendKind::Memory))
}

#[allow(dead_code)]
fn unavailable(kind: BackendKind) -> StorageError {
    StorageError::Configuration(format!(
        "Backend {} is not compiled in. Available backends: {}",
        kind,
        available_backends()
            .iter()
            .map(BackendKind::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    ))
}

/// Backends enabled at compile time.
pub fn available_backends() -> Vec<BackendKind> {
    let mut backends = Vec::new();
    #[cfg(feature = "redb")]
    backends.push(BackendKind::Redb);
    #[cfg(feature = "memory")]
    backends.push(BackendKind::Memory);
    backends
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_wire_format() {
        let config: StorageConfig = serde_json::from_str(r#"{"backend": "memory"}"#).unwrap();
        assert_eq!(config.backend, BackendKind::Memory);
        assert!(serde_json::from_str::<StorageConfig>(r#"{"backend": "sqlite"}"#).is_err());
        assert_eq!(StorageConfig::default().backend, BackendKind::Redb);
    }

    #[cfg(feature = "memory")]
    #[test]
    fn test_open_memory_backend() {
        let backend = open_backend(&StorageConfig::memory()).unwrap();
        assert!(!backend.is_persistent());
        assert!(available_backends().contains(&BackendKind::Memory));
    }

    #[cfg(feature = "redb")]
    #[test]
    fn test_redb_requires_path() {
        let config = StorageConfig {
            backend: BackendKind::Redb,
            ..StorageConfig::default()
        };
        let err = open_backend(&config).err().unwrap();
        assert!(matches!(err, StorageError::Configuration(_)));
    }
}
