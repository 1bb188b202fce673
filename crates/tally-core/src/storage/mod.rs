//! Byte-level storage seam.
//!
//! A backend maps `(namespace, key)` to an opaque byte record. Typed counter
//! records are layered on top in `tally-storage`.

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// A stored record could not be encoded or decoded.
    #[error("malformed record: {0}")]
    Serialization(String),

    #[error("invalid storage configuration: {0}")]
    Configuration(String),

    /// The backend refused or failed the operation.
    #[error("backend failure: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

/// Namespaced record store.
///
/// Calls are blocking. A `put` that returned `Ok` on a persistent backend
/// survives a restart.
pub trait StorageBackend: Send + Sync {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>>;

    /// Insert or replace the record under `key`.
    fn put(&self, namespace: &str, key: &str, record: &[u8]) -> Result<()>;

    /// Returns whether a record was removed.
    fn remove(&self, namespace: &str, key: &str) -> Result<bool>;

    /// Every record of `namespace`, ordered by key.
    fn entries(&self, namespace: &str) -> Result<Vec<(String, Vec<u8>)>>;

    fn is_persistent(&self) -> bool;
}
