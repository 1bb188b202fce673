//! Crate-neutral error shared at the seams between the Tally crates.

use thiserror::Error;

use crate::storage::StorageError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A definition or input value was rejected.
    #[error("invalid: {0}")]
    Validation(String),

    #[error("storage unavailable: {0}")]
    Storage(String),

    #[error("malformed payload: {0}")]
    Serialization(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<StorageError> for Error {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::Serialization(s) => Error::Serialization(s),
            StorageError::Configuration(s) => Error::Validation(s),
            other => Error::Storage(other.to_string()),
        }
    }
}
