//! Error types for the rules crate.

use tally_core::storage::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Message error: {0}")]
    Message(#[from] tally_messages::Error),

    #[error("Metadata lookup failed: {0}")]
    Metadata(String),

    #[error("Rule instance disposed: {0}")]
    Disposed(String),
}

/// Result type for rule operations
pub type Result<T> = std::result::Result<T, RuleError>;

impl From<RuleError> for tally_core::Error {
    fn from(e: RuleError) -> Self {
        match e {
            RuleError::Validation(s) => tally_core::Error::Validation(s),
            RuleError::Storage(e) => tally_core::Error::Storage(e.to_string()),
            RuleError::Message(e) => e.into(),
            RuleError::Metadata(s) => tally_core::Error::NotFound(s),
            RuleError::Disposed(s) => tally_core::Error::Internal(format!("disposed: {}", s)),
        }
    }
}
