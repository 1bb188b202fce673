//! Errors of message writers and the message store.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// No message or writer under that reference.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("writer {0} is disabled")]
    WriterDisabled(String),

    /// The writer was reachable but refused the message.
    #[error("message rejected: {0}")]
    Rejected(String),

    #[error("invalid preset: {0}")]
    InvalidPreset(String),
}

impl From<Error> for tally_core::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::NotFound(s) => tally_core::Error::NotFound(s),
            Error::InvalidPreset(s) => tally_core::Error::Validation(s),
            other => tally_core::Error::Internal(other.to_string()),
        }
    }
}
