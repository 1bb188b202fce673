//! Core traits and types for Tally.
//!
//! This crate defines the identities, events and storage abstractions shared by
//! the storage, message and rule crates.

pub mod config;
pub mod error;
pub mod event;
pub mod eventbus;
pub mod identity;
pub mod storage;

pub use error::{Error, Result};
pub use event::{ActionEvent, ActionKind, EventMetadata, StateChange, TallyEvent};
pub use eventbus::{
    Subscription, DEFAULT_CHANNEL_CAPACITY, DEFAULT_SOURCE, EventBus,
};
pub use identity::{InstanceKey, MessageRef, RuleKind};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
