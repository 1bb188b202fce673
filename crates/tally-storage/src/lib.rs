//! Storage for Tally.
//!
//! ## Features
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `redb` | ✅ | Persistent backend on the redb embedded database |
//! | `memory` | ✅ | Non-persistent in-memory backend |
//!
//! The [`counters`] module layers typed counter records and the
//! [`CounterStore`] contract on top of any backend.

pub mod backends;
pub mod counters;

pub use backends::{available_backends, open_backend, BackendKind, StorageConfig};
pub use counters::{BackendCounterStore, CounterPatch, CounterState, CounterStore};
pub use tally_core::storage::{Result, StorageBackend, StorageError};

#[cfg(feature = "memory")]
pub use backends::{MemoryBackend, MemoryBackendConfig};

#[cfg(feature = "redb")]
pub use backends::{RedbBackend, RedbBackendConfig};
