//! Message writers and the registry resolving them by preset.

pub mod console;
pub mod memory;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{CauseElimination, MessageRef, MessageUpsert, MetricsUpdate, Result};

pub use console::ConsoleWriter;
pub use memory::{MemoryWriter, WriterCall};

/// Registry key of the writer used when no exact preset key matches.
pub const FALLBACK_KEY: &str = "*";

/// Writes engine decisions into the message store.
///
/// Every call must be safe to repeat: the engine re-issues calls after failures.
/// `Ok(false)` and `Err` both count as a failed call.
#[async_trait]
pub trait MessageWriter: Send + Sync {
    /// Writer name, for logs.
    fn name(&self) -> &str;

    /// Open (or replace) the message.
    async fn on_upsert(&self, message_ref: &MessageRef, upsert: &MessageUpsert) -> Result<bool>;

    /// Refresh metrics of an open message.
    async fn on_metrics(&self, message_ref: &MessageRef, update: &MetricsUpdate) -> Result<bool>;

    /// Close the message.
    async fn on_close(&self, message_ref: &MessageRef) -> Result<bool>;
}

/// Hook of the message store for closures detected outside the normal close path.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn complete_after_cause_eliminated(
        &self,
        message_ref: &MessageRef,
        elimination: &CauseElimination,
    ) -> Result<bool>;
}

/// Registry mapping preset keys to writers.
///
/// Resolution order: the exact key, else the [`FALLBACK_KEY`] entry.
pub struct WriterRegistry {
    writers: RwLock<HashMap<String, Arc<dyn MessageWriter>>>,
}

impl WriterRegistry {
    pub fn new() -> Self {
        Self {
            writers: RwLock::new(HashMap::new()),
        }
    }

    /// Registry with only a fallback writer.
    pub async fn with_fallback(writer: Arc<dyn MessageWriter>) -> Self {
        let registry = Self::new();
        registry.register_fallback(writer).await;
        registry
    }

    /// Register a writer for a preset key, replacing any previous one.
    pub async fn register(&self, key: impl Into<String>, writer: Arc<dyn MessageWriter>) {
        let key = key.into();
        tracing::debug!(key = %key, writer = writer.name(), "Registered message writer");
        self.writers.write().await.insert(key, writer);
    }

    pub async fn register_fallback(&self, writer: Arc<dyn MessageWriter>) {
        self.register(FALLBACK_KEY, writer).await;
    }

    pub async fn unregister(&self, key: &str) -> bool {
        self.writers.write().await.remove(key).is_some()
    }

    /// Resolve the writer for a preset key (`None` asks for the fallback).
    pub async fn resolve(&self, key: Option<&str>) -> Option<Arc<dyn MessageWriter>> {
        let writers = self.writers.read().await;
        key.and_then(|k| writers.get(k))
            .or_else(|| writers.get(FALLBACK_KEY))
            .cloned()
    }

    pub async fn list_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.writers.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn len(&self) -> usize {
        self.writers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.writers.read().await.is_empty()
    }
}

impl Default for WriterRegistry {
    fn default() -> Self {
        Self::new()
    }
}
