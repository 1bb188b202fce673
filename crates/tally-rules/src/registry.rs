//! Registry of rule instances and dispatcher of incoming events.
//!
//! Every instance is reachable by three identifiers: its target signal id, the
//! id of its persisted `subCounter` mirror and its [`MessageRef`]. Dispatch is
//! by which identifier an event carries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use tally_core::config::DEFAULT_DISPOSE_TIMEOUT;
use tally_core::{ActionEvent, InstanceKey, MessageRef, StateChange, Subscription, TallyEvent};
use tally_messages::{MessageStore, WriterRegistry};
use tally_storage::CounterStore;

use crate::config::RuleDefinition;
use crate::error::{Result, RuleError};
use crate::instance::{RuleContext, RuleHandle, RuleSnapshot};
use crate::metadata::MetadataLookup;

#[derive(Default)]
struct Routes {
    instances: HashMap<InstanceKey, Arc<RuleHandle>>,
    /// Target signal id → instances (one per rule kind).
    raw: HashMap<String, Vec<InstanceKey>>,
    mirror: HashMap<String, InstanceKey>,
    by_ref: HashMap<MessageRef, InstanceKey>,
}

impl Routes {
    fn insert(&mut self, key: InstanceKey, handle: Arc<RuleHandle>) {
        self.raw
            .entry(key.target.clone())
            .or_default()
            .push(key.clone());
        self.mirror.insert(key.mirror_id(), key.clone());
        self.by_ref.insert(handle.message_ref(), key.clone());
        self.instances.insert(key, handle);
    }

    fn remove(&mut self, key: &InstanceKey) -> Option<Arc<RuleHandle>> {
        let handle = self.instances.remove(key)?;
        if let Some(keys) = self.raw.get_mut(&key.target) {
            keys.retain(|k| k != key);
            if keys.is_empty() {
                self.raw.remove(&key.target);
            }
        }
        self.mirror.remove(&key.mirror_id());
        self.by_ref.remove(&handle.message_ref());
        Some(handle)
    }

    fn handles(&self) -> Vec<Arc<RuleHandle>> {
        self.instances.values().cloned().collect()
    }
}

/// Owns the rule instances of one process.
pub struct RuleRegistry {
    store: Arc<dyn CounterStore>,
    writers: Arc<WriterRegistry>,
    message_store: Arc<dyn MessageStore>,
    metadata: Arc<dyn MetadataLookup>,
    dispose_timeout: Duration,
    routes: RwLock<Routes>,
}

impl RuleRegistry {
    pub fn new(
        store: Arc<dyn CounterStore>,
        writers: Arc<WriterRegistry>,
        message_store: Arc<dyn MessageStore>,
        metadata: Arc<dyn MetadataLookup>,
    ) -> Self {
        Self {
            store,
            writers,
            message_store,
            metadata,
            dispose_timeout: DEFAULT_DISPOSE_TIMEOUT,
            routes: RwLock::new(Routes::default()),
        }
    }

    pub fn with_dispose_timeout(mut self, timeout: Duration) -> Self {
        self.dispose_timeout = timeout;
        self
    }

    /// Add a rule, replacing the instance with the same key.
    ///
    /// The replaced instance is disposed before the new one loads its state, so
    /// the new instance resumes from everything the old one persisted.
    pub async fn add_rule(&self, definition: RuleDefinition) -> Result<InstanceKey> {
        definition.validate()?;

        let writer = self
            .writers
            .resolve(definition.preset.as_deref())
            .await
            .ok_or_else(|| {
                RuleError::Validation(format!(
                    "no message writer for preset {}",
                    definition.preset.as_deref().unwrap_or("<none>")
                ))
            })?;

        let key = definition.key();
        let ctx = RuleContext {
            store: self.store.clone(),
            writer,
            message_store: self.message_store.clone(),
            metadata: self.metadata.clone(),
        };

        let mut routes = self.routes.write().await;
        if let Some(previous) = routes.remove(&key) {
            tracing::info!(rule = %key, "Replacing rule instance");
            previous.dispose().await;
        }
        let handle = RuleHandle::spawn(key.clone(), definition.config, ctx)?
            .with_dispose_timeout(self.dispose_timeout);
        routes.insert(key.clone(), Arc::new(handle));

        tracing::info!(rule = %key, preset = ?definition.preset, "Rule added");
        Ok(key)
    }

    /// Remove and dispose a rule. Returns whether it existed.
    pub async fn remove_rule(&self, kind: &str, target: &str) -> bool {
        let key = InstanceKey::new(kind, target);
        let removed = self.routes.write().await.remove(&key);
        match removed {
            Some(handle) => {
                handle.dispose().await;
                tracing::info!(rule = %key, "Rule removed");
                true
            }
            None => false,
        }
    }

    /// Route a state change by signal id. Returns the number of instances reached.
    pub async fn dispatch_state_change(&self, id: &str, change: &StateChange) -> usize {
        let Some(val) = change.numeric() else {
            tracing::debug!(id, val = %change.val, "Dropping non-numeric state change");
            return 0;
        };

        let routes = self.routes.read().await;
        let mut reached = 0;

        if let Some(keys) = routes.raw.get(id) {
            for key in keys {
                if let Some(handle) = routes.instances.get(key) {
                    if handle.on_raw_value(val) {
                        reached += 1;
                    }
                }
            }
        }
        if let Some(key) = routes.mirror.get(id) {
            if let Some(handle) = routes.instances.get(key) {
                if handle.on_override_write(change.clone()) {
                    reached += 1;
                }
            }
        }
        reached
    }

    /// Route a message action by its reference.
    pub async fn dispatch_action(&self, action: &ActionEvent) -> bool {
        let routes = self.routes.read().await;
        let handle = routes
            .by_ref
            .get(&action.message_ref)
            .and_then(|key| routes.instances.get(key));
        match handle {
            Some(handle) => handle.on_action(action),
            None => {
                tracing::debug!(message_ref = %action.message_ref, "No rule owns message");
                false
            }
        }
    }

    /// Tick every instance.
    pub async fn tick(&self, now: DateTime<Utc>) -> usize {
        self.routes
            .read()
            .await
            .instances
            .values()
            .filter(|handle| handle.on_tick(now))
            .count()
    }

    pub async fn handle_event(&self, event: &TallyEvent) {
        match event {
            TallyEvent::StateChanged { id, change } => {
                self.dispatch_state_change(id, change).await;
            }
            TallyEvent::MessageAction(action) => {
                self.dispatch_action(action).await;
            }
            TallyEvent::Tick { at } => {
                self.tick(*at).await;
            }
        }
    }

    /// Consume events until the bus closes.
    pub async fn run(self: Arc<Self>, mut events: Subscription) {
        while let Some((event, metadata)) = events.recv().await {
            tracing::trace!(event = event.type_name(), source = %metadata.source, "Dispatching event");
            self.handle_event(&event).await;
        }
        tracing::debug!("Event bus closed, dispatcher stopped");
    }

    /// Wait until every instance has executed all decided effects.
    pub async fn flush(&self) {
        let handles = self.routes.read().await.handles();
        let results = futures::future::join_all(handles.iter().map(|h| h.flush())).await;
        for (handle, result) in handles.iter().zip(results) {
            if let Err(e) = result {
                tracing::debug!(rule = %handle.key(), error = %e, "Flush skipped");
            }
        }
    }

    pub async fn snapshot(&self, kind: &str, target: &str) -> Option<RuleSnapshot> {
        let key = InstanceKey::new(kind, target);
        let handle = self.routes.read().await.instances.get(&key).cloned()?;
        handle.snapshot().await.ok()
    }

    /// Snapshots of every instance, ordered by key.
    pub async fn snapshots(&self) -> Vec<RuleSnapshot> {
        let handles = self.routes.read().await.handles();
        let mut snapshots: Vec<RuleSnapshot> =
            futures::future::join_all(handles.iter().map(|h| h.snapshot()))
                .await
                .into_iter()
                .filter_map(|s| s.ok())
                .collect();
        snapshots.sort_by(|a, b| a.key.cmp(&b.key));
        snapshots
    }

    pub async fn rule_keys(&self) -> Vec<InstanceKey> {
        let mut keys: Vec<InstanceKey> = self.routes.read().await.instances.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn len(&self) -> usize {
        self.routes.read().await.instances.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.routes.read().await.instances.is_empty()
    }

    /// Dispose every instance.
    pub async fn shutdown(&self) {
        let handles: Vec<_> = {
            let mut routes = self.routes.write().await;
            std::mem::take(&mut *routes).instances.into_values().collect()
        };
        let count = handles.len();
        futures::future::join_all(handles.iter().map(|h| h.dispose())).await;
        tracing::info!(count, "Rule registry shut down");
    }
}
