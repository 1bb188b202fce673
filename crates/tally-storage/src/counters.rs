//! Persisted counter records of rule instances.
//!
//! Each rule instance owns one record `{lastCounter, subCounter, lastResetAt}`
//! stored under [`COUNTER_NAMESPACE`]. Updates are typed partial patches: only
//! the supplied fields overwrite the stored ones.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use tally_core::config::{COUNTER_NAMESPACE, ENGINE_SOURCE};
use tally_core::storage::{Result, StorageBackend, StorageError};
use tally_core::{EventBus, InstanceKey, StateChange, TallyEvent};

/// Counter state of one rule instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterState {
    /// Most recently observed raw value, `None` until the first event.
    #[serde(default)]
    pub last_counter: Option<f64>,
    /// Accumulated progress since the last reset.
    #[serde(default)]
    pub sub_counter: f64,
    /// Time of the last reset (or of record creation).
    pub last_reset_at: DateTime<Utc>,
}

impl CounterState {
    /// Defaults of a record that has never been persisted.
    pub fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            last_counter: None,
            sub_counter: 0.0,
            last_reset_at: now,
        }
    }

    pub fn apply(&mut self, patch: &CounterPatch) {
        if let Some(last) = patch.last_counter {
            self.last_counter = Some(last);
        }
        if let Some(sub) = patch.sub_counter {
            self.sub_counter = sub;
        }
        if let Some(at) = patch.last_reset_at {
            self.last_reset_at = at;
        }
    }
}

/// Partial update of a [`CounterState`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_counter: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_counter: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reset_at: Option<DateTime<Utc>>,
}

impl CounterPatch {
    /// Patch writing every field of `state`.
    pub fn full(state: &CounterState) -> Self {
        Self {
            last_counter: state.last_counter,
            sub_counter: Some(state.sub_counter),
            last_reset_at: Some(state.last_reset_at),
        }
    }

    pub fn last_counter(mut self, value: f64) -> Self {
        self.last_counter = Some(value);
        self
    }

    pub fn sub_counter(mut self, value: f64) -> Self {
        self.sub_counter = Some(value);
        self
    }

    pub fn last_reset_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_reset_at = Some(at);
        self
    }

    /// Fold `other` into `self`; fields present in `other` win.
    pub fn merge(&mut self, other: &CounterPatch) {
        if other.last_counter.is_some() {
            self.last_counter = other.last_counter;
        }
        if other.sub_counter.is_some() {
            self.sub_counter = other.sub_counter;
        }
        if other.last_reset_at.is_some() {
            self.last_reset_at = other.last_reset_at;
        }
    }

    pub fn is_finite(&self) -> bool {
        self.last_counter.map_or(true, f64::is_finite) && self.sub_counter.map_or(true, f64::is_finite)
    }

    pub fn is_empty(&self) -> bool {
        self.last_counter.is_none() && self.sub_counter.is_none() && self.last_reset_at.is_none()
    }
}

/// Persistence contract for counter records.
///
/// A missing record means the instance is fresh.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Load the record of an instance.
    async fn get_state(&self, key: &InstanceKey) -> Result<Option<CounterState>>;

    /// Apply a partial update. Creates the record from defaults when missing.
    async fn set_state(&self, key: &InstanceKey, patch: &CounterPatch) -> Result<()>;
}

/// [`CounterStore`] over a key/value [`StorageBackend`].
///
/// Records are JSON documents keyed by [`InstanceKey::storage_key`]. When an
/// event bus is attached, every written `subCounter` is published on the
/// instance's mirror id as an acknowledged change from the engine.
pub struct BackendCounterStore {
    backend: Arc<dyn StorageBackend>,
    bus: Option<EventBus>,
    // Serializes read-modify-write cycles.
    write_lock: Mutex<()>,
}

impl BackendCounterStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            bus: None,
            write_lock: Mutex::new(()),
        }
    }

    /// Publish mirror updates on `bus`.
    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    fn read_record(&self, key: &InstanceKey) -> Result<Option<CounterState>> {
        match self.backend.get(COUNTER_NAMESPACE, &key.storage_key())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All persisted records, ordered by key. Unreadable entries are skipped.
    pub fn list_states(&self) -> Result<Vec<(InstanceKey, CounterState)>> {
        let mut states = Vec::new();
        for (raw_key, bytes) in self.backend.entries(COUNTER_NAMESPACE)? {
            let Some(key) = InstanceKey::from_storage_key(&raw_key) else {
                tracing::warn!(key = %raw_key, "Skipping counter record with malformed key");
                continue;
            };
            match serde_json::from_slice::<CounterState>(&bytes) {
                Ok(state) => states.push((key, state)),
                Err(e) => tracing::warn!(rule = %key, error = %e, "Skipping unreadable counter record"),
            }
        }
        states.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(states)
    }

    /// Drop the record of an instance.
    pub fn remove_state(&self, key: &InstanceKey) -> Result<bool> {
        self.backend.remove(COUNTER_NAMESPACE, &key.storage_key())
    }
}

#[async_trait]
impl CounterStore for BackendCounterStore {
    async fn get_state(&self, key: &InstanceKey) -> Result<Option<CounterState>> {
        self.read_record(key)
    }

    async fn set_state(&self, key: &InstanceKey, patch: &CounterPatch) -> Result<()> {
        if patch.is_empty() {
            return Ok(());
        }
        // JSON has no encoding for them; the record would become unreadable
        if !patch.is_finite() {
            return Err(StorageError::Serialization(format!(
                "non-finite counter value in patch for {}",
                key
            )));
        }

        {
            let _guard = self.write_lock.lock().await;
            let mut state = self
                .read_record(key)?
                .unwrap_or_else(|| CounterState::fresh(Utc::now()));
            state.apply(patch);
            let bytes = serde_json::to_vec(&state)?;
            self.backend.put(COUNTER_NAMESPACE, &key.storage_key(), &bytes)?;
        }

        if let (Some(bus), Some(sub)) = (&self.bus, patch.sub_counter) {
            let change = StateChange::value(sub)
                .with_ack(true)
                .with_from(ENGINE_SOURCE);
            bus.publish_from(TallyEvent::state_changed(key.mirror_id(), change), ENGINE_SOURCE);
        }
        Ok(())
    }
}
