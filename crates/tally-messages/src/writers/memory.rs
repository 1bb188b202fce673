//! Memory writer (for testing).

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{MessageStore, MessageWriter};
use crate::{CauseElimination, Error, MessageRef, MessageUpsert, Metrics, MetricsUpdate, Result};

/// One recorded call.
#[derive(Debug, Clone, PartialEq)]
pub enum WriterCall {
    Upsert(MessageRef, MessageUpsert),
    Metrics(MessageRef, MetricsUpdate),
    Close(MessageRef),
    CauseEliminated(MessageRef, CauseElimination),
}

#[derive(Debug, Default)]
struct Recorded {
    calls: Vec<WriterCall>,
    open: HashMap<MessageRef, Metrics>,
}

/// Records every call and keeps a map of open messages.
///
/// Calls are recorded even when they are rejected, so tests can count
/// attempts.
#[derive(Debug, Clone)]
pub struct MemoryWriter {
    name: String,
    state: Arc<Mutex<Recorded>>,
    reject_next: Arc<AtomicUsize>,
    erroring: Arc<AtomicBool>,
}

impl MemoryWriter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(Recorded::default())),
            reject_next: Arc::new(AtomicUsize::new(0)),
            erroring: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Answer the next `n` calls with `Ok(false)`.
    pub fn reject_next(&self, n: usize) {
        self.reject_next.store(n, Ordering::SeqCst);
    }

    /// Fail every call with an error until switched off.
    pub fn set_erroring(&self, erroring: bool) {
        self.erroring.store(erroring, Ordering::SeqCst);
    }

    pub async fn calls(&self) -> Vec<WriterCall> {
        self.state.lock().await.calls.clone()
    }

    pub async fn upserts(&self) -> Vec<MessageUpsert> {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter_map(|c| match c {
                WriterCall::Upsert(_, u) => Some(u.clone()),
                _ => None,
            })
            .collect()
    }

    pub async fn metric_updates(&self) -> Vec<MetricsUpdate> {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter_map(|c| match c {
                WriterCall::Metrics(_, m) => Some(m.clone()),
                _ => None,
            })
            .collect()
    }

    pub async fn eliminations(&self) -> Vec<CauseElimination> {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter_map(|c| match c {
                WriterCall::CauseEliminated(_, e) => Some(e.clone()),
                _ => None,
            })
            .collect()
    }

    pub async fn close_count(&self) -> usize {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|c| matches!(c, WriterCall::Close(_)))
            .count()
    }

    pub async fn count(&self) -> usize {
        self.state.lock().await.calls.len()
    }

    pub async fn is_open(&self, message_ref: &MessageRef) -> bool {
        self.state.lock().await.open.contains_key(message_ref)
    }

    /// Metrics of an open message.
    pub async fn open_metrics(&self, message_ref: &MessageRef) -> Option<Metrics> {
        self.state.lock().await.open.get(message_ref).cloned()
    }

    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        state.calls.clear();
        state.open.clear();
    }

    /// Record the call and decide whether it is accepted.
    async fn record(&self, call: WriterCall) -> Result<bool> {
        let mut state = self.state.lock().await;
        state.calls.push(call.clone());

        if self.erroring.load(Ordering::SeqCst) {
            return Err(Error::Rejected(format!("{} is failing", self.name)));
        }
        let rejected = self
            .reject_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Ok(false);
        }

        match call {
            WriterCall::Upsert(r, upsert) => {
                state.open.insert(r, upsert.metrics);
            }
            WriterCall::Metrics(r, update) => {
                if let Some(metrics) = state.open.get_mut(&r) {
                    metrics.extend(update.set);
                }
            }
            WriterCall::Close(r) | WriterCall::CauseEliminated(r, _) => {
                state.open.remove(&r);
            }
        }
        Ok(true)
    }
}

impl Default for MemoryWriter {
    fn default() -> Self {
        Self::new("memory")
    }
}

#[async_trait]
impl MessageWriter for MemoryWriter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_upsert(&self, message_ref: &MessageRef, upsert: &MessageUpsert) -> Result<bool> {
        self.record(WriterCall::Upsert(*message_ref, upsert.clone()))
            .await
    }

    async fn on_metrics(&self, message_ref: &MessageRef, update: &MetricsUpdate) -> Result<bool> {
        self.record(WriterCall::Metrics(*message_ref, update.clone()))
            .await
    }

    async fn on_close(&self, message_ref: &MessageRef) -> Result<bool> {
        self.record(WriterCall::Close(*message_ref)).await
    }
}

#[async_trait]
impl MessageStore for MemoryWriter {
    async fn complete_after_cause_eliminated(
        &self,
        message_ref: &MessageRef,
        elimination: &CauseElimination,
    ) -> Result<bool> {
        self.record(WriterCall::CauseEliminated(*message_ref, elimination.clone()))
            .await
    }
}
