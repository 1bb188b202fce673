//! Rule instance actor.
//!
//! Each instance runs three tasks:
//!
//! - the **actor**, owning the [`CycleAccumulator`] and processing commands
//!   strictly in arrival order,
//! - the **persistence worker**, writing counter patches to the [`CounterStore`],
//! - the **notification worker**, calling the message writer and message store.
//!
//! The actor never awaits I/O after its initial load: effects are handed to the
//! workers over unbounded channels. Commands sent before the load completes
//! wait in the actor's channel and are replayed in order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use tally_core::config::{metrics as metric_names, DEFAULT_DISPOSE_TIMEOUT};
use tally_core::{ActionEvent, ActionKind, InstanceKey, MessageRef, StateChange};
use tally_messages::{
    CauseElimination, MessageAction, MessageStore, MessageUpsert, MessageWriter, MetricValue,
    Metrics, MetricsUpdate,
};
use tally_storage::{CounterPatch, CounterState, CounterStore};

use crate::accumulator::{CycleAccumulator, Effect, Phase};
use crate::config::CycleConfig;
use crate::error::{Result, RuleError};
use crate::metadata::{MetadataLookup, SignalInfo};

const LOAD_ATTEMPTS: u32 = 3;
const LOAD_BACKOFF: Duration = Duration::from_millis(200);

/// Collaborators of a rule instance.
#[derive(Clone)]
pub struct RuleContext {
    pub store: Arc<dyn CounterStore>,
    pub writer: Arc<dyn MessageWriter>,
    pub message_store: Arc<dyn MessageStore>,
    pub metadata: Arc<dyn MetadataLookup>,
}

/// Point-in-time view of an instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleSnapshot {
    pub key: InstanceKey,
    pub phase: Phase,
    /// `None` while no record exists.
    pub state: Option<CounterState>,
}

enum Command {
    Raw {
        val: f64,
        at: DateTime<Utc>,
    },
    Override {
        change: StateChange,
        at: DateTime<Utc>,
    },
    Tick(DateTime<Utc>),
    Action {
        kind: ActionKind,
        at: DateTime<Utc>,
    },
    Flush {
        persisted: oneshot::Sender<()>,
        notified: oneshot::Sender<()>,
    },
    Snapshot(oneshot::Sender<RuleSnapshot>),
    Shutdown,
}

enum PersistJob {
    Patch(CounterPatch),
    Drain(oneshot::Sender<()>),
}

enum NotifyJob {
    Open(f64),
    Refresh(f64),
    Heartbeat(f64),
    Eliminate(CauseElimination),
    Close,
    Drain(oneshot::Sender<()>),
}

#[derive(Default)]
struct Tasks {
    ticker: Option<JoinHandle<()>>,
    running: Vec<JoinHandle<()>>,
}

/// Handle to a running rule instance.
pub struct RuleHandle {
    key: InstanceKey,
    message_ref: MessageRef,
    tx: mpsc::UnboundedSender<Command>,
    disposed: AtomicBool,
    silenced: Arc<AtomicBool>,
    tasks: Mutex<Tasks>,
    dispose_timeout: Duration,
}

impl RuleHandle {
    /// Validate the configuration and start the instance.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(key: InstanceKey, config: CycleConfig, ctx: RuleContext) -> Result<Self> {
        config.validate()?;

        let message_ref = key.message_ref();
        let silenced = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::unbounded_channel();
        let (persist_tx, persist_rx) = mpsc::unbounded_channel();
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();

        let persister = tokio::spawn(persist_worker(
            key.clone(),
            ctx.store.clone(),
            persist_rx,
            silenced.clone(),
        ));
        let notifier = Notifier {
            key: key.clone(),
            message_ref,
            writer: ctx.writer,
            message_store: ctx.message_store,
            metadata: ctx.metadata,
            heartbeat: config.heartbeat,
            silenced: silenced.clone(),
            open_pending: false,
        };
        let notifier = tokio::spawn(notifier.run(notify_rx));

        let ticker = config
            .tick_interval()
            .map(|interval| spawn_ticker(tx.downgrade(), interval));

        let actor = Actor {
            key: key.clone(),
            close_on_remove: config.close_on_remove,
            persist_tx,
            notify_tx,
        };
        let actor = tokio::spawn(actor.run(config, ctx.store, rx));

        tracing::debug!(rule = %key, message_ref = %message_ref, "Rule instance started");

        Ok(Self {
            key,
            message_ref,
            tx,
            disposed: AtomicBool::new(false),
            silenced,
            tasks: Mutex::new(Tasks {
                ticker,
                running: vec![actor, persister, notifier],
            }),
            dispose_timeout: DEFAULT_DISPOSE_TIMEOUT,
        })
    }

    /// Bound for draining the workers in [`RuleHandle::dispose`].
    pub fn with_dispose_timeout(mut self, timeout: Duration) -> Self {
        self.dispose_timeout = timeout;
        self
    }

    pub fn key(&self) -> &InstanceKey {
        &self.key
    }

    pub fn message_ref(&self) -> MessageRef {
        self.message_ref
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// A new raw value of the target signal.
    pub fn on_raw_value(&self, val: f64) -> bool {
        self.send(Command::Raw {
            val,
            at: Utc::now(),
        })
    }

    /// A write to the persisted `subCounter` mirror.
    pub fn on_override_write(&self, change: StateChange) -> bool {
        self.send(Command::Override {
            change,
            at: Utc::now(),
        })
    }

    pub fn on_tick(&self, now: DateTime<Utc>) -> bool {
        self.send(Command::Tick(now))
    }

    /// An action on a message. Actions on other messages are ignored.
    pub fn on_action(&self, action: &ActionEvent) -> bool {
        if action.message_ref != self.message_ref {
            return false;
        }
        self.send(Command::Action {
            kind: action.kind.clone(),
            at: Utc::now(),
        })
    }

    /// Wait until every effect decided before this call has been executed.
    pub async fn flush(&self) -> Result<()> {
        let (persisted, persisted_rx) = oneshot::channel();
        let (notified, notified_rx) = oneshot::channel();
        if !self.send(Command::Flush {
            persisted,
            notified,
        }) {
            return Err(RuleError::Disposed(self.key.to_string()));
        }
        let (persisted, notified) = futures::join!(persisted_rx, notified_rx);
        persisted
            .and(notified)
            .map_err(|_| RuleError::Disposed(self.key.to_string()))
    }

    /// Phase and counters after all previously sent commands.
    pub async fn snapshot(&self) -> Result<RuleSnapshot> {
        let (reply, rx) = oneshot::channel();
        if !self.send(Command::Snapshot(reply)) {
            return Err(RuleError::Disposed(self.key.to_string()));
        }
        rx.await
            .map_err(|_| RuleError::Disposed(self.key.to_string()))
    }

    /// Stop the instance.
    ///
    /// Queued work is drained within the dispose timeout; after that the tasks
    /// are aborted. No writer or store call happens once this returns. Calling
    /// it again is a no-op.
    pub async fn dispose(&self) {
        let mut tasks = self.tasks.lock().await;
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(ticker) = tasks.ticker.take() {
            ticker.abort();
        }
        let _ = self.tx.send(Command::Shutdown);

        let running = std::mem::take(&mut tasks.running);
        let aborts: Vec<_> = running.iter().map(|t| t.abort_handle()).collect();
        match tokio::time::timeout(self.dispose_timeout, futures::future::join_all(running)).await
        {
            Ok(_) => tracing::debug!(rule = %self.key, "Rule instance disposed"),
            Err(_) => {
                self.silenced.store(true, Ordering::SeqCst);
                for abort in aborts {
                    abort.abort();
                }
                tracing::warn!(
                    rule = %self.key,
                    timeout_ms = self.dispose_timeout.as_millis() as u64,
                    "Timed out draining rule instance, pending work dropped"
                );
            }
        }
    }

    fn send(&self, command: Command) -> bool {
        if self.is_disposed() {
            tracing::debug!(rule = %self.key, "Dropping command for disposed rule instance");
            return false;
        }
        self.tx.send(command).is_ok()
    }
}

impl std::fmt::Debug for RuleHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleHandle")
            .field("key", &self.key)
            .field("message_ref", &self.message_ref)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

struct Actor {
    key: InstanceKey,
    close_on_remove: bool,
    persist_tx: mpsc::UnboundedSender<PersistJob>,
    notify_tx: mpsc::UnboundedSender<NotifyJob>,
}

impl Actor {
    async fn run(
        self,
        config: CycleConfig,
        store: Arc<dyn CounterStore>,
        mut rx: mpsc::UnboundedReceiver<Command>,
    ) {
        let loaded = load_state(store.as_ref(), &self.key).await;
        let resumed = loaded.is_some();
        let (mut acc, effects) = CycleAccumulator::resume(&config, loaded, Utc::now());
        if resumed {
            tracing::info!(
                rule = %self.key,
                sub_counter = acc.sub_counter(),
                active = acc.is_active(),
                "Resumed rule instance"
            );
        }
        self.route(effects);

        while let Some(command) = rx.recv().await {
            let effects = match command {
                Command::Raw { val, at } => acc.on_raw_value(val, at),
                Command::Override { change, at } => match change.numeric() {
                    Some(val) => acc.on_override(val, change.ack, at),
                    None => {
                        tracing::debug!(rule = %self.key, val = %change.val, "Ignoring non-numeric subCounter write");
                        Vec::new()
                    }
                },
                Command::Tick(now) => acc.on_tick(now),
                Command::Action { kind, at } => {
                    if kind.is_closing() {
                        tracing::info!(rule = %self.key, "Cycle message closed, counter reset");
                        acc.on_close_action(at)
                    } else {
                        tracing::debug!(rule = %self.key, action = %kind, "Ignoring non-closing action");
                        Vec::new()
                    }
                }
                Command::Flush {
                    persisted,
                    notified,
                } => {
                    let _ = self.persist_tx.send(PersistJob::Drain(persisted));
                    let _ = self.notify_tx.send(NotifyJob::Drain(notified));
                    continue;
                }
                Command::Snapshot(reply) => {
                    let _ = reply.send(RuleSnapshot {
                        key: self.key.clone(),
                        phase: acc.phase(),
                        state: acc.state().cloned(),
                    });
                    continue;
                }
                Command::Shutdown => {
                    if self.close_on_remove && acc.is_active() {
                        let _ = self.notify_tx.send(NotifyJob::Close);
                    }
                    break;
                }
            };
            self.route(effects);
        }
        // Dropping the worker senders lets both workers finish their queues.
    }

    fn route(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Persist(patch) => {
                    let _ = self.persist_tx.send(PersistJob::Patch(patch));
                }
                Effect::Open { sub_counter } => {
                    tracing::info!(rule = %self.key, sub_counter, "Cycle completed");
                    let _ = self.notify_tx.send(NotifyJob::Open(sub_counter));
                }
                Effect::Refresh { sub_counter } => {
                    let _ = self.notify_tx.send(NotifyJob::Refresh(sub_counter));
                }
                Effect::Heartbeat { sub_counter } => {
                    let _ = self.notify_tx.send(NotifyJob::Heartbeat(sub_counter));
                }
                Effect::EliminateCause(elimination) => {
                    tracing::info!(rule = %self.key, reason = %elimination.reason, "External reset of active cycle");
                    let _ = self.notify_tx.send(NotifyJob::Eliminate(elimination));
                }
            }
        }
    }
}

async fn load_state(store: &dyn CounterStore, key: &InstanceKey) -> Option<CounterState> {
    for attempt in 1..=LOAD_ATTEMPTS {
        match store.get_state(key).await {
            Ok(state) => return state,
            Err(e) if attempt < LOAD_ATTEMPTS => {
                tracing::warn!(rule = %key, attempt, error = %e, "Failed to load counters, retrying");
                tokio::time::sleep(LOAD_BACKOFF * attempt).await;
            }
            Err(e) => {
                tracing::warn!(rule = %key, error = %e, "Failed to load counters, starting fresh");
            }
        }
    }
    None
}

/// Writes patches in order, coalescing whatever is already queued.
///
/// A failed write is kept and merged into the next one.
async fn persist_worker(
    key: InstanceKey,
    store: Arc<dyn CounterStore>,
    mut rx: mpsc::UnboundedReceiver<PersistJob>,
    silenced: Arc<AtomicBool>,
) {
    let mut pending: Option<CounterPatch> = None;

    while let Some(job) = rx.recv().await {
        let patch = match job {
            PersistJob::Patch(patch) => patch,
            PersistJob::Drain(done) => {
                let _ = done.send(());
                continue;
            }
        };

        let mut batch = pending.take().unwrap_or_default();
        batch.merge(&patch);
        let mut drained = Vec::new();
        while let Ok(job) = rx.try_recv() {
            match job {
                PersistJob::Patch(next) => batch.merge(&next),
                PersistJob::Drain(done) => drained.push(done),
            }
        }

        if silenced.load(Ordering::SeqCst) {
            return;
        }
        if let Err(e) = store.set_state(&key, &batch).await {
            tracing::warn!(rule = %key, error = %e, "Failed to persist counters, retrying with next update");
            pending = Some(batch);
        }
        for done in drained {
            let _ = done.send(());
        }
    }

    if let Some(batch) = pending {
        if !silenced.load(Ordering::SeqCst) {
            if let Err(e) = store.set_state(&key, &batch).await {
                tracing::error!(rule = %key, error = %e, "Dropping unpersisted counter update");
            }
        }
    }
}

struct Notifier {
    key: InstanceKey,
    message_ref: MessageRef,
    writer: Arc<dyn MessageWriter>,
    message_store: Arc<dyn MessageStore>,
    metadata: Arc<dyn MetadataLookup>,
    heartbeat: bool,
    silenced: Arc<AtomicBool>,
    /// The last upsert failed and must be re-issued.
    open_pending: bool,
}

impl Notifier {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<NotifyJob>) {
        while let Some(job) = rx.recv().await {
            if let NotifyJob::Drain(done) = job {
                let _ = done.send(());
                continue;
            }
            if self.silenced.load(Ordering::SeqCst) {
                return;
            }
            self.handle(job).await;
        }
    }

    async fn handle(&mut self, job: NotifyJob) {
        match job {
            NotifyJob::Open(sub) => self.upsert(sub).await,
            NotifyJob::Refresh(sub) if self.open_pending => self.upsert(sub).await,
            NotifyJob::Refresh(sub) => self.refresh(sub).await,
            NotifyJob::Heartbeat(sub) if self.open_pending => self.upsert(sub).await,
            NotifyJob::Heartbeat(sub) if self.heartbeat => self.refresh(sub).await,
            NotifyJob::Heartbeat(_) => {}
            NotifyJob::Eliminate(elimination) => {
                self.open_pending = false;
                let result = self
                    .message_store
                    .complete_after_cause_eliminated(&self.message_ref, &elimination)
                    .await;
                self.report("complete_after_cause_eliminated", result);
            }
            NotifyJob::Close => {
                self.open_pending = false;
                let result = self.writer.on_close(&self.message_ref).await;
                self.report("on_close", result);
            }
            NotifyJob::Drain(done) => {
                let _ = done.send(());
            }
        }
    }

    async fn upsert(&mut self, sub: f64) {
        let info = self.describe().await;
        let upsert = MessageUpsert {
            metrics: cycle_metrics(sub, &info),
            actions: vec![MessageAction::close()],
        };
        let result = self.writer.on_upsert(&self.message_ref, &upsert).await;
        self.open_pending = !self.report("on_upsert", result);
    }

    async fn refresh(&mut self, sub: f64) {
        let info = self.describe().await;
        let update = MetricsUpdate {
            set: cycle_metrics(sub, &info),
        };
        let result = self.writer.on_metrics(&self.message_ref, &update).await;
        self.report("on_metrics", result);
    }

    async fn describe(&self) -> SignalInfo {
        match self.metadata.describe(&self.key.target).await {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!(rule = %self.key, error = %e, "Signal metadata lookup failed, using id");
                SignalInfo::fallback(&self.key.target)
            }
        }
    }

    /// Log the outcome of a writer call and return whether it was accepted.
    fn report(&self, call: &str, result: tally_messages::Result<bool>) -> bool {
        match result {
            Ok(true) => {
                tracing::debug!(rule = %self.key, message_ref = %self.message_ref, call, "Message store call accepted");
                true
            }
            Ok(false) => {
                tracing::warn!(
                    rule = %self.key,
                    message_ref = %self.message_ref,
                    writer = self.writer.name(),
                    call,
                    "Message store call rejected"
                );
                false
            }
            Err(e) => {
                tracing::warn!(
                    rule = %self.key,
                    message_ref = %self.message_ref,
                    writer = self.writer.name(),
                    call,
                    error = %e,
                    "Message store call failed"
                );
                false
            }
        }
    }
}

/// Metrics of an active cycle message.
pub fn cycle_metrics(sub_counter: f64, info: &SignalInfo) -> Metrics {
    let mut metrics = Metrics::new();
    metrics.insert(
        metric_names::CYCLE_SUB_COUNTER.to_string(),
        MetricValue::number(sub_counter, info.unit.clone()),
    );
    metrics.insert(
        metric_names::STATE_NAME.to_string(),
        MetricValue::text(info.label.clone()),
    );
    metrics
}

fn spawn_ticker(tx: mpsc::WeakUnboundedSender<Command>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + period;
        let mut ticker = tokio::time::interval_at(start, period);
        loop {
            ticker.tick().await;
            // Stops once the handle is gone
            let Some(tx) = tx.upgrade() else {
                break;
            };
            if tx.send(Command::Tick(Utc::now())).is_err() {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_metrics_layout() {
        let metrics = cycle_metrics(12.5, &SignalInfo::new("Washer", "kWh"));
        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics["cycle-subCounter"].as_f64(), Some(12.5));
        assert_eq!(metrics["cycle-subCounter"].unit, "kWh");
        assert_eq!(metrics["state-name"].val, serde_json::json!("Washer"));
        assert_eq!(metrics["state-name"].unit, "");
    }
}
