//! Message writer contracts for Tally.
//!
//! The rule engine never owns message state. It drives an external message
//! store through the [`MessageWriter`] and [`MessageStore`] contracts, keyed by
//! a deterministic [`MessageRef`].
//!
//! - **Writers**: `on_upsert`, `on_metrics`, `on_close`
//! - **Store hook**: `complete_after_cause_eliminated`
//! - **Registry**: preset key → writer, with a fallback entry
//! - **Built-in writers**: console (logs), memory (records calls)

pub mod error;
pub mod message;
pub mod preset;
pub mod writers;

pub use error::{Error, Result};
pub use message::{
    ActionKind, CauseElimination, MessageAction, MessageRef, MessageUpsert, MetricValue, Metrics,
    MetricsUpdate,
};
pub use preset::{MessageSeverity, Preset, PresetMessage, SUPPORTED_SCHEMA};
pub use writers::{
    ConsoleWriter, FALLBACK_KEY, MemoryWriter, MessageStore, MessageWriter, WriterCall,
    WriterRegistry,
};
