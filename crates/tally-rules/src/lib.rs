//! Cycle accumulation rules for Tally.
//!
//! A rule instance watches one raw counter signal and accumulates its increases
//! into `subCounter`. Once `subCounter` reaches the configured period, a cycle
//! message is opened through the message writer. The message is closed through
//! its close action, or eliminated when the persisted `subCounter` is reset
//! externally.
//!
//! ```text
//! raw value ─┐
//! mirror   ──┼─► RuleRegistry ─► RuleHandle (actor) ─► persistence worker ─► CounterStore
//! action   ──┘                                     └─► notification worker ─► MessageWriter
//! ```

pub mod accumulator;
pub mod config;
pub mod error;
pub mod instance;
pub mod metadata;
pub mod registry;

pub use accumulator::{CycleAccumulator, Effect, Phase};
pub use config::{CycleConfig, RuleDefinition};
pub use error::{Result, RuleError};
pub use instance::{cycle_metrics, RuleContext, RuleHandle, RuleSnapshot};
pub use metadata::{MetadataLookup, SignalInfo, StaticMetadata};
pub use registry::RuleRegistry;
