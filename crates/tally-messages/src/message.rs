//! Payloads exchanged with the message store.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use tally_core::{ActionKind, MessageRef};

/// One metric attached to a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricValue {
    pub val: serde_json::Value,
    #[serde(default)]
    pub unit: String,
}

impl MetricValue {
    pub fn number(val: f64, unit: impl Into<String>) -> Self {
        Self {
            val: serde_json::json!(val),
            unit: unit.into(),
        }
    }

    pub fn text(val: impl Into<String>) -> Self {
        Self {
            val: serde_json::Value::String(val.into()),
            unit: String::new(),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.val.as_f64()
    }
}

/// Metrics keyed by name, in stable order.
pub type Metrics = BTreeMap<String, MetricValue>;

/// An action offered on a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageAction {
    /// Action id, unique within the message.
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ActionKind,
}

impl MessageAction {
    pub fn close() -> Self {
        Self {
            id: "close".to_string(),
            kind: ActionKind::Close,
        }
    }

    pub fn ack() -> Self {
        Self {
            id: "ack".to_string(),
            kind: ActionKind::Ack,
        }
    }
}

/// Open or replace a message.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MessageUpsert {
    pub metrics: Metrics,
    pub actions: Vec<MessageAction>,
}

impl MessageUpsert {
    /// Whether one of the offered actions closes the message.
    pub fn has_close_action(&self) -> bool {
        self.actions.iter().any(|a| a.kind.is_closing())
    }
}

/// Refresh metrics of an open message.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MetricsUpdate {
    pub set: Metrics,
}

/// Report that the cause of a message disappeared outside the normal close path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CauseElimination {
    pub reason: String,
    pub at: DateTime<Utc>,
}

impl CauseElimination {
    pub fn new(reason: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            reason: reason.into(),
            at,
        }
    }
}
