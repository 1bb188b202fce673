//! Event types flowing through the event bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::MessageRef;

/// A state change of one signal, as delivered by the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    /// New value. Only finite numbers are meaningful to the engine.
    pub val: serde_json::Value,
    /// Whether the change was confirmed by the owner of the value.
    #[serde(default)]
    pub ack: bool,
    /// Writer of the change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
}

impl StateChange {
    /// Unacknowledged numeric change.
    pub fn value(val: f64) -> Self {
        Self {
            val: serde_json::json!(val),
            ack: false,
            from: None,
        }
    }

    pub fn with_ack(mut self, ack: bool) -> Self {
        self.ack = ack;
        self
    }

    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    /// The value as a finite number, `None` for anything else.
    pub fn numeric(&self) -> Option<f64> {
        self.val.as_f64().filter(|v| v.is_finite())
    }
}

/// Kind of an action taken on a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ActionKind {
    Close,
    Ack,
    Snooze,
    Other(String),
}

impl ActionKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Close => "close",
            Self::Ack => "ack",
            Self::Snooze => "snooze",
            Self::Other(name) => name,
        }
    }

    /// Whether the action closes the message.
    pub fn is_closing(&self) -> bool {
        matches!(self, Self::Close)
    }
}

impl From<String> for ActionKind {
    fn from(s: String) -> Self {
        match s.to_lowercase().as_str() {
            "close" => Self::Close,
            "ack" => Self::Ack,
            "snooze" => Self::Snooze,
            _ => Self::Other(s),
        }
    }
}

impl From<ActionKind> for String {
    fn from(kind: ActionKind) -> Self {
        kind.as_str().to_string()
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An action taken on a message, reported back by the message store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionEvent {
    #[serde(rename = "ref")]
    pub message_ref: MessageRef,
    #[serde(rename = "action")]
    pub kind: ActionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
}

impl ActionEvent {
    pub fn new(message_ref: MessageRef, kind: ActionKind) -> Self {
        Self {
            message_ref,
            kind,
            from: None,
        }
    }

    pub fn close(message_ref: MessageRef) -> Self {
        Self::new(message_ref, ActionKind::Close)
    }
}

/// Events carried by the Tally event bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TallyEvent {
    /// A signal changed (raw target or persisted mirror).
    StateChanged { id: String, change: StateChange },
    /// An action was taken on a message.
    MessageAction(ActionEvent),
    /// Periodic tick.
    Tick { at: DateTime<Utc> },
}

impl TallyEvent {
    pub fn state_changed(id: impl Into<String>, change: StateChange) -> Self {
        Self::StateChanged {
            id: id.into(),
            change,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::StateChanged { .. } => "StateChanged",
            Self::MessageAction(_) => "MessageAction",
            Self::Tick { .. } => "Tick",
        }
    }

    pub fn is_state_event(&self) -> bool {
        matches!(self, Self::StateChanged { .. })
    }
}

/// Metadata attached to every published event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub source: String,
}

impl EventMetadata {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
        }
    }
}
