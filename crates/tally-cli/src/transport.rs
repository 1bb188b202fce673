//! Newline-delimited JSON event transport.
//!
//! ```text
//! {"type":"state","id":"washer.energy","val":12.5}
//! {"type":"state","id":"tally.counters.cycle.washer.energy.subCounter","val":0,"ack":false}
//! {"type":"action","ref":"<uuid>","action":"close"}
//! {"type":"tick"}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tally_core::{ActionEvent, ActionKind, MessageRef, StateChange, TallyEvent};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Line {
    State {
        id: String,
        val: serde_json::Value,
        #[serde(default)]
        ack: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
    },
    Action {
        #[serde(rename = "ref")]
        message_ref: MessageRef,
        action: ActionKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
    },
    Tick {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        at: Option<DateTime<Utc>>,
    },
}

impl From<Line> for TallyEvent {
    fn from(line: Line) -> Self {
        match line {
            Line::State { id, val, ack, from } => TallyEvent::StateChanged {
                id,
                change: StateChange { val, ack, from },
            },
            Line::Action {
                message_ref,
                action,
                from,
            } => TallyEvent::MessageAction(ActionEvent {
                message_ref,
                kind: action,
                from,
            }),
            Line::Tick { at } => TallyEvent::Tick {
                at: at.unwrap_or_else(Utc::now),
            },
        }
    }
}

impl From<&TallyEvent> for Line {
    fn from(event: &TallyEvent) -> Self {
        match event {
            TallyEvent::StateChanged { id, change } => Line::State {
                id: id.clone(),
                val: change.val.clone(),
                ack: change.ack,
                from: change.from.clone(),
            },
            TallyEvent::MessageAction(action) => Line::Action {
                message_ref: action.message_ref,
                action: action.kind.clone(),
                from: action.from.clone(),
            },
            TallyEvent::Tick { at } => Line::Tick { at: Some(*at) },
        }
    }
}

/// Parse one input line. Blank lines and `#` comments yield `None`.
pub fn parse_line(line: &str) -> serde_json::Result<Option<TallyEvent>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let line: Line = serde_json::from_str(line)?;
    Ok(Some(line.into()))
}

pub fn render_event(event: &TallyEvent) -> serde_json::Result<String> {
    serde_json::to_string(&Line::from(event))
}
