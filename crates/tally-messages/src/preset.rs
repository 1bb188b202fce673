//! Resolved message presets.
//!
//! Presets are parsed and validated by an external resolver; this crate only
//! carries the resolved record.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Preset schema versions this crate understands.
pub const SUPPORTED_SCHEMA: u32 = 1;

/// Message severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageSeverity {
    /// Informational - no action required
    #[default]
    Info,
    /// Something the user should look at
    Notice,
    /// Warning - potential issue
    Warning,
    /// Action required
    Error,
}

impl MessageSeverity {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Info => "info",
            Self::Notice => "notice",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for MessageSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Text part of a preset.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PresetMessage {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub severity: MessageSeverity,
}

/// A resolved, validated message template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preset {
    #[serde(default = "default_schema")]
    pub schema: u32,
    pub preset_id: String,
    #[serde(default)]
    pub message: PresetMessage,
    /// Lifecycle policy, interpreted by the message store.
    #[serde(default)]
    pub policy: serde_json::Value,
    /// Presentation hints, interpreted by the UI.
    #[serde(default)]
    pub ui: serde_json::Value,
}

fn default_schema() -> u32 {
    1
}

impl Preset {
    pub fn new(preset_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            schema: default_schema(),
            preset_id: preset_id.into(),
            message: PresetMessage {
                title: title.into(),
                ..PresetMessage::default()
            },
            policy: serde_json::Value::Null,
            ui: serde_json::Value::Null,
        }
    }

    /// Reject records a resolver should never have produced.
    pub fn validate(&self) -> Result<()> {
        if self.preset_id.trim().is_empty() {
            return Err(Error::InvalidPreset("presetId must not be empty".to_string()));
        }
        if self.schema != SUPPORTED_SCHEMA {
            return Err(Error::InvalidPreset(format!(
                "{}: unsupported schema {}",
                self.preset_id, self.schema
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preset_defaults() {
        let preset: Preset = serde_json::from_str(r#"{"presetId": "cycle-done"}"#).unwrap();
        assert_eq!(preset.schema, 1);
        assert_eq!(preset.preset_id, "cycle-done");
        assert_eq!(preset.message.severity, MessageSeverity::Info);
    }

    #[test]
    fn test_validate() {
        assert!(Preset::new("cycle-done", "Done").validate().is_ok());
        assert!(matches!(
            Preset::new(" ", "Done").validate(),
            Err(Error::InvalidPreset(_))
        ));

        let mut future = Preset::new("cycle-done", "Done");
        future.schema = 2;
        let err = future.validate().unwrap_err();
        assert!(err.to_string().contains("unsupported schema 2"));
    }

    #[test]
    fn test_severity_wire_format() {
        let msg: PresetMessage =
            serde_json::from_str(r#"{"title": "Done", "severity": "warning"}"#).unwrap();
        assert_eq!(msg.severity, MessageSeverity::Warning);
        assert_eq!(msg.severity.to_string(), "warning");
    }
}
