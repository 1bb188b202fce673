//! Rule definitions.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tally_core::{InstanceKey, RuleKind};

use crate::error::{Result, RuleError};

/// Configuration of one cycle accumulator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleConfig {
    /// Accumulated change that completes a cycle.
    pub period: f64,
    /// Minimum time since the last reset before a cycle may activate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_elapsed_secs: Option<u64>,
    /// Interval of the instance's private tick timer (none when ticked externally).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tick_interval_secs: Option<u64>,
    /// Re-send metrics on every tick while active.
    #[serde(default)]
    pub heartbeat: bool,
    /// Close an open message when the rule is removed.
    #[serde(default)]
    pub close_on_remove: bool,
}

/// Seconds of `d`, rounded up so a sub-second gate is never disabled.
fn whole_secs(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}

impl CycleConfig {
    pub fn new(period: f64) -> Self {
        Self {
            period,
            min_elapsed_secs: None,
            tick_interval_secs: None,
            heartbeat: false,
            close_on_remove: false,
        }
    }

    pub fn with_min_elapsed(mut self, min_elapsed: Duration) -> Self {
        self.min_elapsed_secs = Some(whole_secs(min_elapsed));
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval_secs = Some(whole_secs(interval));
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: bool) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn with_close_on_remove(mut self, close: bool) -> Self {
        self.close_on_remove = close;
        self
    }

    pub fn min_elapsed(&self) -> Option<Duration> {
        self.min_elapsed_secs.map(Duration::from_secs)
    }

    pub fn tick_interval(&self) -> Option<Duration> {
        self.tick_interval_secs.map(Duration::from_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.period.is_finite() || self.period <= 0.0 {
            return Err(RuleError::Validation(format!(
                "period must be a positive number, got {}",
                self.period
            )));
        }
        if self.tick_interval_secs == Some(0) {
            return Err(RuleError::Validation(
                "tick_interval_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// A rule bound to one target signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDefinition {
    #[serde(default)]
    pub kind: RuleKind,
    /// Id of the raw target signal.
    pub target: String,
    /// Preset key used to resolve the message writer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preset: Option<String>,
    #[serde(flatten)]
    pub config: CycleConfig,
}

impl RuleDefinition {
    pub fn cycle(target: impl Into<String>, config: CycleConfig) -> Self {
        Self {
            kind: RuleKind::cycle(),
            target: target.into(),
            preset: None,
            config,
        }
    }

    pub fn with_preset(mut self, preset: impl Into<String>) -> Self {
        self.preset = Some(preset.into());
        self
    }

    pub fn key(&self) -> InstanceKey {
        InstanceKey::new(self.kind.clone(), self.target.clone())
    }

    pub fn validate(&self) -> Result<()> {
        if self.kind.as_str().trim().is_empty() {
            return Err(RuleError::Validation("rule kind must not be empty".to_string()));
        }
        if self.kind.as_str().contains('.') {
            return Err(RuleError::Validation(format!(
                "rule kind must not contain '.': {}",
                self.kind
            )));
        }
        if self.target.trim().is_empty() {
            return Err(RuleError::Validation("target must not be empty".to_string()));
        }
        self.config.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_period_must_be_positive() {
        assert!(CycleConfig::new(10.0).validate().is_ok());
        assert!(CycleConfig::new(0.0).validate().is_err());
        assert!(CycleConfig::new(-1.0).validate().is_err());
        assert!(CycleConfig::new(f64::NAN).validate().is_err());
    }

    #[test]
    fn test_definition_validation() {
        let def = RuleDefinition::cycle("washer.energy", CycleConfig::new(5.0));
        assert!(def.validate().is_ok());
        assert_eq!(def.key(), InstanceKey::new("cycle", "washer.energy"));

        let empty = RuleDefinition::cycle(" ", CycleConfig::new(5.0));
        assert!(empty.validate().is_err());

        let mut dotted = def.clone();
        dotted.kind = RuleKind::from("a.b");
        assert!(dotted.validate().is_err());
    }

    #[test]
    fn test_definition_from_json() {
        let def: RuleDefinition = serde_json::from_str(
            r#"{"target": "pump.energy", "period": 2.5, "min_elapsed_secs": 60, "preset": "cycle-done"}"#,
        )
        .unwrap();
        assert_eq!(def.kind, RuleKind::cycle());
        assert_eq!(def.config.period, 2.5);
        assert_eq!(def.config.min_elapsed(), Some(Duration::from_secs(60)));
        assert_eq!(def.config.tick_interval(), None);
        assert_eq!(def.preset.as_deref(), Some("cycle-done"));
        assert!(!def.config.heartbeat);
    }

    #[test]
    fn test_sub_second_durations_round_up() {
        let config = CycleConfig::new(1.0)
            .with_min_elapsed(Duration::from_millis(500))
            .with_tick_interval(Duration::from_millis(1500));
        assert_eq!(config.min_elapsed(), Some(Duration::from_secs(1)));
        assert_eq!(config.tick_interval(), Some(Duration::from_secs(2)));
        assert!(config.validate().is_ok());

        let exact = CycleConfig::new(1.0).with_min_elapsed(Duration::from_secs(60));
        assert_eq!(exact.min_elapsed_secs, Some(60));
    }

    #[test]
    fn test_zero_tick_interval_rejected() {
        let mut config = CycleConfig::new(1.0);
        config.tick_interval_secs = Some(0);
        assert!(config.validate().is_err());
    }
}
