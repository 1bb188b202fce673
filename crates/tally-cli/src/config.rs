//! TOML configuration of the `tally` binary.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use tally_core::config::{paths, DEFAULT_DISPOSE_TIMEOUT, DEFAULT_TICK_INTERVAL};
use tally_messages::Preset;
use tally_rules::{RuleDefinition, SignalInfo};
use tally_storage::{BackendKind, StorageConfig};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TallyConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub rules: Vec<RuleDefinition>,
    #[serde(default)]
    pub presets: Vec<Preset>,
    /// Labels and units by signal id.
    #[serde(default)]
    pub signals: HashMap<String, SignalInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineSection {
    /// Interval of the registry-wide tick. `0` disables it.
    #[serde(default)]
    pub tick_interval_secs: Option<u64>,
    #[serde(default)]
    pub dispose_timeout_ms: Option<u64>,
}

impl EngineSection {
    pub fn tick_interval(&self) -> Option<Duration> {
        match self.tick_interval_secs {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => Some(DEFAULT_TICK_INTERVAL),
        }
    }

    pub fn dispose_timeout(&self) -> Duration {
        self.dispose_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_DISPOSE_TIMEOUT)
    }
}

impl TallyConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Check every rule and reject duplicate rule keys and preset ids.
    pub fn validate(&self) -> Result<()> {
        let mut keys = HashSet::new();
        for rule in &self.rules {
            rule.validate()
                .with_context(|| format!("Invalid rule for target '{}'", rule.target))?;
            if !keys.insert(rule.key()) {
                bail!("Duplicate rule {}", rule.key());
            }
        }

        let mut presets = HashSet::new();
        for preset in &self.presets {
            preset.validate()?;
            if !presets.insert(preset.preset_id.as_str()) {
                bail!("Duplicate preset {}", preset.preset_id);
            }
        }

        for rule in &self.rules {
            if let Some(preset) = &rule.preset {
                if !presets.contains(preset.as_str()) {
                    tracing::warn!(rule = %rule.key(), preset = %preset, "Unknown preset, the console fallback will be used");
                }
            }
        }
        Ok(())
    }

    /// Storage settings with the database path resolved.
    ///
    /// An explicit `storage.path` wins, else `<data_dir>/counters.redb`.
    pub fn storage_config(&self, data_dir: Option<&Path>) -> StorageConfig {
        let mut storage = self.storage.clone();
        if storage.backend == BackendKind::Redb && storage.path.is_none() {
            let dir = data_dir
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(paths::DEFAULT_DATA_DIR));
            storage.path = Some(dir.join(paths::COUNTER_DB_FILE));
        }
        storage
    }
}
