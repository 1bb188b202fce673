//! Human-readable labels and units of target signals.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Label and unit of a signal.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SignalInfo {
    pub label: String,
    #[serde(default)]
    pub unit: String,
}

impl SignalInfo {
    pub fn new(label: impl Into<String>, unit: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            unit: unit.into(),
        }
    }

    /// Used when nothing is known about a signal: the id is the label.
    pub fn fallback(target: &str) -> Self {
        Self::new(target, "")
    }
}

/// Resolves label and unit of a target signal.
///
/// Only consulted when a message is opened or refreshed.
#[async_trait]
pub trait MetadataLookup: Send + Sync {
    async fn describe(&self, target: &str) -> Result<SignalInfo>;
}

/// Lookup over a fixed map, falling back to the signal id.
#[derive(Debug, Clone, Default)]
pub struct StaticMetadata {
    entries: HashMap<String, SignalInfo>,
}

impl StaticMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, target: impl Into<String>, info: SignalInfo) -> Self {
        self.insert(target, info);
        self
    }

    pub fn insert(&mut self, target: impl Into<String>, info: SignalInfo) {
        self.entries.insert(target.into(), info);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl From<HashMap<String, SignalInfo>> for StaticMetadata {
    fn from(entries: HashMap<String, SignalInfo>) -> Self {
        Self { entries }
    }
}

#[async_trait]
impl MetadataLookup for StaticMetadata {
    async fn describe(&self, target: &str) -> Result<SignalInfo> {
        Ok(self
            .entries
            .get(target)
            .cloned()
            .unwrap_or_else(|| SignalInfo::fallback(target)))
    }
}
