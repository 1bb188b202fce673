//! Shared configuration defaults.
//!
//! Constants and environment variable names used by more than one crate live
//! here so the storage layout and the engine never disagree about them.

use std::time::Duration;

/// Fixed namespace of the persisted counter records.
///
/// Records are stored in this table and the externally observable mirror fields
/// are published as `<COUNTER_NAMESPACE>.<kind>.<target>.<field>`.
pub const COUNTER_NAMESPACE: &str = "tally.counters";

/// Source tag stamped on every write the engine performs itself.
pub const ENGINE_SOURCE: &str = "tally.rules";

/// Persisted field names of a counter record.
pub mod fields {
    pub const LAST_COUNTER: &str = "lastCounter";
    pub const SUB_COUNTER: &str = "subCounter";
    pub const LAST_RESET_AT: &str = "lastResetAt";
}

/// Metric names emitted for an active cycle message.
pub mod metrics {
    pub const CYCLE_SUB_COUNTER: &str = "cycle-subCounter";
    pub const STATE_NAME: &str = "state-name";
}

/// Reason reported when an external reset eliminates the cause of a message.
pub const EXTERNAL_RESET_REASON: &str = "external-reset";

/// Upper bound for draining an instance's workers on disposal.
pub const DEFAULT_DISPOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default interval of the CLI's registry-wide tick.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(60);

/// Default paths.
pub mod paths {
    pub const DEFAULT_CONFIG_FILE: &str = "tally.toml";
    pub const DEFAULT_DATA_DIR: &str = "./data";
    pub const COUNTER_DB_FILE: &str = "counters.redb";
}

/// Environment variable names.
pub mod env_vars {
    pub const CONFIG: &str = "TALLY_CONFIG";
    pub const DATA_DIR: &str = "TALLY_DATA_DIR";
    pub const LOG_JSON: &str = "TALLY_LOG_JSON";
}

/// Read a boolean flag from the environment (`1`, `true`, `yes`, `on`).
pub fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}
