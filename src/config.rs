//! Snapshot settings and manager options.

use crate::error::{Result, SnapshotError};
use crate::types::SCHEMA_VERSION;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default key holding the serialized snapshot list.
pub const DEFAULT_SNAPSHOTS_KEY: &str = "system-backups";

/// Default key holding the serialized [`SnapshotConfig`].
pub const DEFAULT_CONFIG_KEY: &str = "backup-config";

/// User-facing snapshot settings, persisted in the key-value store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotConfig {
    /// Whether the periodic auto-snapshot timer runs.
    pub auto_snapshot_enabled: bool,

    /// Minutes between automatic snapshots (at least 1).
    pub auto_snapshot_interval_minutes: u32,

    /// Maximum number of retained snapshots (at least 1).
    pub max_retained_snapshots: usize,

    /// Reserved. Payloads are stored uncompressed regardless of this flag.
    pub compression_enabled: bool,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            auto_snapshot_enabled: true,
            auto_snapshot_interval_minutes: 30,
            max_retained_snapshots: 10,
            compression_enabled: true,
        }
    }
}

impl SnapshotConfig {
    /// Check the numeric bounds.
    pub fn validate(&self) -> Result<()> {
        if self.auto_snapshot_interval_minutes == 0 {
            return Err(SnapshotError::Validation(
                "autoSnapshotIntervalMinutes must be at least 1".into(),
            ));
        }
        if self.max_retained_snapshots == 0 {
            return Err(SnapshotError::Validation(
                "maxRetainedSnapshots must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Interval between automatic snapshots.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.auto_snapshot_interval_minutes) * 60)
    }

    /// Apply the fields set in `update`, returning the merged config.
    pub fn merged(&self, update: &ConfigUpdate) -> Self {
        Self {
            auto_snapshot_enabled: update
                .auto_snapshot_enabled
                .unwrap_or(self.auto_snapshot_enabled),
            auto_snapshot_interval_minutes: update
                .auto_snapshot_interval_minutes
                .unwrap_or(self.auto_snapshot_interval_minutes),
            max_retained_snapshots: update
                .max_retained_snapshots
                .unwrap_or(self.max_retained_snapshots),
            compression_enabled: update
                .compression_enabled
                .unwrap_or(self.compression_enabled),
        }
    }
}

/// Partial update of a [`SnapshotConfig`]; `None` fields are left alone.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_snapshot_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_snapshot_interval_minutes: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retained_snapshots: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression_enabled: Option<bool>,
}

/// Options fixed by the composition root when building a manager.
#[derive(Clone, Debug)]
pub struct ManagerOptions {
    /// Key holding the snapshot list.
    pub snapshots_key: String,

    /// Key holding the persisted settings.
    pub config_key: String,

    /// Schema tag stamped on new snapshots.
    pub schema_version: String,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            snapshots_key: DEFAULT_SNAPSHOTS_KEY.to_string(),
            config_key: DEFAULT_CONFIG_KEY.to_string(),
            schema_version: SCHEMA_VERSION.to_string(),
        }
    }
}
