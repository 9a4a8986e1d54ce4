//! Daemon configuration.
//!
//! Interval and timeout tuning for the schedulers, loadable from a TOML
//! file and overridable per field. Defaults match production deployments.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

/// Errors from loading a configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Sync scheduler tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Settle time after each push batch, rate-limiting churn when many
    /// tickets change together.
    pub quiesce_secs: u64,
    /// Deadline for a single passage push.
    pub push_timeout_secs: u64,
    /// Idle window after which a node's scheduler slot is dropped.
    pub slot_expiry_secs: u64,
    /// How often idle slots are garbage-collected.
    pub clean_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            quiesce_secs: 5,
            push_timeout_secs: 15,
            slot_expiry_secs: 6 * 60 * 60,
            clean_interval_secs: 30 * 60,
        }
    }
}

impl SyncConfig {
    pub const fn quiesce(&self) -> Duration {
        Duration::from_secs(self.quiesce_secs)
    }

    pub const fn push_timeout(&self) -> Duration {
        Duration::from_secs(self.push_timeout_secs)
    }

    pub const fn slot_expiry(&self) -> Duration {
        Duration::from_secs(self.slot_expiry_secs)
    }

    pub const fn clean_interval(&self) -> Duration {
        Duration::from_secs(self.clean_interval_secs)
    }
}

/// Maintenance scheduler tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Liveness ping cadence.
    pub ping_interval_secs: u64,
    /// Deadline for a single liveness ping.
    pub ping_timeout_secs: u64,
    /// Cadence of the expiry sweeps.
    pub sweep_interval_secs: u64,
    /// Delay before sync requests spawned from a maintenance tick, so
    /// they land after the tick's write-back commits.
    pub resync_delay_secs: u64,
    /// How long a down node may stay unseen before it is retired.
    pub retire_after_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: 60,
            ping_timeout_secs: 30,
            sweep_interval_secs: 60 * 60,
            resync_delay_secs: 1,
            retire_after_secs: 35 * 24 * 60 * 60,
        }
    }
}

impl MaintenanceConfig {
    pub const fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub const fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }

    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub const fn resync_delay(&self) -> Duration {
        Duration::from_secs(self.resync_delay_secs)
    }

    #[allow(clippy::cast_possible_wrap)]
    pub const fn retire_after(&self) -> i64 {
        self.retire_after_secs as i64
    }
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub sync: SyncConfig,
    pub maintenance: MaintenanceConfig,
}

impl DaemonConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_production_tuning() {
        let config = DaemonConfig::default();
        assert_eq!(config.sync.quiesce(), Duration::from_secs(5));
        assert_eq!(config.sync.push_timeout(), Duration::from_secs(15));
        assert_eq!(config.sync.slot_expiry(), Duration::from_secs(21_600));
        assert_eq!(config.maintenance.ping_interval(), Duration::from_secs(60));
        assert_eq!(config.maintenance.retire_after(), 3_024_000);
    }

    #[test]
    fn partial_toml_overrides_only_named_fields() {
        let config: DaemonConfig = toml::from_str(
            r#"
            [sync]
            quiesce_secs = 1

            [maintenance]
            ping_interval_secs = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.sync.quiesce_secs, 1);
        assert_eq!(config.sync.push_timeout_secs, 15);
        assert_eq!(config.maintenance.ping_interval_secs, 5);
        assert_eq!(config.maintenance.ping_timeout_secs, 30);
    }

    #[test]
    fn load_reads_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hawser.toml");
        std::fs::write(&path, "[sync]\npush_timeout_secs = 3\n").unwrap();
        let config = DaemonConfig::load(&path).unwrap();
        assert_eq!(config.sync.push_timeout_secs, 3);
    }
}
