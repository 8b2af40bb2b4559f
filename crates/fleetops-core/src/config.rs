//! Configuration management for fleetops
//!
//! Handles loading of the settings file that tunes:
//! - Connection, command and transfer deadlines
//! - Monitor scheduling tick and alert retention
//! - Sync history retention
//! - Where entity definitions are persisted

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::utils::expand_tilde;

const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 30;
const DEFAULT_TRANSFER_TIMEOUT_SECS: u64 = 300;
const DEFAULT_MONITOR_TICK_MS: u64 = 1000;
const DEFAULT_MAX_ALERTS: usize = 1000;
const DEFAULT_MAX_SYNC_HISTORY: usize = 100;

/// Main settings file structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FleetSettings {
    pub state_dir: String,
    pub connect_timeout_secs: u64,
    pub command_timeout_secs: u64,
    pub transfer_timeout_secs: u64,
    pub monitor_tick_ms: u64,
    pub max_alerts: usize,
    pub max_sync_history: usize,
}

impl Default for FleetSettings {
    fn default() -> Self {
        Self {
            state_dir: "~/.local/share/fleetops".to_string(),
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            command_timeout_secs: DEFAULT_COMMAND_TIMEOUT_SECS,
            transfer_timeout_secs: DEFAULT_TRANSFER_TIMEOUT_SECS,
            monitor_tick_ms: DEFAULT_MONITOR_TICK_MS,
            max_alerts: DEFAULT_MAX_ALERTS,
            max_sync_history: DEFAULT_MAX_SYNC_HISTORY,
        }
    }
}

/// Deadlines used by the registry when talking to servers
#[derive(Debug, Clone, Copy)]
pub struct RegistrySettings {
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub transfer_timeout: Duration,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        FleetSettings::default().registry()
    }
}

/// Scheduler and retention settings for the cluster monitor
#[derive(Debug, Clone, Copy)]
pub struct MonitorSettings {
    pub tick: Duration,
    pub max_alerts: usize,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        FleetSettings::default().monitor()
    }
}

/// Retention settings for the config sync manager
#[derive(Debug, Clone, Copy)]
pub struct SyncSettings {
    pub max_history: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        FleetSettings::default().sync()
    }
}

impl FleetSettings {
    /// Load settings from `~/.config/fleetops/config.json`, falling back to
    /// defaults, then apply environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = Self::get_config_path()?;
        let mut settings: FleetSettings = if config_path.exists() {
            let content = fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            serde_json::from_str(&content).context("Failed to parse config file")?
        } else {
            Self::default()
        };

        settings.apply_env_overrides()?;
        Ok(settings)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(dir) = std::env::var("FLEETOPS_STATE_DIR") {
            self.state_dir = dir;
        }
        if let Ok(secs) = std::env::var("FLEETOPS_CONNECT_TIMEOUT") {
            self.connect_timeout_secs = secs
                .parse()
                .context("FLEETOPS_CONNECT_TIMEOUT must be a number of seconds")?;
        }
        if let Ok(secs) = std::env::var("FLEETOPS_COMMAND_TIMEOUT") {
            self.command_timeout_secs = secs
                .parse()
                .context("FLEETOPS_COMMAND_TIMEOUT must be a number of seconds")?;
        }
        Ok(())
    }

    pub fn state_dir(&self) -> PathBuf {
        PathBuf::from(expand_tilde(&self.state_dir))
    }

    pub fn registry(&self) -> RegistrySettings {
        RegistrySettings {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            command_timeout: Duration::from_secs(self.command_timeout_secs),
            transfer_timeout: Duration::from_secs(self.transfer_timeout_secs),
        }
    }

    pub fn monitor(&self) -> MonitorSettings {
        MonitorSettings {
            tick: Duration::from_millis(self.monitor_tick_ms.max(1)),
            max_alerts: self.max_alerts.max(1),
        }
    }

    pub fn sync(&self) -> SyncSettings {
        SyncSettings {
            max_history: self.max_sync_history.max(1),
        }
    }

    fn get_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().context("Failed to get config directory")?;
        Ok(config_dir.join("fleetops/config.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_settings_file_uses_defaults() {
        let settings: FleetSettings =
            serde_json::from_str(r#"{"maxAlerts": 5, "commandTimeoutSecs": 7}"#).unwrap();
        assert_eq!(settings.max_alerts, 5);
        assert_eq!(settings.command_timeout_secs, 7);
        assert_eq!(settings.connect_timeout_secs, DEFAULT_CONNECT_TIMEOUT_SECS);
        assert_eq!(settings.registry().command_timeout, Duration::from_secs(7));
    }

    #[test]
    fn test_zero_limits_are_clamped() {
        let settings = FleetSettings {
            max_alerts: 0,
            monitor_tick_ms: 0,
            max_sync_history: 0,
            ..Default::default()
        };
        assert_eq!(settings.monitor().max_alerts, 1);
        assert_eq!(settings.monitor().tick, Duration::from_millis(1));
        assert_eq!(settings.sync().max_history, 1);
    }

    #[test]
    fn test_state_dir_expands_tilde() {
        let settings = FleetSettings::default();
        assert!(!settings.state_dir().to_string_lossy().starts_with('~'));
    }
}
