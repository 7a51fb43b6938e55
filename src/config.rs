use crate::controller::poller::PollerSettings;
use crate::persistence::{config_dir, SETTINGS_FILE};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Runtime settings of the polling and remap pipeline.
///
/// Every field has a default, so a settings file only needs the values it
/// changes.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct EngineSettings {
    pub poll_rate_hz: u32,
    pub device_timeout_ms: u64,
    pub reconnect_interval_ms: u64,
    pub batch_queue_capacity: usize,
    pub output_retries: u32,
    pub report_capacity: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            poll_rate_hz: 250,
            device_timeout_ms: 5,
            reconnect_interval_ms: 2000,
            batch_queue_capacity: 8,
            output_retries: 3,
            report_capacity: 256,
        }
    }
}

impl EngineSettings {
    pub fn default_path() -> PathBuf {
        config_dir().join(SETTINGS_FILE)
    }

    /// Loads settings from `path`, falling back to defaults when it is absent.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No settings file at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .map_err(|e| eyre!("Failed to read settings file {}: {}", path.display(), e))?;
        let settings: EngineSettings = toml::from_str(&content)
            .map_err(|e| eyre!("Failed to parse settings file {}: {}", path.display(), e))?;
        info!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| eyre!("Failed to create settings directory: {}", e))?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| eyre!("Failed to serialize settings: {}", e))?;
        fs::write(path, content)
            .map_err(|e| eyre!("Failed to write settings file {}: {}", path.display(), e))?;
        Ok(())
    }

    pub fn poller_settings(&self) -> PollerSettings {
        PollerSettings {
            rate_hz: self.poll_rate_hz.max(1),
            device_timeout: Duration::from_millis(self.device_timeout_ms),
            reconnect_interval: Duration::from_millis(self.reconnect_interval_ms),
            queue_capacity: self.batch_queue_capacity.max(1),
        }
    }
}
