use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::reference::ReferenceSource;

pub static CONFIG_PATH: Lazy<&'static Path> = Lazy::new(|| {
    Path::new(option_env!("INVIGIL_CONFIG_PATH").unwrap_or("/usr/local/etc/invigil/config.toml"))
});

/// Operator-facing file configuration for the `invigil` binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub camera: String,
    /// Directory holding the detector and encoder ONNX models.
    pub models_dir: PathBuf,
    /// URL or local path of the candidate's registered photo.
    pub reference_image: Option<String>,
    pub enabled: bool,
    pub check_interval_ms: u64,
    pub initial_delay_ms: u64,
    pub match_threshold: f32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            camera: "/dev/video0".to_string(),
            models_dir: PathBuf::from("/usr/local/share/invigil/models"),
            reference_image: None,
            enabled: true,
            check_interval_ms: 15_000,
            initial_delay_ms: 3_000,
            match_threshold: 0.6,
        }
    }
}

impl Config {
    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            enabled: self.enabled,
            check_interval: Duration::from_millis(self.check_interval_ms),
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            match_threshold: self.match_threshold,
            reference: self
                .reference_image
                .as_deref()
                .map(ReferenceSource::parse),
        }
    }
}

/// Per-session configuration of one identity monitor instance.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// When false, no checks ever run and the snapshot stays initial.
    pub enabled: bool,
    pub check_interval: Duration,
    /// Delay before the first check once all preconditions hold.
    pub initial_delay: Duration,
    /// Maximum embedding distance still considered a match (strict `<`).
    pub match_threshold: f32,
    pub reference: Option<ReferenceSource>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval: Duration::from_millis(15_000),
            initial_delay: Duration::from_millis(3_000),
            match_threshold: 0.6,
            reference: None,
        }
    }
}

pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = path.unwrap_or(&CONFIG_PATH);
    if !path.exists() {
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config at {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
}

pub fn save_config(cfg: &Config, path: Option<&Path>) -> Result<()> {
    let path = path.unwrap_or(&CONFIG_PATH);
    let data = toml::to_string_pretty(cfg)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, data)?;
    Ok(())
}
