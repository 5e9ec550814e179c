use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::fs;
use std::time::Duration;
use anyhow::{bail, Context, Result};

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub input: InputConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub advisory: AdvisoryConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct InputConfig {
    pub zones: PathBuf, // GeoJSON FeatureCollection
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Positions not refreshed within this many seconds are dropped on tick.
    #[serde(default)]
    pub position_ttl_secs: Option<u64>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            channel_capacity: default_channel_capacity(),
            position_ttl_secs: None,
        }
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn position_ttl(&self) -> Option<Duration> {
        self.position_ttl_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AdvisoryConfig {
    #[serde(default = "default_advisory_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for AdvisoryConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_advisory_timeout_ms(),
        }
    }
}

impl AdvisoryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_interval_ms() -> u64 {
    5000
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_advisory_timeout_ms() -> u64 {
    1500
}

impl AppConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: AppConfig = toml::from_str(&content)
            .with_context(|| "Failed to parse TOML configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sync.interval_ms == 0 {
            bail!("sync.interval_ms must be greater than zero");
        }
        if self.sync.channel_capacity == 0 {
            bail!("sync.channel_capacity must be greater than zero");
        }
        if self.sync.position_ttl_secs == Some(0) {
            bail!("sync.position_ttl_secs must be greater than zero when set");
        }
        Ok(())
    }
}
