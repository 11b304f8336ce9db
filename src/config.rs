use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use tracing::info;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_database_url")]
    pub database_url: String,
    /// User that owns feeds added from the command line
    #[serde(default)]
    pub current_user: Option<String>,
    #[serde(default)]
    pub aggregator: AggregatorConfig,
    /// Feeds seeded into the database on startup
    #[serde(default)]
    pub feeds: Vec<FeedConfig>,
}

fn default_database_url() -> String {
    "sqlite:gator.db?mode=rwc".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct AggregatorConfig {
    /// Delay between ticks in seconds
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Maximum number of feeds fetched per tick
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_store_timeout_secs")]
    pub store_timeout_secs: u64,
    /// Feed bodies larger than this are rejected
    #[serde(default = "default_max_feed_bytes")]
    pub max_feed_bytes: usize,
}

fn default_interval_secs() -> u64 {
    60
}

fn default_concurrency() -> usize {
    5
}

fn default_fetch_timeout_secs() -> u64 {
    10
}

fn default_store_timeout_secs() -> u64 {
    5
}

fn default_max_feed_bytes() -> usize {
    10 * 1024 * 1024
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            concurrency: default_concurrency(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            store_timeout_secs: default_store_timeout_secs(),
            max_feed_bytes: default_max_feed_bytes(),
        }
    }
}

impl AggregatorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FeedConfig {
    pub name: String,
    pub url: String,
    /// Falls back to `current_user` when omitted
    #[serde(default)]
    pub owner: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            current_user: None,
            aggregator: AggregatorConfig::default(),
            feeds: Vec::new(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
        Self::from_str(&content)
            .with_context(|| format!("Invalid config file '{}'", path.display()))
    }

    /// Like [`Config::load`], but a missing file yields the defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load(path)
    }

    /// Parse config from a TOML string (useful for testing)
    pub fn from_str(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.aggregator.validate()?;
        Ok(config)
    }
}

impl AggregatorConfig {
    fn validate(&self) -> anyhow::Result<()> {
        let settings = [
            ("interval_secs", self.interval_secs == 0),
            ("concurrency", self.concurrency == 0),
            ("fetch_timeout_secs", self.fetch_timeout_secs == 0),
            ("store_timeout_secs", self.store_timeout_secs == 0),
            ("max_feed_bytes", self.max_feed_bytes == 0),
        ];
        if let Some((key, _)) = settings.iter().find(|(_, is_zero)| *is_zero) {
            anyhow::bail!("aggregator.{} must be greater than zero", key);
        }
        Ok(())
    }
}
