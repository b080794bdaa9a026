//! Configuration management for Omnicast

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ConfigError, Result};
use crate::types::{Account, Destination};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub rewards: RewardsConfig,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
    #[serde(default)]
    pub destinations: HashMap<String, DestinationConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "~/.local/share/omnicast/omnicast.db".to_string(),
        }
    }
}

/// Dispatch queue and worker pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub concurrency: usize,
    pub max_attempts: u32,
    pub backoff_base_secs: u64,
    pub poll_interval_ms: u64,
    /// Active jobs whose lease was not renewed for this long are returned to the queue
    pub stalled_after_secs: u64,
    /// How often a worker renews the lease on the job it is running
    pub heartbeat_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            max_attempts: 3,
            backoff_base_secs: 5,
            poll_interval_ms: 500,
            stalled_after_secs: 900,
            heartbeat_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub interval_secs: u64,
    /// How far ahead of now the sweep looks for due tasks
    pub window_secs: u64,
    /// Tasks created this close to their scheduled time are enqueued on creation
    pub immediate_threshold_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            window_secs: 120,
            immediate_threshold_secs: 120,
        }
    }
}

/// Media pipeline polling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub poll_delay_secs: u64,
    pub max_attempts: u32,
    pub retry_delay_secs: u64,
    /// Polls allowed before a still-processing task is failed
    pub max_polls: u32,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            poll_delay_secs: 20,
            max_attempts: 5,
            retry_delay_secs: 15,
            max_polls: 180,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    pub refresh_margin_secs: u64,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            refresh_margin_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub chunk_size_bytes: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size_bytes: 5 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardsConfig {
    pub points_per_publish: i64,
}

impl Default for RewardsConfig {
    fn default() -> Self {
        Self {
            points_per_publish: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub id: String,
    pub owner_id: String,
    pub destination: String,
    #[serde(default)]
    pub destination_uid: String,
}

impl AccountConfig {
    pub fn to_account(&self) -> Result<Account> {
        Ok(Account {
            id: self.id.clone(),
            owner_id: self.owner_id.clone(),
            destination: self.destination.parse()?,
            destination_uid: self.destination_uid.clone(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Base URL of the HTTP gateway that speaks this destination's API
    pub gateway_url: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self::default_config()
    }
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let config: Config = toml::from_str(&content).map_err(ConfigError::ParseError)?;
        config.validate()?;
        Ok(config)
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        Self {
            database: DatabaseConfig::default(),
            queue: QueueConfig::default(),
            scheduler: SchedulerConfig::default(),
            media: MediaConfig::default(),
            credentials: CredentialsConfig::default(),
            transfer: TransferConfig::default(),
            rewards: RewardsConfig::default(),
            accounts: Vec::new(),
            destinations: HashMap::new(),
        }
    }

    /// Reject settings the runtime cannot operate with
    pub fn validate(&self) -> Result<()> {
        if self.queue.concurrency == 0 {
            return Err(ConfigError::Invalid("queue.concurrency must be at least 1".to_string()).into());
        }
        if self.queue.max_attempts == 0 {
            return Err(ConfigError::Invalid("queue.max_attempts must be at least 1".to_string()).into());
        }
        if self.queue.heartbeat_secs == 0 || self.queue.heartbeat_secs >= self.queue.stalled_after_secs {
            return Err(ConfigError::Invalid(
                "queue.heartbeat_secs must be positive and below queue.stalled_after_secs".to_string(),
            )
            .into());
        }
        if self.media.max_attempts == 0 || self.media.max_polls == 0 {
            return Err(ConfigError::Invalid(
                "media.max_attempts and media.max_polls must be at least 1".to_string(),
            )
            .into());
        }
        if self.transfer.chunk_size_bytes == 0 {
            return Err(ConfigError::Invalid("transfer.chunk_size_bytes must be positive".to_string()).into());
        }
        for name in self.destinations.keys() {
            name.parse::<Destination>().map_err(|_| {
                ConfigError::Invalid(format!("unknown destination section [destinations.{}]", name))
            })?;
        }
        for account in &self.accounts {
            account.destination.parse::<Destination>().map_err(|_| {
                ConfigError::Invalid(format!(
                    "account {} has unknown destination '{}'",
                    account.id, account.destination
                ))
            })?;
        }
        Ok(())
    }

    pub fn destination(&self, destination: Destination) -> Option<&DestinationConfig> {
        self.destinations
            .iter()
            .find(|(name, _)| name.parse::<Destination>().ok() == Some(destination))
            .map(|(_, cfg)| cfg)
    }
}

impl QueueConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_secs(self.backoff_base_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stalled_after(&self) -> Duration {
        Duration::from_secs(self.stalled_after_secs)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }
}

impl SchedulerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn immediate_threshold(&self) -> Duration {
        Duration::from_secs(self.immediate_threshold_secs)
    }
}

/// Resolve the configuration file path following XDG Base Directory spec
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("OMNICAST_CONFIG") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("omnicast").join("config.toml"))
}
