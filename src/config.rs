//! Configuration loading for agent-relay.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::transport::TransportKind;

/// Get the agent-relay home directory (~/.agent-relay).
pub fn get_home_dir() -> Result<PathBuf> {
    let home = directories::UserDirs::new()
        .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?;

    Ok(home.home_dir().join(".agent-relay"))
}

/// Get the settings file path.
pub fn get_settings_path() -> Result<PathBuf> {
    Ok(get_home_dir()?.join("settings.json"))
}

/// Load settings from ~/.agent-relay/settings.json
pub fn load_settings() -> Result<Settings> {
    load_settings_from(&get_settings_path()?)
}

pub fn load_settings_from(path: &Path) -> Result<Settings> {
    if !path.exists() {
        return Err(Error::Config(format!(
            "Settings file not found at {}",
            path.display()
        )));
    }

    let content = std::fs::read_to_string(path)?;
    let mut settings: Settings = serde_json::from_str(&content)?;

    if settings.transport.path.is_none() {
        settings.transport.path = Some(default_database_path(path));
    }

    validate_settings(&settings)?;

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Database next to the settings file.
fn default_database_path(settings_path: &Path) -> PathBuf {
    settings_path
        .parent()
        .map(|dir| dir.join("relay.db"))
        .unwrap_or_else(|| PathBuf::from("relay.db"))
}

fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.supervisor_id.trim().is_empty() {
        return Err(Error::Config("supervisor_id must not be empty".to_string()));
    }
    if settings.queue.stream_prefix.trim().is_empty() {
        return Err(Error::Config("queue.stream_prefix must not be empty".to_string()));
    }
    if settings.queue.max_stream_len == 0 {
        return Err(Error::Config("queue.max_stream_len must be positive".to_string()));
    }
    if settings.registry.staleness_window_secs == 0 {
        return Err(Error::Config(
            "registry.staleness_window_secs must be positive".to_string(),
        ));
    }
    if settings.coordinator.stuck_task_threshold_secs == 0 {
        return Err(Error::Config(
            "coordinator.stuck_task_threshold_secs must be positive".to_string(),
        ));
    }
    if settings.coordinator.batch_size == 0 {
        return Err(Error::Config("coordinator.batch_size must be positive".to_string()));
    }
    if settings.coordinator.maintenance_interval_secs == 0 {
        return Err(Error::Config(
            "coordinator.maintenance_interval_secs must be positive".to_string(),
        ));
    }
    Ok(())
}

/// Load settings or return default if not found.
pub fn load_settings_or_default() -> Settings {
    load_settings().unwrap_or_else(|e| {
        tracing::warn!("Failed to load settings: {}, using defaults", e);
        let mut settings = Settings::default();
        settings.transport.path = get_settings_path().ok().map(|p| default_database_path(&p));
        settings
    })
}

/// Transport backend selection.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct TransportSettings {
    #[serde(default)]
    pub kind: TransportKind,

    /// SQLite file for the durable backend.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Queue configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct QueueSettings {
    #[serde(default = "default_stream_prefix")]
    pub stream_prefix: String,

    #[serde(default = "default_max_stream_len")]
    pub max_stream_len: usize,

    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,

    /// Broadcasts sent without an expiry get this one. Zero keeps them
    /// until trimmed.
    #[serde(default = "default_broadcast_ttl")]
    pub broadcast_ttl_secs: u64,
}

impl QueueSettings {
    pub fn broadcast_ttl(&self) -> Option<chrono::Duration> {
        (self.broadcast_ttl_secs > 0).then(|| chrono::Duration::seconds(self.broadcast_ttl_secs as i64))
    }
}

fn default_stream_prefix() -> String {
    "relay".to_string()
}

fn default_max_stream_len() -> usize {
    10_000
}

fn default_max_retries() -> u32 {
    crate::protocol::DEFAULT_MAX_RETRIES
}

fn default_broadcast_ttl() -> u64 {
    3600
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            stream_prefix: default_stream_prefix(),
            max_stream_len: default_max_stream_len(),
            default_max_retries: default_max_retries(),
            broadcast_ttl_secs: default_broadcast_ttl(),
        }
    }
}

/// Registry configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RegistrySettings {
    /// Heartbeat age after which an agent counts as gone.
    #[serde(default = "default_staleness_window")]
    pub staleness_window_secs: u64,

    #[serde(default)]
    pub snapshot_path: Option<PathBuf>,
}

fn default_staleness_window() -> u64 {
    300
}

impl RegistrySettings {
    pub fn staleness_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.staleness_window_secs as i64)
    }
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            staleness_window_secs: default_staleness_window(),
            snapshot_path: None,
        }
    }
}

/// Coordinator configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CoordinatorSettings {
    #[serde(default = "default_stuck_task_threshold")]
    pub stuck_task_threshold_secs: u64,

    /// Long-poll wait per inbound batch.
    #[serde(default = "default_poll_block_ms")]
    pub poll_block_ms: u64,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,
}

fn default_stuck_task_threshold() -> u64 {
    7200
}

fn default_poll_block_ms() -> u64 {
    1000
}

fn default_batch_size() -> usize {
    10
}

fn default_maintenance_interval() -> u64 {
    60
}

impl CoordinatorSettings {
    pub fn stuck_task_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stuck_task_threshold_secs as i64)
    }

    pub fn poll_block(&self) -> Duration {
        Duration::from_millis(self.poll_block_ms)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            stuck_task_threshold_secs: default_stuck_task_threshold(),
            poll_block_ms: default_poll_block_ms(),
            batch_size: default_batch_size(),
            maintenance_interval_secs: default_maintenance_interval(),
        }
    }
}

/// Log output. `RUST_LOG` still wins over `filter` when set.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct LoggingSettings {
    /// `EnvFilter` directives, e.g. `"info,agent_relay::core=trace"`.
    #[serde(default)]
    pub filter: Option<String>,

    /// Write the log file as JSON lines instead of text.
    #[serde(default)]
    pub json: bool,

    /// Log directory; defaults to the platform data directory.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

/// agent-relay settings.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Settings {
    #[serde(default = "default_supervisor_id")]
    pub supervisor_id: String,

    #[serde(default)]
    pub transport: TransportSettings,

    #[serde(default)]
    pub queue: QueueSettings,

    #[serde(default)]
    pub registry: RegistrySettings,

    #[serde(default)]
    pub coordinator: CoordinatorSettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}

fn default_supervisor_id() -> String {
    "supervisor".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            supervisor_id: default_supervisor_id(),
            transport: TransportSettings::default(),
            queue: QueueSettings::default(),
            registry: RegistrySettings::default(),
            coordinator: CoordinatorSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}
