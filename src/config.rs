//! Configuration loader and validator for the push gateway.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
/// Timeouts and windows are plain integers: seconds everywhere except
/// `batch.lock_timeout`, which is milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Config {
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub firebase: Firebase,
    #[serde(default)]
    pub ourcloud: OurCloud,
    #[serde(default)]
    pub batch: Batch,
    #[serde(default)]
    pub status: Status,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Server {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_server_timeout")]
    pub read_timeout: u64,
    #[serde(default = "default_server_timeout")]
    pub write_timeout: u64,
}

/// Firebase Admin credentials for the FCM sender.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Firebase {
    #[serde(default)]
    pub credentials_file: String,
    #[serde(default)]
    pub project_id: String,
}

/// OurCloud node connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OurCloud {
    #[serde(default = "default_grpc_address")]
    pub grpc_address: String,
}

/// Notification batching settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Batch {
    /// Coalescing window in seconds.
    #[serde(default = "default_batch_window")]
    pub window: u64,
    #[serde(default = "default_batch_max_size")]
    pub max_size: usize,
    /// SQLite database file holding pending batches and statuses.
    #[serde(default = "default_storage_path")]
    pub storage_path: String,
    /// Per-endpoint lock acquisition timeout in milliseconds.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout: u64,
}

/// Delivery status retention settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Status {
    /// Seconds a terminal status row stays queryable.
    #[serde(default = "default_status_retention")]
    pub retention: u64,
}

fn default_port() -> u16 {
    8080
}

fn default_server_timeout() -> u64 {
    30
}

fn default_grpc_address() -> String {
    "localhost:50051".to_string()
}

fn default_batch_window() -> u64 {
    60
}

fn default_batch_max_size() -> usize {
    100
}

fn default_storage_path() -> String {
    "/var/lib/pushserver/batches".to_string()
}

fn default_lock_timeout_ms() -> u64 {
    100
}

fn default_status_retention() -> u64 {
    3600
}

impl Default for Server {
    fn default() -> Self {
        Self {
            port: default_port(),
            read_timeout: default_server_timeout(),
            write_timeout: default_server_timeout(),
        }
    }
}

impl Default for OurCloud {
    fn default() -> Self {
        Self {
            grpc_address: default_grpc_address(),
        }
    }
}

impl Default for Batch {
    fn default() -> Self {
        Self {
            window: default_batch_window(),
            max_size: default_batch_max_size(),
            storage_path: default_storage_path(),
            lock_timeout: default_lock_timeout_ms(),
        }
    }
}

impl Default for Status {
    fn default() -> Self {
        Self {
            retention: default_status_retention(),
        }
    }
}

impl Config {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.server.read_timeout)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.server.write_timeout)
    }

    pub fn batch_window(&self) -> Duration {
        Duration::from_secs(self.batch.window)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.batch.lock_timeout)
    }

    pub fn status_retention(&self) -> Duration {
        Duration::from_secs(self.status.retention)
    }

    /// Ensure the storage directory exists (creates the parent of
    /// `batch.storage_path` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        match Path::new(&self.batch.storage_path).parent() {
            Some(dir) if !dir.as_os_str().is_empty() => fs::create_dir_all(dir),
            _ => Ok(()),
        }
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.firebase.credentials_file.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "firebase.credentials_file must be non-empty",
        ));
    }
    if cfg.ourcloud.grpc_address.trim().is_empty() {
        return Err(ConfigError::Invalid("ourcloud.grpc_address must be non-empty"));
    }
    if cfg.batch.window == 0 {
        return Err(ConfigError::Invalid("batch.window must be > 0"));
    }
    if cfg.batch.max_size == 0 {
        return Err(ConfigError::Invalid("batch.max_size must be > 0"));
    }
    if cfg.batch.storage_path.trim().is_empty() {
        return Err(ConfigError::Invalid("batch.storage_path must be non-empty"));
    }
    if cfg.batch.lock_timeout == 0 {
        return Err(ConfigError::Invalid("batch.lock_timeout must be > 0"));
    }
    if cfg.status.retention == 0 {
        return Err(ConfigError::Invalid("status.retention must be > 0"));
    }
    Ok(())
}

/// Example configuration, used by tests and as documentation.
pub fn example() -> &'static str {
    r#"server:
  port: 8080
  read_timeout: 30
  write_timeout: 30

firebase:
  credentials_file: "/etc/pushserver/firebase-credentials.json"
  project_id: "my-project"

ourcloud:
  grpc_address: "localhost:50051"

batch:
  window: 60
  max_size: 100
  storage_path: "/var/lib/pushserver/batches"
  lock_timeout: 100

status:
  retention: 3600
"#
}
