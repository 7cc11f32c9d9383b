//! Service configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub lookup: LookupConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Field device settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Directory holding `field.db`
    #[serde(default = "default_client_data_dir")]
    pub data_dir: PathBuf,

    /// Base URL of the sync server
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// Assessor identity presented to the server
    #[serde(default)]
    pub assessor_id: Option<Uuid>,

    #[serde(default)]
    pub tenant_id: Option<Uuid>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            data_dir: default_client_data_dir(),
            server_url: default_server_url(),
            assessor_id: None,
            tenant_id: None,
        }
    }
}

/// Authoritative sync server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Directory holding `server.db`
    #[serde(default = "default_server_data_dir")]
    pub data_dir: PathBuf,

    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            data_dir: default_server_data_dir(),
            listen_addr: default_listen_addr(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Background sync interval in milliseconds
    #[serde(default = "default_sync_interval")]
    pub sync_interval_ms: u64,

    /// Upper bound on a single pull or push round trip
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Maximum entities per push request
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,
}

impl SyncConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval_ms: default_sync_interval(),
            request_timeout_ms: default_request_timeout(),
            max_batch: default_max_batch(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LookupConfig {
    /// JSON seed file of lookup entries; the built-in curves are used when unset
    #[serde(default)]
    pub seed_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `tracing` filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

// Defaults
fn default_client_data_dir() -> PathBuf { PathBuf::from("./data/field") }
fn default_server_data_dir() -> PathBuf { PathBuf::from("./data/server") }
fn default_server_url() -> String { "http://127.0.0.1:8080".to_string() }
fn default_listen_addr() -> String { "0.0.0.0:8080".to_string() }
fn default_sync_interval() -> u64 { 30_000 }
fn default_request_timeout() -> u64 { 15_000 }
fn default_max_batch() -> usize { 200 }
fn default_log_filter() -> String { "verisca_sync=info".to_string() }

impl Config {
    /// Load config from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Load config from `path` if it exists, defaults otherwise
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }
}
