use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::compression::OverflowPolicy;
use crate::policy::StorageConfig;

const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageBackend,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    pub telemetry: TelemetryConfig,
    /// Storage configs installed at startup.
    #[serde(default)]
    pub devices: Vec<StorageConfig>,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address for the HTTP server to listen on
    pub http_addr: SocketAddr,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Sqlite { path: PathBuf },
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Seconds between retention sweeps
    pub cleanup_interval_secs: u64,
    /// Number of compression workers
    pub compression_workers: usize,
    pub overflow: OverflowPolicy,
}

impl PipelineConfig {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_secs: DEFAULT_CLEANUP_INTERVAL_SECS,
            compression_workers: 1,
            overflow: OverflowPolicy::PassThrough,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TelemetryConfig {
    Mock {
        /// Interval in seconds between readings
        reading_interval_secs: u64,
        /// Number of simulated devices
        device_count: usize,
    },
}

impl Config {
    pub fn load(path: &Path) -> color_eyre::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                http_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8082)),
            },
            storage: StorageBackend::Memory,
            pipeline: PipelineConfig::default(),
            telemetry: TelemetryConfig::Mock {
                reading_interval_secs: 5,
                device_count: 3,
            },
            devices: Vec::new(),
        }
    }
}
