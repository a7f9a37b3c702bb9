//! TOML configuration parsing and validation.
//!
//! ```toml
//! [db]
//! path = "./data/appgetter.sqlite"
//!
//! [storage]
//! root = "./data/apps"
//!
//! [sandbox]
//! route_timeout_secs = 60
//!
//! [ingest]
//! supported_api_versions = [0]
//! max_package_bytes = 52428800
//! fetch_timeout_secs = 30
//!
//! [server]
//! bind = "127.0.0.1:7340"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Directory holding one subdirectory per package location.
    pub root: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SandboxConfig {
    /// Hard ceiling on route discovery before the sandbox is killed.
    #[serde(default = "default_route_timeout")]
    pub route_timeout_secs: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            route_timeout_secs: default_route_timeout(),
        }
    }
}

impl SandboxConfig {
    pub fn route_timeout(&self) -> Duration {
        Duration::from_secs(self.route_timeout_secs)
    }
}

fn default_route_timeout() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_api_versions")]
    pub supported_api_versions: Vec<u32>,
    #[serde(default = "default_max_package_bytes")]
    pub max_package_bytes: u64,
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            supported_api_versions: default_api_versions(),
            max_package_bytes: default_max_package_bytes(),
            fetch_timeout_secs: default_fetch_timeout(),
        }
    }
}

fn default_api_versions() -> Vec<u32> {
    vec![0]
}
fn default_max_package_bytes() -> u64 {
    50 * 1024 * 1024
}
fn default_fetch_timeout() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7340".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.sandbox.route_timeout_secs == 0 {
        anyhow::bail!("sandbox.route_timeout_secs must be > 0");
    }
    if config.ingest.supported_api_versions.is_empty() {
        anyhow::bail!("ingest.supported_api_versions must not be empty");
    }
    if config.ingest.max_package_bytes == 0 {
        anyhow::bail!("ingest.max_package_bytes must be > 0");
    }
    if config.ingest.fetch_timeout_secs == 0 {
        anyhow::bail!("ingest.fetch_timeout_secs must be > 0");
    }
    Ok(())
}
