//! Agent configuration file.
//!
//! A single YAML file selected by `--config`, the `UNITD_CONFIG_FILE`
//! environment variable, or the `config.yml` default, in that order.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::errors::{AgentError, Result};

pub const CONFIG_FILE_ENV: &str = "UNITD_CONFIG_FILE";
pub const DEFAULT_CONFIG_FILE: &str = "config.yml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerTlsConfig {
    pub ca_cert: PathBuf,
    pub server_cert: PathBuf,
    pub server_key: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    pub bind_ip: String,
    pub tls: ServerTlsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Path of the units manifest (the desired-state file)
    pub units_config_path: PathBuf,
    #[serde(default)]
    pub log_level: String,
    pub server: ServerConfig,
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| AgentError::ConfigRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        serde_yaml::from_str(&content).map_err(|e| AgentError::ConfigParse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Map the configured level onto a tracing directive. Unknown values
    /// fall back to `info`.
    pub fn log_level(&self) -> tracing::Level {
        match self.log_level.to_lowercase().as_str() {
            "error" => tracing::Level::ERROR,
            "warning" => tracing::Level::WARN,
            "debug" => tracing::Level::DEBUG,
            _ => tracing::Level::INFO,
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.bind_ip, self.server.port)
    }
}

/// Resolve the config file path: explicit flag first, then the environment
/// variable, then the fixed default.
pub fn config_file_path(flag: Option<PathBuf>) -> PathBuf {
    flag.or_else(|| std::env::var_os(CONFIG_FILE_ENV).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}
