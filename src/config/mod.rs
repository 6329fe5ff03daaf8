use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::serial::interface::DEFAULT_BAUD_RATE;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// External firmware programmer invocation.
///
/// `{image}` and `{port}` in `args` are replaced with the firmware image path
/// and the port name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgrammerConfig {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for ProgrammerConfig {
    fn default() -> Self {
        Self {
            program: "dpgm".to_string(),
            args: vec![
                "--port".to_string(),
                "{port}".to_string(),
                "--hex".to_string(),
                "{image}".to_string(),
            ],
        }
    }
}

/// Agent settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub baud_rate: u32,
    pub transaction_timeout_ms: u64,
    pub probe_timeout_ms: u64,
    pub bootloader_timeout_ms: u64,
    pub quiescence_ms: u64,
    pub programmer: ProgrammerConfig,
    pub log_level: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            transaction_timeout_ms: 2000,
            probe_timeout_ms: 1000,
            bootloader_timeout_ms: 2000,
            quiescence_ms: 50,
            programmer: ProgrammerConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        log::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn bootloader_timeout(&self) -> Duration {
        Duration::from_millis(self.bootloader_timeout_ms)
    }

    pub fn quiescence(&self) -> Duration {
        Duration::from_millis(self.quiescence_ms)
    }
}
