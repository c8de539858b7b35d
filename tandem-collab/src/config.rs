//! Host configuration: defaults for the command surface and client tuning.
//!
//! Sources, lowest precedence first: built-in defaults, an optional JSON
//! file, then `TANDEM_DEFAULT_*` environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::client::ClientConfig;
use crate::codec::DEFAULT_MAX_FRAME_LEN;

pub const ENV_DEFAULT_NAME: &str = "TANDEM_DEFAULT_NAME";
pub const ENV_DEFAULT_PORT: &str = "TANDEM_DEFAULT_PORT";
pub const ENV_DEFAULT_ADDRESS: &str = "TANDEM_DEFAULT_ADDRESS";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid value `{value}` for {key}")]
    InvalidValue { key: &'static str, value: String },
}

/// Defaults used when a command leaves an argument out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub default_name: Option<String>,
    pub default_port: Option<u16>,
    pub default_address: Option<String>,
    pub send_interval_ms: u64,
    pub receive_timeout_ms: u64,
    pub palette_size: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            default_name: None,
            default_port: Some(9090),
            default_address: None,
            send_interval_ms: 100,
            receive_timeout_ms: 10,
            palette_size: 11,
        }
    }
}

impl HostConfig {
    /// Read a JSON config file. Missing keys keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Defaults, then `path` if given, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_from(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Override defaults from `lookup` (normally the environment).
    /// Empty values are ignored.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.is_empty());

        if let Some(name) = get(ENV_DEFAULT_NAME) {
            self.default_name = Some(name);
        }
        if let Some(address) = get(ENV_DEFAULT_ADDRESS) {
            self.default_address = Some(address);
        }
        if let Some(port) = get(ENV_DEFAULT_PORT) {
            let parsed = port.parse().map_err(|_| ConfigError::InvalidValue {
                key: ENV_DEFAULT_PORT,
                value: port.clone(),
            })?;
            self.default_port = Some(parsed);
        }
        Ok(())
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            send_interval: Duration::from_millis(self.send_interval_ms),
            receive_timeout: Duration::from_millis(self.receive_timeout_ms),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}
