//! Password agent settings, loaded from an optional YAML file.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Directory systemd drops `ask.*` request files into
pub const DEFAULT_ASK_DIR: &str = "/run/systemd/ask-password";

pub const DEFAULT_REQUEST_PREFIX: &str = "ask.";
pub const DEFAULT_BOOT_MARKER: &str = "boot";
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 1000;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("invalid config: {0}")]
    Parse(#[from] serde_yaml::Error),
}

pub type Result<T, E = ConfigError> = core::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    /// Directory watched for request files
    pub ask_dir: PathBuf,
    /// File name prefix identifying a request
    pub request_prefix: String,
    /// Substring of `Message=` that selects the boot key
    pub boot_marker: String,
    /// Upper bound on a single wait for notifications
    pub poll_timeout_ms: u64,
    /// Answer requests already pending when the agent starts
    pub answer_existing: bool,
    /// Reply `-` when the key cannot be read instead of staying silent
    pub send_negative_ack: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            ask_dir: PathBuf::from(DEFAULT_ASK_DIR),
            request_prefix: DEFAULT_REQUEST_PREFIX.to_owned(),
            boot_marker: DEFAULT_BOOT_MARKER.to_owned(),
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
            answer_existing: false,
            send_negative_ack: false,
        }
    }
}

impl AgentConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let yaml = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_yaml(&yaml)?;
        log::debug!("loaded {:?} from {}", config, path.display());
        Ok(config)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}
