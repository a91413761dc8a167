use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

/// Main configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Inference host address
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub access_token: String,

    /// Longest wait for a single reply, in seconds. 0 waits forever.
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,

    /// Model used by `chat` when none is given
    #[serde(default)]
    pub default_model: Option<String>,

    /// Context size requested for new contexts and model loads
    #[serde(default = "default_context_size")]
    pub context_size: u32,

    /// System prompt queued at the start of every chat
    #[serde(default)]
    pub system_prompt: Option<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    4553
}

fn default_read_timeout() -> u64 {
    120
}

fn default_context_size() -> u32 {
    2048
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            username: String::new(),
            access_token: String::new(),
            read_timeout_secs: default_read_timeout(),
            default_model: None,
            context_size: default_context_size(),
            system_prompt: None,
        }
    }
}

impl Config {
    /// Load config from default location (~/.config/maip/config.toml)
    pub fn load() -> Self {
        match Self::config_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    /// Load config from a file. Missing or invalid files give the defaults.
    pub fn load_from(path: &Path) -> Self {
        let Ok(content) = std::fs::read_to_string(path) else {
            return Self::default();
        };
        toml::from_str(&content).unwrap_or_else(|e| {
            warn!(path = %path.display(), "Ignoring invalid config: {e}");
            Self::default()
        })
    }

    /// Get config file path
    fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("maip/config.toml"))
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        (self.read_timeout_secs > 0).then(|| Duration::from_secs(self.read_timeout_secs))
    }
}
