use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name looked up next to the watcher executable when `--config` is absent.
pub const DEFAULT_FILE_NAME: &str = "wintime.toml";

/// Top-level configuration loaded from wintime.toml.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
#[derive(Default)]
pub struct WintimeConfig {
    pub launch: LaunchConfig,
    pub log: LogConfig,
    pub companion: CompanionConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct LaunchConfig {
    /// Inject the agent (true) or launch plainly and read OS counters (false).
    pub inject: bool,
    pub agent_path: Option<PathBuf>,
    pub remote_load_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    pub separator: char,
    pub lock_retry_ms: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
#[derive(Default)]
pub struct CompanionConfig {
    /// Overrides the built-in companion file name.
    pub exe_name: Option<String>,
}

// --- Default implementations ---

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            inject: true,
            agent_path: None,
            remote_load_timeout_ms: 4000,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            separator: '\t',
            lock_retry_ms: 50,
        }
    }
}

impl LaunchConfig {
    pub fn remote_load_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_load_timeout_ms)
    }
}

impl LogConfig {
    pub fn lock_retry(&self) -> Duration {
        Duration::from_millis(self.lock_retry_ms)
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "invalid config {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

impl WintimeConfig {
    /// Load an explicitly named config file. Missing or malformed is an error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load the default config file from `dir`; a missing file means defaults.
    pub fn load_default(dir: &Path) -> Result<Self, ConfigError> {
        let path = dir.join(DEFAULT_FILE_NAME);
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        Self::load(&path)
    }
}
