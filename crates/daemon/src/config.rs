//! Configuration management for the Backtick++ helper.
//!
//! Configuration is loaded from TOML files in the following locations (in order):
//! 1. The path given with `--config`
//! 2. The platform config dir (`~/Library/Application Support/com.backtick-plus-plus.backtick-helper/config.toml` on macOS)
//! 3. `~/.config/backtick-helper/config.toml`
//! 4. `./config.toml` (current directory, for development)

use anyhow::{Context, Result};
use backtick_ipc::SOCKET_PATH;
use backtick_platform::TargetApp;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure for the helper.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Socket and connection settings.
    pub server: ServerConfig,
    /// Which application's windows are managed.
    pub target: TargetConfig,
    /// Behavior configuration.
    pub behavior: BehaviorConfig,
}

/// Socket and connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Path of the listening Unix socket.
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Per-connection read/write timeout in milliseconds.
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,

    /// Listen backlog for pending connections.
    #[serde(default = "default_backlog")]
    pub backlog: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            io_timeout_ms: default_io_timeout_ms(),
            backlog: default_backlog(),
        }
    }
}

impl ServerConfig {
    /// Per-connection I/O timeout.
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

/// Target application matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    /// Substrings matched against the window owner's process name.
    #[serde(default = "default_owner_names")]
    pub owner_names: Vec<String>,

    /// Regex a window title must match to be listed.
    #[serde(default = "default_title_pattern")]
    pub title_pattern: Option<String>,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            owner_names: default_owner_names(),
            title_pattern: default_title_pattern(),
        }
    }
}

/// Behavior-related configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BehaviorConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

// Default value functions for serde
fn default_socket_path() -> PathBuf {
    PathBuf::from(SOCKET_PATH)
}

fn default_io_timeout_ms() -> u64 {
    5000
}

fn default_backlog() -> u32 {
    8
}

fn default_owner_names() -> Vec<String> {
    vec!["Code".to_string(), "Visual Studio Code".to_string()]
}

fn default_title_pattern() -> Option<String> {
    Some("— |Visual Studio Code".to_string())
}

fn default_log_level() -> String {
    "info".to_string()
}

const MIN_IO_TIMEOUT_MS: u64 = 100;
const MAX_IO_TIMEOUT_MS: u64 = 60_000;
const MAX_BACKLOG: u32 = 128;
const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// A problem found while validating configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    /// Dotted path of the offending field.
    pub field: String,
    /// What was wrong and what was used instead.
    pub message: String,
}

impl ConfigWarning {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl Config {
    /// Load configuration from standard locations.
    ///
    /// Returns default config if no file is found.
    pub fn load(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = explicit {
            return Self::load_from_path(path).map(|c| (c, Some(path.to_path_buf())));
        }

        for path in config_paths() {
            if path.exists() {
                let config = Self::load_from_path(&path)?;
                return Ok((config, Some(path)));
            }
        }

        Ok((Self::default(), None))
    }

    /// Load configuration from a specific path.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Clamp out-of-range values and report what was changed.
    pub fn validate(&mut self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        let timeout = self
            .server
            .io_timeout_ms
            .clamp(MIN_IO_TIMEOUT_MS, MAX_IO_TIMEOUT_MS);
        if timeout != self.server.io_timeout_ms {
            warnings.push(ConfigWarning::new(
                "server.io_timeout_ms",
                format!("{} out of range, using {}", self.server.io_timeout_ms, timeout),
            ));
            self.server.io_timeout_ms = timeout;
        }

        let backlog = self.server.backlog.clamp(1, MAX_BACKLOG);
        if backlog != self.server.backlog {
            warnings.push(ConfigWarning::new(
                "server.backlog",
                format!("{} out of range, using {}", self.server.backlog, backlog),
            ));
            self.server.backlog = backlog;
        }

        let level = self.behavior.log_level.to_lowercase();
        if LOG_LEVELS.contains(&level.as_str()) {
            self.behavior.log_level = level;
        } else {
            warnings.push(ConfigWarning::new(
                "behavior.log_level",
                format!("unknown level '{}', using info", self.behavior.log_level),
            ));
            self.behavior.log_level = default_log_level();
        }

        if self.server.socket_path.as_os_str().is_empty() {
            warnings.push(ConfigWarning::new(
                "server.socket_path",
                format!("empty path, using {}", SOCKET_PATH),
            ));
            self.server.socket_path = default_socket_path();
        }

        if self.target.owner_names.iter().all(|n| n.is_empty()) {
            warnings.push(ConfigWarning::new(
                "target.owner_names",
                "no owner names configured, no windows will be listed",
            ));
        }

        warnings
    }

    /// Build the target matcher, compiling the title pattern.
    ///
    /// An invalid pattern disables title filtering and is reported as a warning.
    pub fn compile_target(&self) -> (TargetApp, Option<ConfigWarning>) {
        let owners = self.target.owner_names.clone();
        match self.target.title_pattern.as_deref() {
            None | Some("") => (TargetApp::new(owners, None), None),
            Some(pattern) => match regex::Regex::new(pattern) {
                Ok(re) => (TargetApp::new(owners, Some(re)), None),
                Err(e) => (
                    TargetApp::new(owners, None),
                    Some(ConfigWarning::new(
                        "target.title_pattern",
                        format!("invalid regex '{}': {}, title filtering disabled", pattern, e),
                    )),
                ),
            },
        }
    }
}

/// Get all possible config file paths in priority order.
pub fn config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // 1. Platform standard config dir
    if let Some(proj_dirs) = ProjectDirs::from("com", "backtick-plus-plus", "backtick-helper") {
        paths.push(proj_dirs.config_dir().join("config.toml"));
    }

    // 2. Unix-style: ~/.config/backtick-helper/config.toml
    if let Some(home) = dirs_home() {
        paths.push(home.join(".config").join("backtick-helper").join("config.toml"));
    }

    // 3. Current directory: ./config.toml
    paths.push(PathBuf::from("config.toml"));

    paths
}

/// Get the user's home directory.
fn dirs_home() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf())
}
