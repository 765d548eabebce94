//! Configuration management for devtrace
//!
//! This module handles loading, parsing, and managing configuration from:
//! 1. Embedded default_config.toml (compile-time defaults)
//! 2. User config at ~/.config/devtrace/config.toml (or platform-specific location)
//! 3. Project-local config at ./.devtrace/config.toml

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration embedded in binary
const DEFAULT_CONFIG: &str = include_str!("../../default_config.toml");

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub pty: PtyConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_app_name")]
    pub app_name: String,
    #[serde(default)]
    pub default_shell: Option<String>,
    /// Directory holding sessions.jsonl / events.jsonl
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            default_shell: None,
            data_dir: None,
        }
    }
}

/// PTY configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PtyConfig {
    /// Used when the outer terminal size cannot be queried
    #[serde(default = "default_rows")]
    pub default_rows: u16,
    #[serde(default = "default_cols")]
    pub default_cols: u16,
    /// TERM exported to the child when the parent has none
    #[serde(default = "default_term")]
    pub term: String,
}

impl Default for PtyConfig {
    fn default() -> Self {
        Self {
            default_rows: default_rows(),
            default_cols: default_cols(),
            term: default_term(),
        }
    }
}

/// Session bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Where per-session transports and hook files are created
    #[serde(default)]
    pub transport_dir: Option<PathBuf>,
    /// Grace period between the termination signal and SIGKILL in `stop()`
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    /// Upper bound on waiting for the output relay and parser at teardown
    #[serde(default = "default_teardown_timeout_ms")]
    pub teardown_timeout_ms: u64,
    /// Allowed skew between hook-reported and wall-clock duration
    #[serde(default = "default_duration_tolerance_ms")]
    pub duration_tolerance_ms: u64,
    #[serde(default = "default_true")]
    pub install_hooks: bool,
    /// Attach `git diff --numstat` totals for the command's directory to
    /// each completed event
    #[serde(default = "default_true")]
    pub git_metrics: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            transport_dir: None,
            stop_grace_ms: default_stop_grace_ms(),
            teardown_timeout_ms: default_teardown_timeout_ms(),
            duration_tolerance_ms: default_duration_tolerance_ms(),
            install_hooks: true,
            git_metrics: true,
        }
    }
}

impl BridgeConfig {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_timeout_ms)
    }

    /// Resolved transport directory: configured value, else the user runtime
    /// dir, else the system temp dir.
    pub fn resolved_transport_dir(&self) -> PathBuf {
        self.transport_dir
            .as_deref()
            .map(expand_path)
            .or_else(dirs::runtime_dir)
            .unwrap_or_else(std::env::temp_dir)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
    #[serde(default = "default_true")]
    pub timestamps: bool,
    #[serde(default = "default_false")]
    pub file_line: bool,
    #[serde(default = "default_true")]
    pub file_output: bool,
    #[serde(default)]
    pub file_path: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            timestamps: true,
            file_line: false,
            file_output: true,
            file_path: None,
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_app_name() -> String {
    "devtrace".to_string()
}

fn default_rows() -> u16 {
    24
}

fn default_cols() -> u16 {
    80
}

fn default_term() -> String {
    "xterm-256color".to_string()
}

fn default_stop_grace_ms() -> u64 {
    2000
}

fn default_teardown_timeout_ms() -> u64 {
    1000
}

fn default_duration_tolerance_ms() -> u64 {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

/// Expand a leading `~` and environment variables in a configured path.
pub fn expand_path(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    match shellexpand::full(&raw) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => PathBuf::from(shellexpand::tilde(&raw).as_ref()),
    }
}

// ============================================================================
// Configuration loading
// ============================================================================

/// Result of [`AppConfig::load`]. Loading runs before logging is set up, so
/// the caller reports `sources` and `skipped` once it is.
#[derive(Debug)]
pub struct LoadedConfig {
    pub config: AppConfig,
    /// Files merged over the defaults, in order
    pub sources: Vec<PathBuf>,
    /// Files that exist but could not be used
    pub skipped: Vec<(PathBuf, ConfigError)>,
}

impl AppConfig {
    /// Load configuration with fallback chain:
    /// 1. Embedded default_config.toml
    /// 2. User config ~/.config/devtrace/config.toml
    /// 3. Project-local .devtrace/config.toml
    ///
    /// Each file is merged key by key over the layers below it.
    pub fn load() -> Result<LoadedConfig, ConfigError> {
        let layers: Vec<PathBuf> = [Self::user_config_path(), Self::project_config_path()]
            .into_iter()
            .flatten()
            .collect();
        Self::load_layers(&layers)
    }

    /// Merge the given files, lowest precedence first, over the defaults.
    /// Missing files are ignored; unreadable or invalid ones are skipped.
    pub fn load_layers(paths: &[PathBuf]) -> Result<LoadedConfig, ConfigError> {
        let mut merged: toml::Value = toml::from_str(DEFAULT_CONFIG).map_err(|e| {
            ConfigError::ParseError(format!("Failed to parse default config: {}", e))
        })?;
        let mut sources = Vec::new();
        let mut skipped = Vec::new();

        for path in paths {
            if !path.exists() {
                continue;
            }
            match read_layer(path) {
                Ok(layer) => {
                    merge_layer(&mut merged, layer);
                    sources.push(path.clone());
                }
                Err(e) => skipped.push((path.clone(), e)),
            }
        }

        let config: AppConfig = merged
            .try_into()
            .map_err(|e| ConfigError::ParseError(format!("Invalid merged config: {}", e)))?;
        Ok(LoadedConfig {
            config,
            sources,
            skipped,
        })
    }

    /// Get the user config path (~/.config/devtrace/config.toml)
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|config_dir| config_dir.join("devtrace").join("config.toml"))
    }

    /// Get the project-local config path (./.devtrace/config.toml)
    pub fn project_config_path() -> Option<PathBuf> {
        std::env::current_dir()
            .ok()
            .map(|cwd| cwd.join(".devtrace").join("config.toml"))
    }

    /// Storage directory (defaults to <data_local_dir>/devtrace)
    pub fn data_dir(&self) -> PathBuf {
        self.general
            .data_dir
            .as_deref()
            .map(expand_path)
            .or_else(|| dirs::data_local_dir().map(|dir| dir.join(&self.general.app_name)))
            .unwrap_or_else(|| PathBuf::from(".devtrace"))
    }

    /// Shell to spawn when none is given on the command line
    pub fn shell(&self) -> String {
        self.general
            .default_shell
            .clone()
            .or_else(|| std::env::var("SHELL").ok().filter(|s| !s.is_empty()))
            .unwrap_or_else(|| "/bin/sh".to_string())
    }
}

/// Parse one config file, checking it on its own so a bad value is skipped
/// with its file instead of failing the merge.
fn read_layer(path: &Path) -> Result<toml::Value, ConfigError> {
    let contents =
        std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
    let layer: toml::Value = toml::from_str(&contents).map_err(|e| {
        ConfigError::ParseError(format!("Failed to parse {}: {}", path.display(), e))
    })?;
    layer.clone().try_into::<AppConfig>().map_err(|e| {
        ConfigError::ParseError(format!("Invalid value in {}: {}", path.display(), e))
    })?;
    Ok(layer)
}

/// Tables merge recursively; any other value replaces the one below.
fn merge_layer(base: &mut toml::Value, layer: toml::Value) {
    match (base, layer) {
        (toml::Value::Table(base), toml::Value::Table(layer)) => {
            for (key, value) in layer {
                match base.get_mut(&key) {
                    Some(existing) => merge_layer(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, layer) => *base = layer,
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        toml::from_str(DEFAULT_CONFIG).unwrap_or_else(|_| Self {
            general: GeneralConfig::default(),
            pty: PtyConfig::default(),
            bridge: BridgeConfig::default(),
            logging: LoggingConfig::default(),
        })
    }
}
