//! Configuration file management for drover.
//!
//! Provides a TOML-based config file at `~/.config/drover/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub runtime: RuntimeSection,
    #[serde(default)]
    pub limits: LimitsSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RuntimeSection {
    /// Agent runtime binary.
    pub command: Option<String>,
    /// Per-exchange response bound in seconds.
    pub response_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct LimitsSection {
    /// Global active-persona cap.
    pub max_active_personas: Option<usize>,
    /// Task-wait bound in seconds.
    pub task_timeout_secs: Option<u64>,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the drover config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/drover` or `~/.config/drover`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("drover");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("drover")
}

/// Return the path to the drover config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load the config file at `path`; an absent file yields defaults.
pub fn load_config_from(path: &Path) -> Result<ConfigFile> {
    if !path.exists() {
        return Ok(ConfigFile::default());
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    toml::from_str(&contents).context("failed to parse config file")
}

/// Load the config file from the default location.
pub fn load_config() -> Result<ConfigFile> {
    load_config_from(&config_path())
}

/// Serialize and write a config file, creating parent dirs as needed.
pub fn save_config_to(path: &Path, config: &ConfigFile) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create config directory {}", dir.display()))?;
    }
    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;
    Ok(())
}

// -----------------------------------------------------------------------
// Resolution
// -----------------------------------------------------------------------

/// Effective settings after applying the resolution chain.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub runtime_command: String,
    pub response_timeout: Duration,
    pub max_active_personas: usize,
    pub task_timeout: Duration,
}

impl ResolvedConfig {
    /// Resolve settings: CLI flag > env var > config file > default.
    pub fn resolve(
        cli_runtime: Option<&str>,
        cli_max_active: Option<usize>,
        cli_task_timeout_secs: Option<u64>,
    ) -> Result<Self> {
        let file = load_config()?;
        Ok(Self::from_parts(
            &file,
            cli_runtime,
            cli_max_active,
            cli_task_timeout_secs,
        ))
    }

    fn from_parts(
        file: &ConfigFile,
        cli_runtime: Option<&str>,
        cli_max_active: Option<usize>,
        cli_task_timeout_secs: Option<u64>,
    ) -> Self {
        let runtime_command = cli_runtime
            .map(str::to_string)
            .or_else(|| std::env::var("DROVER_RUNTIME").ok())
            .or_else(|| file.runtime.command.clone())
            .unwrap_or_else(|| "agent".to_string());

        let response_timeout =
            Duration::from_secs(file.runtime.response_timeout_secs.unwrap_or(30));

        let max_active_personas = cli_max_active
            .or(file.limits.max_active_personas)
            .unwrap_or(8);

        let task_timeout = Duration::from_secs(
            cli_task_timeout_secs
                .or(file.limits.task_timeout_secs)
                .unwrap_or(300),
        );

        Self {
            runtime_command,
            response_timeout,
            max_active_personas,
            task_timeout,
        }
    }
}
