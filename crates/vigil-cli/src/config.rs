//! Configuration file management for vigil.
//!
//! Provides a TOML-based config file at `~/.config/vigil/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use vigil_core::{BroadcastConfig, SupervisorConfig};

/// Env var overriding the agent binary.
pub const ENV_AGENT_BINARY: &str = "VIGIL_AGENT_BINARY";
/// Env var overriding the model passed to the agent.
pub const ENV_MODEL: &str = "VIGIL_MODEL";

pub const DEFAULT_HARNESS: &str = "claude-code";
pub const DEFAULT_BINARY: &str = "claude";

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub agent: AgentSection,
    pub supervisor: SupervisorConfig,
    pub broadcast: BroadcastConfig,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// Registered harness name (e.g. "claude-code").
    pub harness: Option<String>,
    /// Path to the agent binary.
    pub binary: Option<String>,
    /// Model passed to the agent.
    pub model: Option<String>,
}

impl ConfigFile {
    /// The file `vigil init` writes: every setting spelled out with its default.
    pub fn with_defaults() -> Self {
        Self {
            agent: AgentSection {
                harness: Some(DEFAULT_HARNESS.to_string()),
                binary: Some(DEFAULT_BINARY.to_string()),
                model: None,
            },
            supervisor: SupervisorConfig::default(),
            broadcast: BroadcastConfig::default(),
        }
    }
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the vigil config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/vigil` or `~/.config/vigil`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("vigil");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("vigil")
}

/// Return the path to the vigil config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file at {}", path.display()))
}

/// Load the config file if present. A missing file is not an error; a file
/// that exists but does not parse is.
pub fn load_config_if_present() -> Result<Option<ConfigFile>> {
    if config_path().exists() {
        load_config().map(Some)
    } else {
        Ok(None)
    }
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config(config: &ConfigFile) -> Result<PathBuf> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(path)
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Values given on the command line, all optional.
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub harness: Option<String>,
    pub binary: Option<String>,
    pub model: Option<String>,
}

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct VigilConfig {
    pub harness: String,
    pub binary: String,
    pub model: Option<String>,
    pub supervisor: SupervisorConfig,
    pub broadcast: BroadcastConfig,
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl VigilConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config file > default.
    ///
    /// - Binary: `--binary` > `VIGIL_AGENT_BINARY` > `agent.binary` > `claude`
    /// - Model: `--model` > `VIGIL_MODEL` > `agent.model` > none
    /// - Harness: `--harness` > `agent.harness` > `claude-code`
    /// - Timings and buffer bounds come from the file or the defaults.
    pub fn resolve(cli: &CliOverrides) -> Result<Self> {
        let file = load_config_if_present()?.unwrap_or_default();

        let binary = cli
            .binary
            .clone()
            .or_else(|| non_empty_env(ENV_AGENT_BINARY))
            .or(file.agent.binary)
            .unwrap_or_else(|| DEFAULT_BINARY.to_string());

        let model = cli
            .model
            .clone()
            .or_else(|| non_empty_env(ENV_MODEL))
            .or(file.agent.model);

        let harness = cli
            .harness
            .clone()
            .or(file.agent.harness)
            .unwrap_or_else(|| DEFAULT_HARNESS.to_string());

        Ok(Self {
            harness,
            binary,
            model,
            supervisor: file.supervisor,
            broadcast: file.broadcast,
        })
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
