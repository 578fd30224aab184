//! Configuration
//!
//! Loads `scriptlink.toml` and splits it into the per-layer configs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info};

use scriptlink_host::HostConfig;
use scriptlink_runtime::{ComponentConfig, GatewayConfig};

/// File name looked up by [`ScriptLinkConfig::discover`]
pub const CONFIG_FILE: &str = "scriptlink.toml";

/// Error type for config loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Failed to read config: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    TomlParseError(#[from] toml::de::Error),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Contents of `scriptlink.toml`. Every key is optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptLinkConfig {
    /// Base directory for relative script paths. Relative to the config file.
    pub scripts_root: Option<PathBuf>,
    pub interpreter: PathBuf,
    pub interpreter_args: Vec<String>,
    pub stop_grace_ms: u64,
    pub callback_timeout_ms: u64,
    /// Disconnect the shared transport while no script is running
    pub stop_transport_on_idle: bool,
    pub default_script: Option<PathBuf>,
    pub run_default_on_start: bool,
}

impl Default for ScriptLinkConfig {
    fn default() -> Self {
        Self {
            scripts_root: None,
            interpreter: PathBuf::from("node"),
            interpreter_args: Vec::new(),
            stop_grace_ms: 100,
            callback_timeout_ms: 30_000,
            stop_transport_on_idle: false,
            default_script: None,
            run_default_on_start: false,
        }
    }
}

impl ScriptLinkConfig {
    /// Load the config at `path`
    pub async fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path).await?;
        let mut config = Self::from_toml_str(&content)?;

        if let Some(root) = &config.scripts_root {
            if root.is_relative() {
                let base = path.parent().unwrap_or(Path::new("."));
                config.scripts_root = Some(base.join(root));
            }
        }

        info!("Loaded config from: {}", path.display());
        Ok(config)
    }

    /// Load `dir/scriptlink.toml`, or the defaults if there is none
    pub async fn discover(dir: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = dir.as_ref().join(CONFIG_FILE);
        if !path.exists() {
            debug!("No {} found, using defaults", CONFIG_FILE);
            return Ok(Self::default());
        }
        Self::load(path).await
    }

    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn component_config(&self) -> ComponentConfig {
        let mut config = ComponentConfig::default()
            .with_callback_timeout(Duration::from_millis(self.callback_timeout_ms))
            .run_default_on_start(self.run_default_on_start);
        if let Some(root) = &self.scripts_root {
            config = config.with_scripts_root(root);
        }
        if let Some(script) = &self.default_script {
            config = config.with_default_script(script);
        }
        config
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig::default()
            .with_ack_timeout(Duration::from_millis(self.callback_timeout_ms))
            .stop_on_idle(self.stop_transport_on_idle)
    }

    pub fn host_config(&self) -> HostConfig {
        HostConfig::new(&self.interpreter)
            .with_args(self.interpreter_args.clone())
            .with_stop_grace(Duration::from_millis(self.stop_grace_ms))
    }
}
