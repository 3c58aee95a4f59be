//! Launcher configuration schema
//!
//! Every field has a default, so an absent or partial `dev_launch.yaml` is valid.

use crate::runtime::reaper::PortRange;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File looked up in the project root when no explicit config path is given
pub const DEFAULT_CONFIG_FILE: &str = "dev_launch.yaml";

/// Root launcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    /// Directory the dev server is started in
    pub project_root: PathBuf,

    /// Host used for fallback and default URLs
    pub host: String,

    /// Statically configured dev server port
    pub port: u16,

    /// Ports to free before starting (defaults to `port`)
    pub reap_ports: Option<PortRange>,

    /// Primary dev server command
    pub command: CommandConfig,

    /// Dependency install step (skipped when `None`)
    pub install: Option<InstallConfig>,

    /// Extra environment for the primary process
    pub env: HashMap<String, String>,

    /// Phase timeouts
    pub timeouts: TimeoutConfig,

    /// Open a browser once a URL is chosen
    pub open_browser: bool,

    /// Sidecar emulator settings (used only in emulator mode)
    pub emulator: EmulatorConfig,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            project_root: PathBuf::from("."),
            host: "localhost".to_string(),
            port: 5173,
            reap_ports: None,
            command: CommandConfig::default(),
            install: Some(InstallConfig::default()),
            env: HashMap::new(),
            timeouts: TimeoutConfig::default(),
            open_browser: true,
            emulator: EmulatorConfig::default(),
        }
    }
}

/// A program plus its arguments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            program: "npm".to_string(),
            args: vec!["run".to_string(), "dev".to_string()],
        }
    }
}

/// Dependency install step, run when `tool` cannot be found locally
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallConfig {
    #[serde(default = "default_install_program")]
    pub program: String,
    #[serde(default = "default_install_args")]
    pub args: Vec<String>,
    /// Binary expected under `node_modules/.bin` once dependencies are installed
    #[serde(default = "default_install_tool")]
    pub tool: String,
}

fn default_install_program() -> String {
    "npm".to_string()
}

fn default_install_args() -> Vec<String> {
    vec!["install".to_string()]
}

fn default_install_tool() -> String {
    "vite".to_string()
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            program: default_install_program(),
            args: default_install_args(),
            tool: default_install_tool(),
        }
    }
}

impl InstallConfig {
    /// Human-readable command line, used in remediation messages
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Phase timeouts in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// How long to wait for the server to announce a URL
    pub url_secs: u64,
    /// Readiness budget for an announced URL
    pub verify_secs: u64,
    /// Readiness budget for a fallback-derived URL
    pub fallback_verify_secs: u64,
    /// Readiness budget for the emulator ports
    pub emulator_secs: u64,
    /// Grace period between SIGTERM and SIGKILL
    pub shutdown_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            url_secs: 30,
            verify_secs: 12,
            fallback_verify_secs: 5,
            emulator_secs: 60,
            shutdown_secs: 5,
        }
    }
}

impl TimeoutConfig {
    pub fn url(&self) -> Duration {
        Duration::from_secs(self.url_secs)
    }

    pub fn verify(&self) -> Duration {
        Duration::from_secs(self.verify_secs)
    }

    pub fn fallback_verify(&self) -> Duration {
        Duration::from_secs(self.fallback_verify_secs)
    }

    pub fn emulator(&self) -> Duration {
        Duration::from_secs(self.emulator_secs)
    }

    pub fn shutdown(&self) -> Duration {
        Duration::from_secs(self.shutdown_secs)
    }
}

/// Firebase-style emulator sidecar
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmulatorConfig {
    /// Emulator CLI executable
    pub program: String,
    /// Service passed to `--only`
    pub service: String,
    /// Project id passed to `--project` and written as the default alias
    pub project: String,
    /// Config file passed to `--config`, relative to the project root
    pub config_file: String,
    /// Project alias file, relative to the project root
    pub alias_file: String,
    /// Host the emulator ports are probed on
    pub host: String,
    /// Data-plane port
    pub data_port: u16,
    /// Admin UI port
    pub ui_port: u16,
    /// Variable set to `true` in the primary process environment
    pub env_flag: String,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            program: "firebase".to_string(),
            service: "firestore".to_string(),
            project: "demo-project".to_string(),
            config_file: "firebase.json".to_string(),
            alias_file: ".firebaserc".to_string(),
            host: "127.0.0.1".to_string(),
            data_port: 8080,
            ui_port: 4000,
            env_flag: "VITE_USE_EMULATOR".to_string(),
        }
    }
}

impl EmulatorConfig {
    /// Arguments for `<program> emulators:start ...`
    pub fn args(&self) -> Vec<String> {
        vec![
            "emulators:start".to_string(),
            "--only".to_string(),
            self.service.clone(),
            "--project".to_string(),
            self.project.clone(),
            "--config".to_string(),
            self.config_file.clone(),
        ]
    }

    pub fn ports(&self) -> [u16; 2] {
        [self.data_port, self.ui_port]
    }
}

impl LaunchConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_str(&content)
    }

    /// Parse configuration from a YAML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: LaunchConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `dev_launch.yaml` from `project_root` if it exists, defaults otherwise.
    ///
    /// The returned config always has `project_root` set to the given directory.
    pub fn load(project_root: &Path, explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => {
                let candidate = project_root.join(DEFAULT_CONFIG_FILE);
                candidate.is_file().then_some(candidate)
            }
        };

        let mut config = match path {
            Some(path) => {
                log::debug!("Loading config from {}", path.display());
                Self::from_file(&path)?
            }
            None => Self::default(),
        };
        config.project_root = project_root.to_path_buf();
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.command.program.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "command.program must not be empty".to_string(),
            ));
        }
        if self.port == 0 {
            return Err(ConfigError::Invalid("port must be non-zero".to_string()));
        }
        if let Some(range) = &self.reap_ports {
            range.validate().map_err(ConfigError::Invalid)?;
        }
        if self.emulator.data_port == 0 || self.emulator.ui_port == 0 {
            return Err(ConfigError::Invalid(
                "emulator ports must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Ports freed before starting
    pub fn reap_range(&self) -> PortRange {
        self.reap_ports.unwrap_or(PortRange::single(self.port))
    }

    /// URL assumed when nothing better is known
    pub fn default_url(&self) -> String {
        format!("http://{}:{}/", self.host, self.port)
    }
}

/// Errors that can occur loading configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
