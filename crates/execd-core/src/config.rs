use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CoordinatorConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub interpreter: InterpreterConfig,

    #[serde(default)]
    pub ledger: LedgerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Outbound messages buffered per client before a slow reader is
    /// disconnected.
    #[serde(default = "default_client_buffer")]
    pub client_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            client_buffer: default_client_buffer(),
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

fn default_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn default_port() -> u16 {
    8765
}

fn default_client_buffer() -> usize {
    1024
}

/// How the external interpreter process is launched and bootstrapped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InterpreterConfig {
    #[serde(default = "default_program")]
    pub program: String,

    /// Arguments placed before the code, which is always passed last.
    #[serde(default = "default_args")]
    pub args: Vec<String>,

    #[serde(default = "default_version_args")]
    pub version_args: Vec<String>,

    /// Command used to install each entry of `packages` during bootstrap.
    #[serde(default)]
    pub install_command: Option<Vec<String>>,

    #[serde(default)]
    pub packages: Vec<String>,

    /// Source prepended to every submitted program.
    #[serde(default)]
    pub prelude: Option<String>,

    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: default_args(),
            version_args: default_version_args(),
            install_command: None,
            packages: Vec::new(),
            prelude: None,
            working_dir: None,
        }
    }
}

fn default_program() -> String {
    "python3".to_string()
}

fn default_args() -> Vec<String> {
    vec!["-u".to_string(), "-c".to_string()]
}

fn default_version_args() -> Vec<String> {
    vec!["--version".to_string()]
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerConfig {
    #[serde(default = "default_command_buffer")]
    pub command_buffer: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            command_buffer: default_command_buffer(),
        }
    }
}

fn default_command_buffer() -> usize {
    64
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct LoggingConfig {
    /// Write logs to a timestamped file in this directory instead of stderr.
    pub directory: Option<PathBuf>,
    /// Used when RUST_LOG is not set.
    pub filter: Option<String>,
}

impl CoordinatorConfig {
    /// Default location: `<config dir>/execd/config.toml`.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let config_dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        Ok(config_dir.join("execd").join("config.toml"))
    }

    /// Loads an explicitly requested file. Missing or malformed files are errors.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path` if given, otherwise the default location if it exists,
    /// otherwise defaults. A broken file at the default location is logged
    /// and ignored.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::load_from(path);
        }

        let path = match Self::default_path() {
            Ok(path) => path,
            Err(_) => return Ok(Self::default()),
        };

        if !path.exists() {
            return Ok(Self::default());
        }

        match Self::load_from(&path) {
            Ok(config) => Ok(config),
            Err(e) => {
                tracing::warn!(
                    "Failed to load config file at {:?}: {}. Using defaults.",
                    path,
                    e
                );
                Ok(Self::default())
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interpreter.program.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "interpreter.program must not be empty".to_string(),
            ));
        }
        if self.server.client_buffer == 0 {
            return Err(ConfigError::Invalid(
                "server.client_buffer must be greater than zero".to_string(),
            ));
        }
        if self.ledger.command_buffer == 0 {
            return Err(ConfigError::Invalid(
                "ledger.command_buffer must be greater than zero".to_string(),
            ));
        }
        if !self.interpreter.packages.is_empty()
            && self
                .interpreter
                .install_command
                .as_ref()
                .is_none_or(|cmd| cmd.is_empty())
        {
            return Err(ConfigError::Invalid(
                "interpreter.packages requires interpreter.install_command".to_string(),
            ));
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}
