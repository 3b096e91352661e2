//! Client configuration parsing and validation.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::transport::socket::parse_address;
use crate::{AppError, Result};

/// Log levels understood by the agent's `--log-level` flag.
pub const LOG_LEVELS: &[&str] = &["none", "error", "warning", "info", "debug", "all"];

fn default_cli_path() -> String {
    "copilot".into()
}

fn default_log_level() -> String {
    "info".into()
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout_seconds() -> u64 {
    10
}

/// How the client reaches the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportKind {
    /// Spawn the agent and talk over its stdio.
    Process,
    /// Connect to an agent already listening on TCP.
    Socket {
        /// Host name or address.
        host: String,
        /// TCP port.
        port: u16,
    },
}

/// Client configuration, typically parsed from `agent-link.toml`.
///
/// Every field has a default, so an empty file is a valid stdio
/// configuration.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ClientConfig {
    /// Agent executable launched in stdio mode.
    #[serde(default = "default_cli_path")]
    pub cli_path: String,
    /// Extra arguments placed before the server-mode arguments.
    #[serde(default)]
    pub cli_args: Vec<String>,
    /// Working directory for the agent process.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// Agent log level passed as `--log-level`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Environment overrides for the agent process.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Inherit the parent environment; `false` keeps only an allowlist.
    #[serde(default = "default_true")]
    pub inherit_env: bool,
    /// Address of an already-running agent; selects the TCP transport.
    #[serde(default)]
    pub cli_url: Option<String>,
    /// Per-request deadline in seconds; 0 means no deadline.
    #[serde(default)]
    pub request_timeout_seconds: u64,
    /// TCP connect deadline in seconds; 0 means no deadline.
    #[serde(default = "default_connect_timeout_seconds")]
    pub connect_timeout_seconds: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            cli_path: default_cli_path(),
            cli_args: Vec::new(),
            cwd: None,
            log_level: default_log_level(),
            env: HashMap::new(),
            inherit_env: true,
            cli_url: None,
            request_timeout_seconds: 0,
            connect_timeout_seconds: default_connect_timeout_seconds(),
        }
    }
}

impl ClientConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read, contains
    /// invalid TOML, or fails validation.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse and validate configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration that connects to an agent at `address`.
    #[must_use]
    pub fn for_url(address: impl Into<String>) -> Self {
        Self {
            cli_url: Some(address.into()),
            ..Self::default()
        }
    }

    /// Check field combinations that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` when `cli_url` does not parse, when
    /// `cli_url` is combined with process-launch settings, or when
    /// `log_level` is unknown.
    pub fn validate(&self) -> Result<()> {
        if let Some(url) = &self.cli_url {
            parse_address(url)?;
            if self.cli_path != default_cli_path() || !self.cli_args.is_empty() {
                return Err(AppError::Config(
                    "cli_url is mutually exclusive with cli_path and cli_args".into(),
                ));
            }
        }

        if self.cli_path.trim().is_empty() {
            return Err(AppError::Config("cli_path must not be empty".into()));
        }

        if !LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(AppError::Config(format!(
                "log_level '{}' must be one of {}",
                self.log_level,
                LOG_LEVELS.join(", ")
            )));
        }

        Ok(())
    }

    /// Transport selected by this configuration.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if `cli_url` does not parse.
    pub fn transport_kind(&self) -> Result<TransportKind> {
        match &self.cli_url {
            Some(url) => {
                let (host, port) = parse_address(url)?;
                Ok(TransportKind::Socket { host, port })
            }
            None => Ok(TransportKind::Process),
        }
    }

    /// Default per-request deadline, if any.
    #[must_use]
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_seconds > 0).then(|| Duration::from_secs(self.request_timeout_seconds))
    }

    /// TCP connect deadline, if any.
    #[must_use]
    pub fn connect_timeout(&self) -> Option<Duration> {
        (self.connect_timeout_seconds > 0).then(|| Duration::from_secs(self.connect_timeout_seconds))
    }
}
