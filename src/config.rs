// Configuration File Support
//
// TOML configuration for the execution service and its client, with
// environment variable overrides. The default file lives in the XDG config
// directory: ~/.config/execguard/config.toml

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::client::ClientConfig;
use crate::engine::{
    default_env_passthrough, EngineConfig, ExecutionMode, ResourceLimits, TimeoutPolicy,
    DEFAULT_MAX_OUTPUT_BYTES, DEFAULT_TIMEOUT_SECS, HARD_TIMEOUT_CEILING_SECS,
};
use crate::policy::{PolicyConfig, PolicyMode, PolicyValidator};
use crate::service::{ServiceConfig, DEFAULT_MAX_CONCURRENT};

/// Default RPC port
pub const DEFAULT_PORT: u16 = 50051;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,

    pub execution: ExecutionConfig,

    pub policy: PolicyConfig,

    pub client: ClientConfig,

    pub logging: LoggingConfig,
}

/// Listener and admission settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind (default: 127.0.0.1)
    pub bind: String,

    /// Port to listen on; 0 picks an ephemeral port
    pub port: u16,

    /// Maximum concurrent executions before callers get ResourceExhausted
    pub max_concurrent: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
        }
    }
}

/// How commands become processes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionModeKind {
    #[default]
    Shell,
    Direct,
}

impl std::str::FromStr for ExecutionModeKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "shell" => Ok(Self::Shell),
            "direct" => Ok(Self::Direct),
            other => anyhow::bail!("Invalid execution mode: {}. Must be 'shell' or 'direct'", other),
        }
    }
}

/// Execution engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutionConfig {
    pub mode: ExecutionModeKind,

    /// Shell used in shell mode (invoked as `<shell> -c <command>`)
    pub shell: String,

    /// Timeout applied when a request does not set one
    pub default_timeout_secs: u64,

    /// Ceiling on any request's timeout (at most 300)
    pub max_timeout_secs: u64,

    /// Output cap per execution
    pub max_output_bytes: usize,

    /// Delay between SIGTERM and SIGKILL
    pub kill_grace_ms: u64,

    /// Working directory for commands (default: the service's)
    pub working_dir: Option<PathBuf>,

    /// Pass the whole service environment to commands
    pub inherit_env: bool,

    /// Variables passed through when `inherit_env` is false
    pub env_passthrough: Vec<String>,

    pub limits: ResourceLimits,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionModeKind::Shell,
            shell: "/bin/sh".to_string(),
            default_timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_timeout_secs: HARD_TIMEOUT_CEILING_SECS,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            kill_grace_ms: 2000,
            working_dir: None,
            inherit_env: false,
            env_passthrough: default_env_passthrough(),
            limits: ResourceLimits::default(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from the default XDG config directory
    ///
    /// A missing file yields the defaults (plus environment overrides).
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed, or
    /// if the resulting configuration does not validate.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let config = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file from {:?}", path))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file from {:?}", path))?;
            tracing::info!("Loaded configuration from {:?}", path);
            config
        } else {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            Self::default()
        };

        let config = config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path
    ///
    /// Returns `~/.config/execguard/config.toml` on Linux
    pub fn config_path() -> PathBuf {
        if let Some(proj_dirs) = directories::ProjectDirs::from("dev", "execguard", "execguard") {
            proj_dirs.config_dir().join("config.toml")
        } else {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home)
                .join(".config")
                .join("execguard")
                .join("config.toml")
        }
    }

    /// Apply environment variable overrides
    ///
    /// Environment variables take precedence over config file values:
    /// - EXECGUARD_BIND, EXECGUARD_PORT, EXECGUARD_MAX_CONCURRENT
    /// - EXECGUARD_DEFAULT_TIMEOUT_SECS, EXECGUARD_MAX_TIMEOUT_SECS
    /// - EXECGUARD_MAX_OUTPUT_BYTES, EXECGUARD_EXECUTION_MODE
    /// - EXECGUARD_POLICY_MODE
    /// - EXECGUARD_ADDR (client target)
    /// - EXECGUARD_LOG_LEVEL, EXECGUARD_LOG_FORMAT
    ///
    /// Unparseable values are ignored with a warning.
    pub fn apply_env_overrides(self) -> Self {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable source
    pub fn apply_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(key: &str, value: Option<String>) -> Option<T> {
            let value = value?;
            match value.trim().parse() {
                Ok(parsed) => Some(parsed),
                Err(_) => {
                    tracing::warn!("Ignoring invalid value for {}: {:?}", key, value);
                    None
                }
            }
        }

        if let Some(bind) = lookup("EXECGUARD_BIND") {
            self.server.bind = bind;
        }
        if let Some(port) = parsed("EXECGUARD_PORT", lookup("EXECGUARD_PORT")) {
            self.server.port = port;
        }
        if let Some(max) = parsed("EXECGUARD_MAX_CONCURRENT", lookup("EXECGUARD_MAX_CONCURRENT")) {
            self.server.max_concurrent = max;
        }

        if let Some(secs) = parsed(
            "EXECGUARD_DEFAULT_TIMEOUT_SECS",
            lookup("EXECGUARD_DEFAULT_TIMEOUT_SECS"),
        ) {
            self.execution.default_timeout_secs = secs;
        }
        if let Some(secs) = parsed(
            "EXECGUARD_MAX_TIMEOUT_SECS",
            lookup("EXECGUARD_MAX_TIMEOUT_SECS"),
        ) {
            self.execution.max_timeout_secs = secs;
        }
        if let Some(bytes) = parsed(
            "EXECGUARD_MAX_OUTPUT_BYTES",
            lookup("EXECGUARD_MAX_OUTPUT_BYTES"),
        ) {
            self.execution.max_output_bytes = bytes;
        }
        if let Some(mode) = parsed::<ExecutionModeKind>(
            "EXECGUARD_EXECUTION_MODE",
            lookup("EXECGUARD_EXECUTION_MODE"),
        ) {
            self.execution.mode = mode;
        }

        if let Some(mode) = parsed::<PolicyMode>("EXECGUARD_POLICY_MODE", lookup("EXECGUARD_POLICY_MODE")) {
            self.policy.mode = mode;
        }

        if let Some(addr) = lookup("EXECGUARD_ADDR") {
            self.client.addr = addr;
        }

        if let Some(level) = lookup("EXECGUARD_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("EXECGUARD_LOG_FORMAT") {
            self.logging.format = format;
        }

        self
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                self.logging.level
            ),
        }

        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" | "compact" => {}
            _ => anyhow::bail!(
                "Invalid log format: {}. Must be one of: json, pretty, compact",
                self.logging.format
            ),
        }

        self.server
            .bind
            .parse::<IpAddr>()
            .with_context(|| format!("Invalid bind address: {}", self.server.bind))?;
        if self.server.max_concurrent == 0 {
            anyhow::bail!("max_concurrent must be > 0");
        }

        let execution = &self.execution;
        if execution.default_timeout_secs == 0 {
            anyhow::bail!("default_timeout_secs must be > 0");
        }
        if execution.max_timeout_secs == 0 {
            anyhow::bail!("max_timeout_secs must be > 0");
        }
        if execution.max_timeout_secs > HARD_TIMEOUT_CEILING_SECS {
            anyhow::bail!(
                "max_timeout_secs must be <= {} (got {})",
                HARD_TIMEOUT_CEILING_SECS,
                execution.max_timeout_secs
            );
        }
        if execution.default_timeout_secs > execution.max_timeout_secs {
            anyhow::bail!(
                "default_timeout_secs ({}) must not exceed max_timeout_secs ({})",
                execution.default_timeout_secs,
                execution.max_timeout_secs
            );
        }
        if execution.max_output_bytes == 0 {
            anyhow::bail!("max_output_bytes must be > 0");
        }
        if execution.kill_grace_ms > 60_000 {
            anyhow::bail!("kill_grace_ms must be <= 60000");
        }
        if execution.mode == ExecutionModeKind::Shell && execution.shell.trim().is_empty() {
            anyhow::bail!("shell must be set in shell execution mode");
        }

        PolicyValidator::from_config(&self.policy).context("Invalid policy configuration")?;

        if self.client.addr.trim().is_empty() {
            anyhow::bail!("client addr must not be empty");
        }
        if let Err(e) = self.client.retry.validate() {
            anyhow::bail!("client retry: {}", e);
        }

        Ok(())
    }

    /// Convert log level string to tracing::Level
    pub fn log_level(&self) -> Result<tracing::Level> {
        self.logging
            .level
            .to_lowercase()
            .parse()
            .map_err(|e| anyhow::anyhow!("Failed to parse log level: {}", e))
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .server
            .bind
            .parse()
            .with_context(|| format!("Invalid bind address: {}", self.server.bind))?;
        Ok(SocketAddr::new(ip, self.server.port))
    }

    pub fn engine_config(&self) -> EngineConfig {
        let execution = &self.execution;
        let mode = match execution.mode {
            ExecutionModeKind::Shell => ExecutionMode::Shell {
                program: execution.shell.clone(),
            },
            ExecutionModeKind::Direct => ExecutionMode::Direct,
        };

        EngineConfig {
            mode,
            max_output_bytes: execution.max_output_bytes,
            kill_grace_period: Duration::from_millis(execution.kill_grace_ms),
            working_dir: execution.working_dir.clone(),
            inherit_env: execution.inherit_env,
            env_passthrough: execution.env_passthrough.clone(),
            limits: execution.limits.clone(),
        }
    }

    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            timeouts: TimeoutPolicy::new(
                self.execution.default_timeout_secs,
                self.execution.max_timeout_secs,
            ),
            max_concurrent: self.server.max_concurrent,
        }
    }

    pub fn policy_validator(&self) -> Result<PolicyValidator> {
        PolicyValidator::from_config(&self.policy).context("Invalid policy configuration")
    }
}
