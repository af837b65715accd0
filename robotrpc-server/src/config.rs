//! Server configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via ROBOTRPC_CONFIG)
//! 3. Environment variables

use robotrpc_core::{BotIdentity, CallerSpec, DirectoryConfig, HostConfig, TaskSpec};
use robotrpc_protocol::{Protocol, DEFAULT_PORT, MAX_BODY_SIZE};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable naming the YAML config file.
pub const CONFIG_ENV: &str = "ROBOTRPC_CONFIG";

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub network: NetworkConfig,
    /// Long-term memory locking and short-term memory lifetime.
    pub brain: BrainConfig,
    pub prompt: PromptConfig,
    pub pipeline: PipelineConfig,
    /// The robot's own identity.
    pub bot: BotIdentity,
    /// Known users and channels.
    pub directory: DirectoryConfig,
    /// Configured tasks, jobs and plugins.
    pub tasks: Vec<TaskSpec>,
    /// Callers registered at startup, for plugins run by hand.
    pub callers: Vec<CallerSpec>,
    pub metrics: MetricsConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var(CONFIG_ENV) {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))
    }

    fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        self.brain.apply_env_overrides();
        self.prompt.apply_env_overrides();
        self.pipeline.apply_env_overrides();
        self.metrics.apply_env_overrides();
    }

    /// Checks cross-section consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if Protocol::from_wire(&self.bot.protocol).is_none() {
            return Err(ConfigError::ValidationError(format!(
                "unknown bot protocol {:?}",
                self.bot.protocol
            )));
        }

        let mut names = HashSet::new();
        for task in &self.tasks {
            if task.name.is_empty() {
                return Err(ConfigError::ValidationError(
                    "task with empty name".to_string(),
                ));
            }
            if !names.insert(task.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate task {:?}",
                    task.name
                )));
            }
        }

        for caller in &self.callers {
            if !names.contains(caller.task.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "caller {:?} references unknown task {:?}",
                    caller.caller_id, caller.task
                )));
            }
        }

        if self.network.max_body_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "network.max_body_bytes must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Host engine settings derived from this configuration.
    pub fn host_config(&self) -> HostConfig {
        HostConfig {
            lock_timeout: self.brain.lock_timeout(),
            short_term_ttl: self.brain.short_term_ttl(),
            reply_timeout: self.prompt.reply_timeout(),
            pipeline_idle_timeout: self.pipeline.idle_timeout(),
            bot: self.bot.clone(),
            directory: self.directory.clone(),
            tasks: self.tasks.clone(),
        }
    }
}

fn env_flag(value: &str) -> bool {
    value == "1" || value.to_lowercase() == "true"
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Largest accepted request body.
    pub max_body_bytes: usize,
    /// How often expired locks and memories are swept.
    pub sweep_interval_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_PORT),
            max_body_bytes: MAX_BODY_SIZE,
            sweep_interval_secs: 30,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("ROBOTRPC_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }

        if let Ok(max) = std::env::var("ROBOTRPC_MAX_BODY_BYTES") {
            if let Ok(n) = max.parse() {
                self.max_body_bytes = n;
            }
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Memory configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrainConfig {
    /// Lifetime of a read-write datum checkout, in milliseconds.
    pub lock_timeout_ms: u64,
    /// Lifetime of a short-term memory, in seconds.
    pub short_term_ttl_secs: u64,
}

impl Default for BrainConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 2000,
            short_term_ttl_secs: 7 * 60,
        }
    }
}

impl BrainConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(timeout) = std::env::var("ROBOTRPC_LOCK_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse() {
                self.lock_timeout_ms = ms;
            }
        }

        if let Ok(ttl) = std::env::var("ROBOTRPC_SHORTTERM_TTL_SECS") {
            if let Ok(secs) = ttl.parse() {
                self.short_term_ttl_secs = secs;
            }
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn short_term_ttl(&self) -> Duration {
        Duration::from_secs(self.short_term_ttl_secs)
    }
}

/// Prompt configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    /// How long a prompt waits for its reply, in seconds.
    pub reply_timeout_secs: u64,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            reply_timeout_secs: 45,
        }
    }
}

impl PromptConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(timeout) = std::env::var("ROBOTRPC_REPLY_TIMEOUT_SECS") {
            if let Ok(secs) = timeout.parse() {
                self.reply_timeout_secs = secs;
            }
        }
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_secs(self.reply_timeout_secs)
    }
}

/// Pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Seconds a caller may stay silent before the sweeper finishes its
    /// pipeline and releases its exclusive tags.
    pub idle_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 600,
        }
    }
}

impl PipelineConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(idle) = std::env::var("ROBOTRPC_PIPELINE_IDLE_SECS") {
            if let Ok(secs) = idle.parse() {
                self.idle_timeout_secs = secs;
            }
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs.max(1))
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Serve `/metrics` alongside the RPC endpoint.
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl MetricsConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("ROBOTRPC_METRICS_ENABLED") {
            self.enabled = env_flag(&enabled);
        }
    }
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {1}", .0.display())]
    IoError(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config file '{}': {1}", .0.display())]
    ParseError(PathBuf, String),

    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

/// Custom serde module for SocketAddr (to handle as string in YAML).
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
