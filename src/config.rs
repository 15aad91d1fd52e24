//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `SESSIOND_LISTEN`, `SESSIOND_DATA_DIR`
//! 2. **Config file** — path via `--config <path>`, or `sessiond.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:4617"
//! data_dir = "/var/lib/acp-sessiond"
//! max_sessions = 64
//!
//! [agent]
//! command = ["acp-agent"]
//! name = "default"
//!
//! [permission]
//! timeout_secs = 300
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub permission: PermissionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP/WS server and resource-limit settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:4617`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Directory for persisted session stores (default `/var/lib/acp-sessiond`).
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Maximum concurrent live sessions (default 64).
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Per-observer outbound channel capacity (default 1000, see SPEC_FULL §5).
    #[serde(default = "default_observer_channel_capacity")]
    pub observer_channel_capacity: usize,
    /// Stream Buffer soft idle-flush timeout in milliseconds (default 200).
    #[serde(default = "default_buffer_soft_timeout_ms")]
    pub buffer_soft_timeout_ms: u64,
    /// Stream Buffer hard size limit in bytes before a forced flush (default 4096).
    #[serde(default = "default_buffer_hard_limit_bytes")]
    pub buffer_hard_limit_bytes: usize,
    /// Interval between registry sweeps in seconds (default 30).
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Queue auto-processing delay between messages in seconds (default 0).
    #[serde(default)]
    pub queue_delay_secs: u64,
    /// Whether queued messages are automatically submitted when idle (default true).
    #[serde(default = "default_true")]
    pub queue_enabled: bool,
}

/// Default agent invocation used when a session's create request omits one.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Argv used to spawn the agent subprocess (default `["acp-agent"]`).
    #[serde(default = "default_agent_command")]
    pub command: Vec<String>,
    /// Human-readable label for this agent, echoed in session metadata.
    #[serde(default = "default_agent_name")]
    pub name: String,
}

/// Permission-request handling.
#[derive(Debug, Clone, Deserialize)]
pub struct PermissionConfig {
    /// Seconds to wait for a `ui_prompt_answer` before resolving as denied (default 300).
    #[serde(default = "default_permission_timeout_secs")]
    pub timeout_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:4617".to_string()
}
fn default_data_dir() -> String {
    "/var/lib/acp-sessiond".to_string()
}
fn default_max_sessions() -> usize {
    64
}
fn default_observer_channel_capacity() -> usize {
    1000
}
fn default_buffer_soft_timeout_ms() -> u64 {
    200
}
fn default_buffer_hard_limit_bytes() -> usize {
    4096
}
fn default_sweep_interval_secs() -> u64 {
    30
}
fn default_true() -> bool {
    true
}
fn default_agent_command() -> Vec<String> {
    vec!["acp-agent".to_string()]
}
fn default_agent_name() -> String {
    "default".to_string()
}
fn default_permission_timeout_secs() -> u64 {
    300
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            data_dir: default_data_dir(),
            max_sessions: default_max_sessions(),
            observer_channel_capacity: default_observer_channel_capacity(),
            buffer_soft_timeout_ms: default_buffer_soft_timeout_ms(),
            buffer_hard_limit_bytes: default_buffer_hard_limit_bytes(),
            sweep_interval_secs: default_sweep_interval_secs(),
            queue_delay_secs: 0,
            queue_enabled: default_true(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
            name: default_agent_name(),
        }
    }
}

impl Default for PermissionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_permission_timeout_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            agent: AgentConfig::default(),
            permission: PermissionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise looks
    /// for `sessiond.toml` in the current directory, falling back to compiled
    /// defaults.
    #[must_use]
    pub fn load(path: Option<&str>) -> Self {
        let mut config: Config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("sessiond.toml").exists() {
            let content =
                std::fs::read_to_string("sessiond.toml").expect("Failed to read sessiond.toml");
            toml::from_str(&content).expect("Failed to parse sessiond.toml")
        } else {
            Config::default()
        };

        if let Ok(listen) = std::env::var("SESSIOND_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(data_dir) = std::env::var("SESSIOND_DATA_DIR") {
            config.server.data_dir = data_dir;
        }

        config
    }

    /// Sanity-check values that would otherwise fail confusingly at runtime.
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.server.max_sessions == 0 {
            errors.push("server.max_sessions must be at least 1".to_string());
        }
        if self.agent.command.is_empty() {
            errors.push("agent.command must not be empty".to_string());
        }
        if self.server.buffer_hard_limit_bytes == 0 {
            errors.push("server.buffer_hard_limit_bytes must be at least 1".to_string());
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate_clean() {
        let config = Config::default();
        assert!(config.validate().is_empty());
    }

    #[test]
    fn rejects_empty_agent_command() {
        let mut config = Config::default();
        config.agent.command.clear();
        assert_eq!(config.validate().len(), 1);
    }
}
