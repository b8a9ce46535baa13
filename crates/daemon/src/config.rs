//! Configuration management for the runhub daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/runhub/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::manager::DEFAULT_MAX_SESSIONS;
use crate::session::queue::DEFAULT_QUEUE_CAPACITY;
use crate::session::{hub::DEFAULT_INPUT_CAPACITY, OverflowPolicy};
use crate::transport::DEFAULT_CHUNK_SIZE;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_sessions must be between 1 and 1000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("read_chunk_size must be between 1 and 16777216, got {0}")]
    InvalidChunkSize(usize),

    #[error("{name} must be between 1 and 65536, got {value}")]
    InvalidQueueCapacity { name: &'static str, value: usize },

    #[error("{name} is not a valid socket address: {value}")]
    InvalidListenAddress { name: &'static str, value: String },

    #[error("engine command not found: {0}")]
    CommandNotFound(String),

    #[error("docker binary not found: {0}")]
    DockerNotFound(String),

    #[error("container engine requires a non-empty image")]
    MissingImage,

    #[error("terminal size must be non-zero, got {cols}x{rows}")]
    InvalidTerminalSize { cols: u16, rows: u16 },

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Upper bound for queue capacities.
const MAX_QUEUE_CAPACITY: usize = 65536;

/// Upper bound for the process read size (16 MiB).
const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// Main configuration structure for the runhub daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// Listener configuration.
    pub network: NetworkConfig,

    /// Which process backs a session.
    pub engine: EngineConfig,

    /// Session hub tunables.
    pub session: SessionConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Control socket path. Defaults to `$XDG_RUNTIME_DIR/runhub.sock`.
    pub socket_path: Option<PathBuf>,
}

/// Optional network listeners. The Unix control socket is always served.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address for the TCP line protocol, e.g. `127.0.0.1:7070`.
    pub tcp_listen: Option<String>,

    /// Address for the WebSocket listener, e.g. `127.0.0.1:7071`.
    pub ws_listen: Option<String>,
}

/// Process engine selection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// A local command in a pseudo-terminal.
    #[default]
    Pty,
    /// A docker container.
    Container,
    /// An in-process echo loop, useful for trying out clients.
    Echo,
}

/// Process engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub kind: EngineKind,

    /// Command run by the PTY engine.
    pub command: String,

    /// Arguments for the PTY command, or for the container entrypoint.
    pub args: Vec<String>,

    /// Working directory for the PTY command.
    pub cwd: Option<String>,

    /// Extra environment for the PTY command.
    pub env: BTreeMap<String, String>,

    /// Image run by the container engine.
    pub image: String,

    /// Docker CLI used by the container engine.
    pub docker_bin: String,

    /// PTY width in columns.
    pub cols: u16,

    /// PTY height in rows.
    pub rows: u16,
}

/// Session hub configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,

    /// Bytes requested per process read.
    pub read_chunk_size: usize,

    /// Chunks buffered per subscriber before the overflow policy applies.
    pub output_queue_capacity: usize,

    /// Subscriber chunks buffered on their way to the process.
    pub input_queue_capacity: usize,

    /// What a full subscriber queue discards.
    pub overflow_policy: OverflowPolicy,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            socket_path: None,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kind: EngineKind::Pty,
            command: default_shell(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            image: "player-immuclient".to_string(),
            docker_bin: "docker".to_string(),
            cols: 80,
            rows: 24,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: DEFAULT_MAX_SESSIONS,
            read_chunk_size: DEFAULT_CHUNK_SIZE,
            output_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            input_queue_capacity: DEFAULT_INPUT_CAPACITY,
            overflow_policy: OverflowPolicy::DropOldest,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("runhub")
        .join("config.toml")
}

/// Returns the default shell for the current platform.
fn default_shell() -> String {
    if cfg!(windows) {
        "powershell.exe".to_string()
    } else {
        std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
    }
}

/// Whether `program` is an existing absolute path or resolvable on `PATH`.
fn program_exists(program: &str) -> bool {
    let path = Path::new(program);
    if path.is_absolute() {
        path.exists()
    } else {
        which::which(program).is_ok()
    }
}

fn check_capacity(name: &'static str, value: usize) -> Result<(), ConfigError> {
    if value == 0 || value > MAX_QUEUE_CAPACITY {
        return Err(ConfigError::InvalidQueueCapacity { name, value });
    }
    Ok(())
}

fn check_listen(name: &'static str, value: &Option<String>) -> Result<(), ConfigError> {
    if let Some(addr) = value {
        if addr.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::InvalidListenAddress {
                name,
                value: addr.clone(),
            });
        }
    }
    Ok(())
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - RUNHUB_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - RUNHUB_TCP_LISTEN: Override the TCP listen address
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("RUNHUB_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }

        if let Ok(addr) = std::env::var("RUNHUB_TCP_LISTEN") {
            if !addr.is_empty() {
                tracing::info!("Overriding tcp_listen from environment: {}", addr);
                self.network.tcp_listen = Some(addr);
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range
    /// or the configured engine program cannot be found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let session = &self.session;
        if session.max_sessions < 1 || session.max_sessions > 1000 {
            return Err(ConfigError::InvalidMaxSessions(session.max_sessions));
        }
        if session.read_chunk_size == 0 || session.read_chunk_size > MAX_CHUNK_SIZE {
            return Err(ConfigError::InvalidChunkSize(session.read_chunk_size));
        }
        check_capacity("output_queue_capacity", session.output_queue_capacity)?;
        check_capacity("input_queue_capacity", session.input_queue_capacity)?;

        check_listen("tcp_listen", &self.network.tcp_listen)?;
        check_listen("ws_listen", &self.network.ws_listen)?;

        let engine = &self.engine;
        match engine.kind {
            EngineKind::Pty => {
                if !program_exists(&engine.command) {
                    return Err(ConfigError::CommandNotFound(engine.command.clone()));
                }
                if engine.cols == 0 || engine.rows == 0 {
                    return Err(ConfigError::InvalidTerminalSize {
                        cols: engine.cols,
                        rows: engine.rows,
                    });
                }
            }
            EngineKind::Container => {
                if engine.image.trim().is_empty() {
                    return Err(ConfigError::MissingImage);
                }
                if !program_exists(&engine.docker_bin) {
                    return Err(ConfigError::DockerNotFound(engine.docker_bin.clone()));
                }
            }
            EngineKind::Echo => {}
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    fn echo_config() -> Config {
        let mut config = Config::default();
        config.engine.kind = EngineKind::Echo;
        config
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.daemon.log_level, "info");
        assert!(config.daemon.socket_path.is_none());
        assert!(config.network.tcp_listen.is_none());
        assert!(config.network.ws_listen.is_none());
        assert_eq!(config.engine.kind, EngineKind::Pty);
        assert_eq!(config.engine.docker_bin, "docker");
        assert_eq!((config.engine.cols, config.engine.rows), (80, 24));
        assert_eq!(config.session.max_sessions, 10);
        assert_eq!(config.session.read_chunk_size, 64 * 1024);
        assert_eq!(config.session.output_queue_capacity, 256);
        assert_eq!(config.session.input_queue_capacity, 64);
        assert_eq!(config.session.overflow_policy, OverflowPolicy::DropOldest);
    }

    #[test]
    fn test_default_engine_command() {
        let config = EngineConfig::default();
        assert!(!config.command.is_empty());
        assert!(!config.image.is_empty());
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[daemon]
log_level = "debug"

[session]
max_sessions = 5
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(config.session.max_sessions, 5);
        // Other values should be defaults
        assert_eq!(config.session.output_queue_capacity, 256);
        assert_eq!(config.engine, EngineConfig::default());
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[daemon]
log_level = "trace"
socket_path = "/tmp/runhub-test.sock"

[network]
tcp_listen = "127.0.0.1:7070"
ws_listen = "127.0.0.1:7071"

[engine]
kind = "container"
command = "/bin/bash"
args = ["--login"]
cwd = "/srv"
image = "player-immuclient"
docker_bin = "/usr/bin/docker"
cols = 120
rows = 40

[engine.env]
LANG = "C.UTF-8"

[session]
max_sessions = 20
read_chunk_size = 4096
output_queue_capacity = 32
input_queue_capacity = 8
overflow_policy = "drop-newest"
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.daemon.log_level, "trace");
        assert_eq!(
            config.daemon.socket_path,
            Some(PathBuf::from("/tmp/runhub-test.sock"))
        );
        assert_eq!(config.network.tcp_listen.as_deref(), Some("127.0.0.1:7070"));
        assert_eq!(config.network.ws_listen.as_deref(), Some("127.0.0.1:7071"));
        assert_eq!(config.engine.kind, EngineKind::Container);
        assert_eq!(config.engine.command, "/bin/bash");
        assert_eq!(config.engine.args, vec!["--login"]);
        assert_eq!(config.engine.cwd.as_deref(), Some("/srv"));
        assert_eq!(config.engine.env.get("LANG").map(String::as_str), Some("C.UTF-8"));
        assert_eq!(config.engine.docker_bin, "/usr/bin/docker");
        assert_eq!((config.engine.cols, config.engine.rows), (120, 40));
        assert_eq!(config.session.max_sessions, 20);
        assert_eq!(config.session.read_chunk_size, 4096);
        assert_eq!(config.session.output_queue_capacity, 32);
        assert_eq!(config.session.input_queue_capacity, 8);
        assert_eq!(config.session.overflow_policy, OverflowPolicy::DropNewest);
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let toml = r#"
[daemon
log_level = "debug"
"#;
        let result = Config::from_toml(toml);
        assert!(result.is_err());
        let err = result.unwrap_err().to_string();
        assert!(err.contains("Invalid TOML"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let toml = r#"
[session]
max_sessions = "not a number"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_from_toml_unknown_engine_kind() {
        let toml = r#"
[engine]
kind = "vm"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let toml = r#"
[daemon]
log_level = "warn"
unknown_field = "ignored"

[unknown_section]
foo = "bar"
"#;
        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.daemon.log_level, "warn");
    }

    #[test]
    fn test_to_toml() {
        let toml = Config::default().to_toml().unwrap();
        assert!(toml.contains("[daemon]"));
        assert!(toml.contains("[engine]"));
        assert!(toml.contains("[session]"));
        assert!(toml.contains("drop-oldest"));
    }

    #[test]
    fn test_roundtrip_custom() {
        let mut original = Config::default();
        original.daemon.log_level = "warn".to_string();
        original.network.tcp_listen = Some("0.0.0.0:9000".to_string());
        original.engine.kind = EngineKind::Container;
        original
            .engine
            .env
            .insert("FOO".to_string(), "bar".to_string());
        original.session.overflow_policy = OverflowPolicy::DropNewest;

        let toml = original.to_toml().unwrap();
        let loaded = Config::from_toml(&toml).unwrap();

        assert_eq!(original, loaded);
    }

    #[test]
    fn test_load_missing_file() {
        let config = Config::load("/nonexistent/path/config.toml").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.toml");

        let mut original = Config::default();
        original.daemon.log_level = "debug".to_string();
        original.session.max_sessions = 15;

        original.save(&config_path).unwrap();
        let loaded = Config::load(&config_path).unwrap();

        assert_eq!(original, loaded);
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(&config_path, "this is not valid toml [[[").unwrap();

        let result = Config::load(&config_path);
        assert!(result.is_err());
        let err = format!("{:#}", result.unwrap_err());
        assert!(err.contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with("runhub/config.toml"));
    }

    #[test]
    #[serial]
    fn test_env_override_log_level() {
        std::env::remove_var("RUNHUB_TCP_LISTEN");
        std::env::set_var("RUNHUB_LOG_LEVEL", "debug");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.daemon.log_level, "debug");

        std::env::remove_var("RUNHUB_LOG_LEVEL");
    }

    #[test]
    #[serial]
    fn test_env_override_tcp_listen() {
        std::env::remove_var("RUNHUB_LOG_LEVEL");
        std::env::set_var("RUNHUB_TCP_LISTEN", "127.0.0.1:7777");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.network.tcp_listen.as_deref(), Some("127.0.0.1:7777"));

        std::env::remove_var("RUNHUB_TCP_LISTEN");
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        std::env::set_var("RUNHUB_LOG_LEVEL", "");
        std::env::set_var("RUNHUB_TCP_LISTEN", "");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config, Config::default());

        std::env::remove_var("RUNHUB_LOG_LEVEL");
        std::env::remove_var("RUNHUB_TCP_LISTEN");
    }

    #[test]
    #[serial]
    fn test_env_override_unset_does_not_override() {
        std::env::remove_var("RUNHUB_LOG_LEVEL");
        std::env::remove_var("RUNHUB_TCP_LISTEN");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_validate_echo_config() {
        assert!(echo_config().validate().is_ok());
    }

    #[test]
    #[cfg(unix)]
    fn test_validate_pty_command() {
        let mut config = Config::default();
        config.engine.command = "/bin/sh".to_string();
        assert!(config.validate().is_ok());

        config.engine.command = "/nonexistent/shell".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::CommandNotFound("/nonexistent/shell".to_string()))
        );

        config.engine.command = "sh".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_max_sessions_bounds() {
        let mut config = echo_config();
        config.session.max_sessions = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxSessions(0)));

        config.session.max_sessions = 1001;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxSessions(1001)));

        config.session.max_sessions = 1;
        assert!(config.validate().is_ok());
        config.session.max_sessions = 1000;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_queue_capacities() {
        let mut config = echo_config();
        config.session.output_queue_capacity = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidQueueCapacity {
                name: "output_queue_capacity",
                value: 0
            })
        );

        let mut config = echo_config();
        config.session.input_queue_capacity = MAX_QUEUE_CAPACITY + 1;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidQueueCapacity {
                name: "input_queue_capacity",
                ..
            })
        ));
    }

    #[test]
    fn test_validate_chunk_size() {
        let mut config = echo_config();
        config.session.read_chunk_size = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidChunkSize(0)));
    }

    #[test]
    fn test_validate_listen_addresses() {
        let mut config = echo_config();
        config.network.tcp_listen = Some("127.0.0.1:7070".to_string());
        config.network.ws_listen = Some("[::1]:7071".to_string());
        assert!(config.validate().is_ok());

        config.network.ws_listen = Some("localhost".to_string());
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidListenAddress {
                name: "ws_listen",
                value: "localhost".to_string()
            })
        );
    }

    #[test]
    fn test_validate_container_engine() {
        let mut config = Config::default();
        config.engine.kind = EngineKind::Container;
        config.engine.image = "  ".to_string();
        assert_eq!(config.validate(), Err(ConfigError::MissingImage));

        config.engine.image = "player-immuclient".to_string();
        config.engine.docker_bin = "/nonexistent/docker".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::DockerNotFound("/nonexistent/docker".to_string()))
        );
    }

    #[test]
    #[cfg(unix)]
    fn test_validate_terminal_size() {
        let mut config = Config::default();
        config.engine.command = "/bin/sh".to_string();
        config.engine.cols = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidTerminalSize { cols: 0, .. })
        ));
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = echo_config();
        config.daemon.log_level = "TRACE".to_string();
        assert!(config.validate().is_ok());

        config.daemon.log_level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );
    }
}
