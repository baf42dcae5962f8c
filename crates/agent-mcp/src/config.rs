//! Server configuration.
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! environment variables, then command-line flags (applied by the binary).
//! [`ServerConfig::validate`] runs last and rejects anything that would only
//! fail later, after sockets or streams were acquired.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::execution::tracker::DEFAULT_MAX_RETAINED;
use crate::transport::{ClosedSendPolicy, ConnectionLimitPolicy, SseOptions};

/// Prefix for every environment override.
pub const ENV_PREFIX: &str = "AGENT_MCP_";

/// Log levels accepted by `--log-level` and `log.level`.
pub const LOG_LEVELS: [&str; 4] = ["debug", "info", "warn", "error"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub name: String,
    pub version: String,
    pub project_root: PathBuf,
    pub log: LogConfig,
    pub transport: TransportConfig,
    pub execution: ExecutionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            project_root: PathBuf::from("."),
            log: LogConfig::default(),
            transport: TransportConfig::default(),
            execution: ExecutionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    /// When set, logs are appended to this file instead of stderr
    pub file: Option<PathBuf>,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            json: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// `stdio`, `sse` or `http` (alias of `sse`)
    #[serde(rename = "type")]
    pub kind: String,
    pub host: String,
    pub port: u16,
    pub max_message_bytes: usize,
    pub closed_send: ClosedSendPolicy,
    pub sse: SseConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: "stdio".to_string(),
            host: "127.0.0.1".to_string(),
            port: 3000,
            max_message_bytes: crate::protocol::codec::DEFAULT_MAX_MESSAGE_BYTES,
            closed_send: ClosedSendPolicy::Ignore,
            sse: SseConfig::default(),
        }
    }
}

impl TransportConfig {
    pub fn stdio() -> Self {
        Self::default()
    }

    pub fn sse(host: impl Into<String>, port: u16) -> Self {
        Self {
            kind: "sse".to_string(),
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Runtime options for the SSE transport.
    pub fn sse_options(&self) -> SseOptions {
        let sse = &self.sse;
        SseOptions {
            host: self.host.clone(),
            port: self.port,
            sse_path: sse.sse_path.clone(),
            rpc_path: sse.rpc_path.clone(),
            max_message_bytes: self.max_message_bytes,
            max_connections: sse.max_connections,
            limit_policy: sse.limit_policy,
            connection_buffer: sse.connection_buffer,
            event_buffer: sse.event_buffer,
            keep_alive: Duration::from_secs(sse.keep_alive_secs),
            idle_timeout: (sse.idle_timeout_secs > 0)
                .then(|| Duration::from_secs(sse.idle_timeout_secs)),
            reap_interval: Duration::from_secs(sse.reap_interval_secs),
            cors_origins: sse.cors_origins.clone(),
            closed_send: self.closed_send,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SseConfig {
    pub sse_path: String,
    pub rpc_path: String,
    pub max_connections: usize,
    pub limit_policy: ConnectionLimitPolicy,
    /// Outbound messages queued per connection before it is dropped
    pub connection_buffer: usize,
    /// Inbound messages queued across all connections
    pub event_buffer: usize,
    pub keep_alive_secs: u64,
    /// 0 disables idle reaping
    pub idle_timeout_secs: u64,
    pub reap_interval_secs: u64,
    pub cors_origins: Vec<String>,
}

impl Default for SseConfig {
    fn default() -> Self {
        let defaults = SseOptions::default();
        Self {
            sse_path: defaults.sse_path,
            rpc_path: defaults.rpc_path,
            max_connections: defaults.max_connections,
            limit_policy: defaults.limit_policy,
            connection_buffer: defaults.connection_buffer,
            event_buffer: defaults.event_buffer,
            keep_alive_secs: defaults.keep_alive.as_secs(),
            idle_timeout_secs: defaults.idle_timeout.map_or(0, |d| d.as_secs()),
            reap_interval_secs: defaults.reap_interval.as_secs(),
            cors_origins: defaults.cors_origins,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Capacity of the lifecycle event channel
    pub event_buffer: usize,
    /// Finished executions kept before the oldest are evicted
    pub max_retained: usize,
    pub runner: RunnerConfig,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            event_buffer: 1024,
            max_retained: DEFAULT_MAX_RETAINED,
            runner: RunnerConfig::default(),
        }
    }
}

/// External command that carries out agent tasks.
///
/// `{agent}` and `{task}` in `args` are substituted per execution. Without a
/// command, launched executions fail with a descriptive error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub command: Option<String>,
    pub args: Vec<String>,
    pub max_output_bytes: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: vec!["{agent}".to_string(), "{task}".to_string()],
            max_output_bytes: 1024 * 1024,
        }
    }
}

impl ServerConfig {
    /// Defaults, then `path` if given, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse a TOML file. Missing sections fall back to defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: ServerConfig = toml::from_str(&contents)?;
        tracing::debug!("Loaded config from {:?}", path);
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::InvalidValue {
            field: "config",
            reason: e.to_string(),
        })
    }

    /// Apply `AGENT_MCP_*` variables from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from any key lookup. Unparsable numbers are ignored
    /// with a warning.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |suffix: &str| lookup(&format!("{ENV_PREFIX}{suffix}"));

        if let Some(kind) = get("TRANSPORT") {
            self.transport.kind = kind;
        }
        if let Some(host) = get("HOST") {
            self.transport.host = host;
        }
        if let Some(port) = get("PORT") {
            match port.parse() {
                Ok(port) => self.transport.port = port,
                Err(_) => tracing::warn!("Ignoring invalid {ENV_PREFIX}PORT: {}", port),
            }
        }
        if let Some(root) = get("PROJECT_ROOT") {
            self.project_root = PathBuf::from(root);
        }
        if let Some(level) = get("LOG_LEVEL") {
            self.log.level = level;
        }
        if let Some(file) = get("LOG_FILE") {
            self.log.file = Some(PathBuf::from(file));
        }
        if let Some(max) = get("MAX_CONNECTIONS") {
            match max.parse() {
                Ok(max) => self.transport.sse.max_connections = max,
                Err(_) => tracing::warn!("Ignoring invalid {ENV_PREFIX}MAX_CONNECTIONS: {}", max),
            }
        }
        if let Some(command) = get("RUNNER_COMMAND") {
            self.execution.runner.command = Some(command);
        }
    }

    /// Reject configurations that cannot work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        crate::transport::TransportKind::parse(&self.transport.kind)?;

        if !LOG_LEVELS.contains(&self.log.level.to_ascii_lowercase().as_str()) {
            return Err(ConfigError::UnknownLogLevel(self.log.level.clone()));
        }
        if !self.project_root.is_dir() {
            return Err(ConfigError::InvalidProjectRoot(self.project_root.clone()));
        }

        let positive = [
            ("transport.max_message_bytes", self.transport.max_message_bytes),
            ("transport.sse.max_connections", self.transport.sse.max_connections),
            ("transport.sse.connection_buffer", self.transport.sse.connection_buffer),
            ("transport.sse.event_buffer", self.transport.sse.event_buffer),
            ("execution.event_buffer", self.execution.event_buffer),
            ("execution.max_retained", self.execution.max_retained),
            ("execution.runner.max_output_bytes", self.execution.runner.max_output_bytes),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        for (field, secs) in [
            ("transport.sse.keep_alive_secs", self.transport.sse.keep_alive_secs),
            ("transport.sse.reap_interval_secs", self.transport.sse.reap_interval_secs),
        ] {
            if secs == 0 {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        for (field, path) in [
            ("transport.sse.sse_path", &self.transport.sse.sse_path),
            ("transport.sse.rpc_path", &self.transport.sse.rpc_path),
        ] {
            if !path.starts_with('/') || path == "/health" {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: format!("'{path}' must start with '/' and not shadow /health"),
                });
            }
        }
        if self.transport.sse.sse_path == self.transport.sse.rpc_path {
            return Err(ConfigError::InvalidValue {
                field: "transport.sse.rpc_path",
                reason: "must differ from sse_path".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn valid_config(dir: &TempDir) -> ServerConfig {
        ServerConfig {
            project_root: dir.path().to_path_buf(),
            ..ServerConfig::default()
        }
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.transport.kind, "stdio");
        assert_eq!(config.log.level, "info");
        assert_eq!(config.transport.sse.sse_path, "/mcp/sse");
        assert_eq!(config.transport.sse.rpc_path, "/mcp/rpc");
        assert!(config.execution.runner.command.is_none());
        assert_eq!(config.execution.max_retained, DEFAULT_MAX_RETAINED);
    }

    #[test]
    fn test_from_file_partial_sections() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("agent-mcp.toml");
        std::fs::write(
            &path,
            r#"
[transport]
type = "sse"
port = 8080

[transport.sse]
max_connections = 4
limit_policy = "evict_oldest"

[execution]
max_retained = 25

[execution.runner]
command = "claude"
"#,
        )
        .unwrap();

        let config = ServerConfig::from_file(&path).unwrap();
        assert_eq!(config.transport.kind, "sse");
        assert_eq!(config.transport.port, 8080);
        assert_eq!(config.transport.host, "127.0.0.1");
        assert_eq!(config.transport.sse.max_connections, 4);
        assert_eq!(config.transport.sse.limit_policy, ConnectionLimitPolicy::EvictOldest);
        assert_eq!(config.execution.runner.command.as_deref(), Some("claude"));
        assert_eq!(config.execution.runner.args, vec!["{agent}", "{task}"]);
        assert_eq!(config.execution.max_retained, 25);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let result = ServerConfig::from_file(&dir.path().join("absent.toml"));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "invalid toml {{{}").unwrap();
        assert!(matches!(ServerConfig::from_file(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_toml_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("roundtrip.toml");
        let mut config = valid_config(&dir);
        config.transport.sse.cors_origins = vec!["http://localhost:5173".to_string()];
        std::fs::write(&path, config.to_toml().unwrap()).unwrap();

        let loaded = ServerConfig::from_file(&path).unwrap();
        assert_eq!(loaded.transport.sse.cors_origins, config.transport.sse.cors_origins);
        assert_eq!(loaded.project_root, config.project_root);
    }

    #[test]
    fn test_overrides_from_lookup() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("AGENT_MCP_TRANSPORT", "http"),
            ("AGENT_MCP_PORT", "9090"),
            ("AGENT_MCP_LOG_LEVEL", "debug"),
            ("AGENT_MCP_MAX_CONNECTIONS", "not-a-number"),
        ]);
        let mut config = ServerConfig::default();
        config.apply_overrides_from(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.transport.kind, "http");
        assert_eq!(config.transport.port, 9090);
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.transport.sse.max_connections, 256);
    }

    #[test]
    fn test_validate_accepts_defaults() {
        let dir = TempDir::new().unwrap();
        assert!(valid_config(&dir).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_unknown_transport() {
        let dir = TempDir::new().unwrap();
        let mut config = valid_config(&dir);
        config.transport.kind = "carrier-pigeon".to_string();
        let err = config.validate().unwrap_err();
        assert_eq!(err.to_string(), "Unknown transport type: carrier-pigeon");
    }

    #[test]
    fn test_validate_rejects_unknown_log_level() {
        let dir = TempDir::new().unwrap();
        let mut config = valid_config(&dir);
        config.log.level = "verbose".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::UnknownLogLevel(_))));
    }

    #[test]
    fn test_validate_rejects_missing_project_root() {
        let dir = TempDir::new().unwrap();
        let mut config = valid_config(&dir);
        config.project_root = dir.path().join("does-not-exist");
        assert!(matches!(config.validate(), Err(ConfigError::InvalidProjectRoot(_))));
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let dir = TempDir::new().unwrap();
        let mut config = valid_config(&dir);
        config.transport.sse.max_connections = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field: "transport.sse.max_connections", .. })
        ));

        let mut config = valid_config(&dir);
        config.transport.sse.keep_alive_secs = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field: "transport.sse.keep_alive_secs", .. })
        ));
    }

    #[test]
    fn test_validate_rejects_clashing_paths() {
        let dir = TempDir::new().unwrap();
        let mut config = valid_config(&dir);
        config.transport.sse.rpc_path = "/mcp/sse".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sse_options_mapping() {
        let mut transport = TransportConfig::sse("0.0.0.0", 4000);
        transport.sse.idle_timeout_secs = 0;
        let options = transport.sse_options();
        assert_eq!(options.host, "0.0.0.0");
        assert_eq!(options.port, 4000);
        assert!(options.idle_timeout.is_none());
        assert_eq!(options.keep_alive, Duration::from_secs(15));
    }
}
