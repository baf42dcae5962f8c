//! Error types for the server core.
//!
//! # Error Hierarchy
//!
//! ```text
//! McpError (top-level)
//! ├── Protocol(DecodeError)      malformed envelope, recovered at the boundary
//! ├── Routing(RoutingError)      unknown method / tool / resource
//! ├── Validation(ValidationError) missing or mistyped parameters
//! ├── Execution(ExecutionError)  tracker and task failures
//! ├── Transport(TransportError)  socket / stream I/O
//! └── Config(ConfigError)        fatal at startup
//! ```
//!
//! Anything that reaches a peer is converted into a [`JsonRpcError`], whose
//! constructors redact paths and stack frames.

use std::path::PathBuf;

use thiserror::Error;

use crate::execution::ExecutionStatus;
use crate::protocol::{DecodeError, JsonRpcError};

pub type Result<T> = std::result::Result<T, McpError>;

#[derive(Debug, Error)]
pub enum McpError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] DecodeError),

    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("Method not found: {0}")]
    UnknownMethod(String),

    #[error("Tool not found: {0}")]
    UnknownTool(String),

    #[error("Resource not found: {0}")]
    UnknownResource(String),

    #[error("Execution not found: {0}")]
    UnknownExecution(String),
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("missing params for {0}")]
    MissingParams(&'static str),

    #[error("{0}")]
    InvalidParams(String),

    #[error("agent name must match [A-Za-z0-9_-]{{1,64}}")]
    InvalidAgentName,
}

impl ValidationError {
    /// Wrap a serde failure without echoing the offending input.
    pub fn from_serde(err: &serde_json::Error) -> Self {
        let detail = err.to_string();
        // serde appends " at line N column M"; the position is noise for callers
        let detail = detail
            .split(" at line ")
            .next()
            .unwrap_or("invalid arguments")
            .to_string();
        ValidationError::InvalidParams(detail)
    }
}

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("execution not found: {0}")]
    NotFound(String),

    #[error("execution {id} is already {status}")]
    Terminal { id: String, status: ExecutionStatus },

    #[error("illegal transition for {id}: {from} -> {to}")]
    IllegalTransition {
        id: String,
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    #[error("transition of {id} to {to} requires {field}")]
    MissingTimestamp {
        id: String,
        to: ExecutionStatus,
        field: &'static str,
    },

    #[error("transition of {id} lost a race: expected {expected}, found {actual}")]
    Conflict {
        id: String,
        expected: ExecutionStatus,
        actual: ExecutionStatus,
    },

    #[error("task failed: {0}")]
    Task(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport closed")]
    Closed,

    #[error("Transport already started")]
    AlreadyStarted,

    #[error("Connection not found: {0}")]
    ConnectionNotFound(String),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

impl TransportError {
    /// True when the peer went away, which is not an application fault.
    pub fn is_disconnect(&self) -> bool {
        match self {
            TransportError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::UnexpectedEof
            ),
            TransportError::Closed => true,
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unknown transport type: {0}")]
    UnknownTransport(String),

    #[error("Unknown log level: {0}")]
    UnknownLogLevel(String),

    #[error("Project root is not a directory: {}", .0.display())]
    InvalidProjectRoot(PathBuf),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("Failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

impl From<RoutingError> for JsonRpcError {
    fn from(err: RoutingError) -> Self {
        match err {
            RoutingError::UnknownMethod(m) => JsonRpcError::method_not_found(m),
            RoutingError::UnknownTool(t) => {
                JsonRpcError::invalid_params(format!("Tool not found: {t}"))
            }
            RoutingError::UnknownResource(uri) => JsonRpcError::resource_not_found(uri),
            RoutingError::UnknownExecution(id) => JsonRpcError::execution_not_found(id),
        }
    }
}

impl From<ValidationError> for JsonRpcError {
    fn from(err: ValidationError) -> Self {
        JsonRpcError::invalid_params(err.to_string())
    }
}

impl From<DecodeError> for JsonRpcError {
    fn from(_: DecodeError) -> Self {
        JsonRpcError::parse_error()
    }
}

impl From<McpError> for JsonRpcError {
    fn from(err: McpError) -> Self {
        match err {
            McpError::Protocol(e) => e.into(),
            McpError::Routing(e) => e.into(),
            McpError::Validation(e) => e.into(),
            McpError::Execution(ExecutionError::NotFound(id)) => {
                JsonRpcError::execution_not_found(id)
            }
            McpError::Execution(e) => JsonRpcError::internal_error(e.to_string()),
            McpError::Transport(_) => JsonRpcError::internal_error("transport failure"),
            McpError::Config(_) => JsonRpcError::internal_error("server misconfigured"),
        }
    }
}
