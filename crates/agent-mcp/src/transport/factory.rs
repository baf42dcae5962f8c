//! Transport selection from configuration.

use std::sync::Arc;

use crate::config::TransportConfig;
use crate::error::ConfigError;
use crate::protocol::Codec;

use super::sse::SseTransport;
use super::stdio::StdioTransport;
use super::traits::Transport;

/// Transport variants the server can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Stdio,
    Sse,
}

impl TransportKind {
    /// Parse a configured type name. `http` is accepted as an alias of `sse`.
    pub fn parse(kind: &str) -> Result<Self, ConfigError> {
        match kind.trim().to_ascii_lowercase().as_str() {
            "stdio" => Ok(TransportKind::Stdio),
            "sse" | "http" => Ok(TransportKind::Sse),
            _ => Err(ConfigError::UnknownTransport(kind.to_string())),
        }
    }
}

/// Build the transport described by `config`; stdio when `config` is `None`.
///
/// Nothing is bound or read here: an unknown type fails before any socket or
/// stream is touched, and the returned transport acquires its channel in
/// [`Transport::start`].
///
/// ```
/// use agent_mcp::config::TransportConfig;
/// use agent_mcp::transport::create_transport;
///
/// let transport = create_transport(None).unwrap();
/// assert_eq!(transport.kind(), "stdio");
///
/// let mut config = TransportConfig::default();
/// config.kind = "websocket".to_string();
/// let err = create_transport(Some(&config)).err().unwrap();
/// assert_eq!(err.to_string(), "Unknown transport type: websocket");
/// ```
pub fn create_transport(config: Option<&TransportConfig>) -> Result<Arc<dyn Transport>, ConfigError> {
    let Some(config) = config else {
        return Ok(Arc::new(StdioTransport::new()));
    };

    match TransportKind::parse(&config.kind)? {
        TransportKind::Stdio => Ok(Arc::new(
            StdioTransport::new()
                .with_codec(Codec::new(config.max_message_bytes))
                .with_closed_send(config.closed_send),
        )),
        TransportKind::Sse => Ok(Arc::new(SseTransport::new(config.sse_options()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportState;

    #[test]
    fn test_parse_kinds() {
        assert_eq!(TransportKind::parse("stdio").unwrap(), TransportKind::Stdio);
        assert_eq!(TransportKind::parse("sse").unwrap(), TransportKind::Sse);
        assert_eq!(TransportKind::parse("HTTP").unwrap(), TransportKind::Sse);
        assert!(TransportKind::parse("").is_err());
    }

    #[tokio::test]
    async fn test_default_is_stdio() {
        let transport = create_transport(None).unwrap();
        assert_eq!(transport.kind(), "stdio");
        assert_eq!(transport.state(), TransportState::Disconnected);

        let transport = create_transport(Some(&TransportConfig::stdio())).unwrap();
        assert_eq!(transport.kind(), "stdio");
    }

    #[tokio::test]
    async fn test_sse_is_built_unbound() {
        let config = TransportConfig::sse("127.0.0.1", 0);
        let transport = create_transport(Some(&config)).unwrap();
        assert_eq!(transport.kind(), "sse");
        assert_eq!(transport.state(), TransportState::Disconnected);
    }

    #[test]
    fn test_unknown_type_fails_fast() {
        let mut config = TransportConfig::default();
        config.kind = "grpc".to_string();
        let err = create_transport(Some(&config)).err().unwrap();
        assert!(matches!(err, ConfigError::UnknownTransport(ref t) if t == "grpc"));
        assert_eq!(err.to_string(), "Unknown transport type: grpc");
    }
}
