//! Transport trait definition.
//!
//! A transport owns a physical channel, turns incoming bytes into validated
//! [`Message`]s and writes outgoing messages back to the peer. All methods take
//! `&self`; implementations keep their mutable state behind locks or channels
//! so one instance can be shared through an `Arc<dyn Transport>` between the
//! receive loop and notification relays.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::protocol::Message;

/// Identifier assigned to one SSE connection.
pub type ConnectionId = String;

/// Something that happened on a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A validated message, tagged with the connection it arrived on.
    /// Stdio has a single implicit connection and always reports `None`.
    Message {
        message: Message,
        connection_id: Option<ConnectionId>,
    },
    /// A new SSE stream was opened.
    ConnectionOpened(ConnectionId),
    /// An SSE stream went away.
    ConnectionClosed(ConnectionId),
}

/// Lifecycle state of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    Disconnected,
    Connected,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportState::Disconnected => write!(f, "disconnected"),
            TransportState::Connected => write!(f, "connected"),
        }
    }
}

/// What `send` does once the transport has been stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClosedSendPolicy {
    /// Drop the message and return `Ok(())`
    #[default]
    Ignore,
    /// Return [`TransportError::Closed`]
    Error,
}

impl ClosedSendPolicy {
    pub(crate) fn on_closed(self) -> Result<(), TransportError> {
        match self {
            ClosedSendPolicy::Ignore => {
                tracing::debug!("Dropping outbound message on stopped transport");
                Ok(())
            }
            ClosedSendPolicy::Error => Err(TransportError::Closed),
        }
    }
}

/// Bidirectional message channel between the server and its peer(s).
///
/// # Lifecycle
///
/// 1. [`start`](Transport::start) acquires the channel (begins reading stdin,
///    binds the HTTP listener).
/// 2. [`recv`](Transport::recv) yields events until the transport is stopped
///    or its input ends, then returns `None`.
/// 3. [`stop`](Transport::stop) releases everything; calling it again is a
///    no-op.
///
/// Malformed input never surfaces through `recv`: implementations log and
/// discard it and keep serving.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name used in logs (`"stdio"`, `"sse"`).
    fn kind(&self) -> &'static str;

    /// Acquire the physical channel and begin producing events.
    async fn start(&self) -> Result<(), TransportError>;

    /// Next event, or `None` once the transport is finished.
    async fn recv(&self) -> Option<TransportEvent>;

    /// Deliver a message.
    ///
    /// With `connection` set, only that connection receives it; otherwise the
    /// message goes to every connected peer.
    async fn send(&self, message: &Message, connection: Option<&str>) -> Result<(), TransportError>;

    /// Release the channel. Idempotent.
    async fn stop(&self) -> Result<(), TransportError>;

    /// Current lifecycle state.
    fn state(&self) -> TransportState;

    fn is_connected(&self) -> bool {
        self.state() == TransportState::Connected
    }
}
