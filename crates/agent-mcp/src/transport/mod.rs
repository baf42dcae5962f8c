//! Transport layer.
//!
//! - [`traits`]: the [`Transport`] contract shared by every channel
//! - [`stdio`]: newline-delimited JSON-RPC over byte streams
//! - [`sse`]: HTTP POST in, Server-Sent Events out
//! - [`factory`]: selection from configuration

pub mod factory;
pub mod sse;
pub mod stdio;
pub mod traits;

pub use factory::{create_transport, TransportKind};
pub use sse::{ConnectionLimitPolicy, SseOptions, SseTransport, CONNECTION_ID_HEADER};
pub use stdio::StdioTransport;
pub use traits::{ClosedSendPolicy, ConnectionId, Transport, TransportEvent, TransportState};
