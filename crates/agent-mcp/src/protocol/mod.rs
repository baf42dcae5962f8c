//! JSON-RPC 2.0 protocol layer.
//!
//! - [`message`]: the validated envelope model
//! - [`codec`]: byte-level decode/encode and line framing
//! - [`error`]: the JSON-RPC error object and codes
//!
//! # Examples
//!
//! ```
//! use agent_mcp::protocol::{decode, encode, Message};
//! use serde_json::json;
//!
//! let msg = Message::request(1, "tools/call", Some(json!({"name": "list_executions"})));
//! assert_eq!(decode(&encode(&msg)).unwrap(), msg);
//! ```

pub mod codec;
pub mod error;
pub mod message;

pub use codec::{decode, encode, Codec, DecodeError, Frame, LineFramer};
pub use error::{codes, server_codes, JsonRpcError};
pub use message::{Message, Notification, Request, RequestId, Response, ResponsePayload};
