//! JSON-RPC 2.0 error object and error codes.
//!
//! # Standard JSON-RPC Error Codes
//!
//! - `-32700`: Parse error - the message could not be decoded
//! - `-32600`: Invalid Request - the envelope is not a valid request
//! - `-32601`: Method not found
//! - `-32602`: Invalid params
//! - `-32603`: Internal error
//!
//! # Server-Defined Codes
//!
//! - `-32003`: Resource not found
//! - `-32004`: Execution not found
//!
//! # Examples
//!
//! ```
//! use agent_mcp::protocol::JsonRpcError;
//!
//! let error = JsonRpcError::method_not_found("agents/launch");
//! assert_eq!(error.code, -32601);
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::sanitize::sanitize_message;

/// Standard JSON-RPC 2.0 error codes
pub mod codes {
    /// The message could not be decoded
    pub const PARSE_ERROR: i32 = -32700;

    /// The JSON sent is not a valid Request object
    pub const INVALID_REQUEST: i32 = -32600;

    /// The method does not exist / is not available
    pub const METHOD_NOT_FOUND: i32 = -32601;

    /// Invalid method parameter(s)
    pub const INVALID_PARAMS: i32 = -32602;

    /// Internal JSON-RPC error
    pub const INTERNAL_ERROR: i32 = -32603;
}

/// Server-defined error codes (reserved range -32000 to -32099)
pub mod server_codes {
    /// Requested resource URI is not served
    pub const RESOURCE_NOT_FOUND: i32 = -32003;

    /// Requested execution id is unknown
    pub const EXECUTION_NOT_FOUND: i32 = -32004;
}

/// JSON-RPC 2.0 error object.
///
/// Every constructor runs the message through [`sanitize_message`], so an
/// error built here never carries filesystem paths or stack frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcError {
    /// Error code indicating the error type
    pub code: i32,

    /// Short description of the error
    pub message: String,

    /// Additional structured information (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    /// Create a new error with a sanitized message.
    pub fn new(code: i32, message: impl AsRef<str>, data: Option<Value>) -> Self {
        Self {
            code,
            message: sanitize_message(message.as_ref()),
            data,
        }
    }

    /// Parse error (-32700).
    ///
    /// Never carries the offending input.
    pub fn parse_error() -> Self {
        Self::new(codes::PARSE_ERROR, "Parse error: malformed message", None)
    }

    /// Method not found (-32601)
    ///
    /// ```
    /// use agent_mcp::protocol::JsonRpcError;
    ///
    /// let error = JsonRpcError::method_not_found("tools/run");
    /// assert_eq!(error.message, "Method not found: tools/run");
    /// ```
    pub fn method_not_found(method: impl AsRef<str>) -> Self {
        Self::new(
            codes::METHOD_NOT_FOUND,
            format!("Method not found: {}", truncate(method.as_ref(), 128)),
            None,
        )
    }

    /// Invalid params (-32602)
    pub fn invalid_params(details: impl AsRef<str>) -> Self {
        Self::new(
            codes::INVALID_PARAMS,
            format!("Invalid params: {}", details.as_ref()),
            None,
        )
    }

    /// Internal error (-32603)
    pub fn internal_error(details: impl AsRef<str>) -> Self {
        Self::new(
            codes::INTERNAL_ERROR,
            format!("Internal error: {}", details.as_ref()),
            None,
        )
    }

    /// Resource not found (-32003)
    pub fn resource_not_found(uri: impl AsRef<str>) -> Self {
        Self::new(
            server_codes::RESOURCE_NOT_FOUND,
            format!("Resource not found: {}", truncate(uri.as_ref(), 256)),
            None,
        )
    }

    /// Execution not found (-32004)
    pub fn execution_not_found(id: impl AsRef<str>) -> Self {
        Self::new(
            server_codes::EXECUTION_NOT_FOUND,
            format!("Execution not found: {}", truncate(id.as_ref(), 128)),
            None,
        )
    }
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for JsonRpcError {}

/// Cap caller-supplied text echoed back inside error messages.
fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}
