//! Message codec: bytes to validated [`Message`] and back.
//!
//! Decoding runs in four stages, cheapest first:
//!
//! 1. size ceiling
//! 2. nesting-depth scan over the raw bytes (no allocation)
//! 3. parse into plain `serde_json::Value` data
//! 4. envelope shape validation ([`Message::from_value`])
//!
//! Keys such as `__proto__` are ordinary map entries in a `Value`, so hostile
//! key names have no effect beyond being carried as data.
//!
//! For stream transports, [`LineFramer`] splits incoming chunks into
//! newline-terminated frames and buffers partial lines between chunks.

use thiserror::Error;

use super::message::Message;

/// Default ceiling on a single encoded message.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;

/// Default ceiling on object/array nesting.
pub const DEFAULT_MAX_DEPTH: usize = 64;

/// Reason a payload was rejected.
///
/// Every variant displays as `malformed message`; the variant itself and
/// [`DecodeError::reason`] are for local diagnostics only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed message")]
    Oversized { size: usize, limit: usize },

    #[error("malformed message")]
    TooDeep { limit: usize },

    #[error("malformed message")]
    InvalidJson,

    #[error("malformed message")]
    UnsupportedVersion,

    #[error("malformed message")]
    InvalidShape(&'static str),
}

impl DecodeError {
    /// Short diagnostic suitable for debug logs.
    pub fn reason(&self) -> &'static str {
        match self {
            DecodeError::Oversized { .. } => "payload exceeds size ceiling",
            DecodeError::TooDeep { .. } => "payload exceeds nesting ceiling",
            DecodeError::InvalidJson => "payload is not valid JSON",
            DecodeError::UnsupportedVersion => "missing or unsupported protocol version",
            DecodeError::InvalidShape(why) => why,
        }
    }
}

/// Encoder/decoder with configurable ceilings.
#[derive(Debug, Clone, Copy)]
pub struct Codec {
    max_message_bytes: usize,
    max_depth: usize,
}

impl Default for Codec {
    fn default() -> Self {
        Self {
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl Codec {
    pub fn new(max_message_bytes: usize) -> Self {
        Self {
            max_message_bytes,
            ..Self::default()
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn max_message_bytes(&self) -> usize {
        self.max_message_bytes
    }

    /// Decode one JSON document.
    ///
    /// ```
    /// use agent_mcp::protocol::{Codec, Message};
    ///
    /// let codec = Codec::default();
    /// let msg = codec.decode(br#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#).unwrap();
    /// assert_eq!(msg, Message::request(1, "ping", None));
    ///
    /// let err = codec.decode(b"invalid json").unwrap_err();
    /// assert_eq!(err.to_string(), "malformed message");
    /// ```
    pub fn decode(&self, raw: &[u8]) -> Result<Message, DecodeError> {
        if raw.len() > self.max_message_bytes {
            return Err(DecodeError::Oversized {
                size: raw.len(),
                limit: self.max_message_bytes,
            });
        }

        let raw = raw.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(raw);
        let raw = raw.trim_ascii();
        if raw.is_empty() {
            return Err(DecodeError::InvalidJson);
        }

        check_depth(raw, self.max_depth)?;

        let value: serde_json::Value =
            serde_json::from_slice(raw).map_err(|_| DecodeError::InvalidJson)?;
        Message::from_value(value)
    }

    /// Encode one message as compact JSON, without a trailing newline.
    pub fn encode(&self, message: &Message) -> Vec<u8> {
        message.to_value().to_string().into_bytes()
    }

    /// Encode one message followed by `\n`.
    pub fn encode_line(&self, message: &Message) -> Vec<u8> {
        let mut bytes = self.encode(message);
        bytes.push(b'\n');
        bytes
    }
}

/// Decode with the default ceilings.
pub fn decode(raw: &[u8]) -> Result<Message, DecodeError> {
    Codec::default().decode(raw)
}

/// Encode with the default codec.
pub fn encode(message: &Message) -> Vec<u8> {
    Codec::default().encode(message)
}

/// Reject documents nested deeper than `limit` without parsing them.
fn check_depth(raw: &[u8], limit: usize) -> Result<(), DecodeError> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for &byte in raw {
        if in_string {
            match byte {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' | b'[' => {
                depth += 1;
                if depth > limit {
                    return Err(DecodeError::TooDeep { limit });
                }
            }
            b'}' | b']' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    Ok(())
}

/// One unit produced by [`LineFramer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A complete line, without its terminator
    Line(Vec<u8>),
    /// A line that exceeded the ceiling and was discarded
    Oversized,
}

/// Splits a byte stream into newline-delimited frames.
///
/// Partial lines are buffered until their terminator arrives. A line longer
/// than the ceiling is dropped as it streams in, so memory stays bounded by
/// the ceiling regardless of what the peer sends.
#[derive(Debug)]
pub struct LineFramer {
    buf: Vec<u8>,
    max_line_bytes: usize,
    discarding: bool,
}

impl LineFramer {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_line_bytes,
            discarding: false,
        }
    }

    /// Feed a chunk and collect every frame it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::new();
        let mut rest = chunk;

        while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
            let head = &rest[..pos];
            rest = &rest[pos + 1..];

            if self.discarding {
                self.discarding = false;
                frames.push(Frame::Oversized);
                continue;
            }
            if self.buf.len() + head.len() > self.max_line_bytes {
                self.buf.clear();
                frames.push(Frame::Oversized);
                continue;
            }
            self.buf.extend_from_slice(head);
            frames.push(Frame::Line(std::mem::take(&mut self.buf)));
        }

        if !rest.is_empty() && !self.discarding {
            if self.buf.len() + rest.len() > self.max_line_bytes {
                self.buf = Vec::new();
                self.discarding = true;
            } else {
                self.buf.extend_from_slice(rest);
            }
        }

        frames
    }

    /// Flush whatever remains at end of stream.
    pub fn finish(&mut self) -> Option<Frame> {
        if std::mem::take(&mut self.discarding) {
            return Some(Frame::Oversized);
        }
        if self.buf.is_empty() {
            None
        } else {
            Some(Frame::Line(std::mem::take(&mut self.buf)))
        }
    }

    /// Bytes currently held for an unterminated line.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}
