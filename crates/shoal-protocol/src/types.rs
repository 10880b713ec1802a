//! RESP frame types.
//!
//! The [`Frame`] enum represents a single parsed RESP value. Bulk strings
//! use `Bytes` so reply payloads can be handed to callers without copying.

use bytes::Bytes;

/// A single RESP protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Simple string reply, e.g. `+OK\r\n`.
    Simple(String),

    /// Error reply, e.g. `-MOVED 1234 10.0.0.2:7002\r\n`.
    /// The message preserves the server's leading token.
    Error(String),

    /// 64-bit signed integer, e.g. `:42\r\n`.
    Integer(i64),

    /// Bulk (binary-safe) string, e.g. `$5\r\nhello\r\n`.
    Bulk(Bytes),

    /// Ordered array of frames, e.g. `*2\r\n+a\r\n+b\r\n`.
    Array(Vec<Frame>),

    /// Null value: `$-1\r\n` or `*-1\r\n` (RESP2), `_\r\n` (RESP3).
    Null,
}

impl Frame {
    /// Returns `true` if this frame is a null value.
    pub fn is_null(&self) -> bool {
        matches!(self, Frame::Null)
    }

    /// Returns the bulk payload, if this frame is a bulk string.
    pub fn as_bulk(&self) -> Option<&Bytes> {
        match self {
            Frame::Bulk(data) => Some(data),
            _ => None,
        }
    }

    /// Returns the error message, if this frame is an error reply.
    pub fn as_error(&self) -> Option<&str> {
        match self {
            Frame::Error(msg) => Some(msg),
            _ => None,
        }
    }

    /// Returns `true` if this frame is a `+OK` simple string.
    pub fn is_ok(&self) -> bool {
        matches!(self, Frame::Simple(s) if s == "OK")
    }
}
