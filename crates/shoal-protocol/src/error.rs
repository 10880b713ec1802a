//! Protocol error types for RESP parsing.

use thiserror::Error;

/// Errors that can occur when parsing the RESP wire format.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The input buffer doesn't contain a complete frame yet.
    /// The caller should read more data and try again.
    #[error("incomplete frame: need more data")]
    Incomplete,

    /// The first byte of a frame didn't match any known RESP type prefix.
    #[error("invalid type prefix: {0:#04x}")]
    InvalidPrefix(u8),

    /// Failed to parse an integer value from the frame content.
    #[error("invalid integer encoding")]
    InvalidInteger,

    /// A bulk string or array declared an invalid length.
    #[error("invalid frame length: {0}")]
    InvalidFrameLength(i64),

    /// A bulk string exceeded the maximum allowed size.
    #[error("bulk string of {0} bytes exceeds the limit")]
    BulkTooLarge(usize),

    /// An array declared more elements than the parser accepts.
    #[error("array of {0} elements exceeds the limit")]
    TooManyElements(usize),

    /// Arrays nested beyond the maximum depth.
    #[error("nesting deeper than {0} levels")]
    NestingTooDeep(usize),

    /// A simple string or error reply contained invalid UTF-8.
    #[error("invalid utf-8 in {0} reply")]
    InvalidUtf8(&'static str),
}
