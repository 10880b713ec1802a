//! shoal-protocol: RESP wire codec for the shoal cluster client.
//!
//! Implements the client side of the RESP request-response protocol:
//! commands are serialized as arrays of bulk strings, replies are parsed
//! into [`Frame`] values. The parser is incremental — it operates on a
//! caller-owned buffer and reports [`None`] until a complete frame has
//! arrived, so the connection layer can keep reading without re-framing.
//!
//! Replies from classic cluster servers use RESP2, where null is encoded
//! as a negative-length bulk (`$-1`) or array (`*-1`). Both are parsed to
//! [`Frame::Null`], as is the RESP3 `_` form, so the codec works against
//! either protocol generation without a handshake.

mod error;
mod parse;
mod serialize;
mod types;

pub use error::ProtocolError;
pub use parse::parse_frame;
pub use serialize::write_command;
pub use types::Frame;
