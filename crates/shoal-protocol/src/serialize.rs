//! Direct-to-buffer RESP serialization.
//!
//! Writes frames into a `BytesMut` with no intermediate allocations.
//! Integer-to-string conversion uses `itoa` for stack-based formatting.
//!
//! The client hot path is [`write_command`]: every request goes out as an
//! array of bulk strings, so the token list is serialized in one pass
//! without building a `Frame` first.

use bytes::{BufMut, Bytes, BytesMut};

use crate::types::Frame;

/// Serializes a command — a verb followed by its arguments — as a RESP
/// array of bulk strings, the client → server wire form.
pub fn write_command(tokens: &[Bytes], dst: &mut BytesMut) {
    dst.put_u8(b'*');
    write_i64(tokens.len() as i64, dst);
    dst.put_slice(b"\r\n");
    for token in tokens {
        dst.put_u8(b'$');
        write_i64(token.len() as i64, dst);
        dst.put_slice(b"\r\n");
        dst.put_slice(token);
        dst.put_slice(b"\r\n");
    }
}

impl Frame {
    /// Serializes this frame into the provided buffer.
    ///
    /// Null is written in its RESP2 form (`$-1\r\n`) for compatibility
    /// with classic cluster servers.
    pub fn serialize(&self, dst: &mut BytesMut) {
        match self {
            Frame::Simple(s) => {
                dst.put_u8(b'+');
                dst.put_slice(s.as_bytes());
                dst.put_slice(b"\r\n");
            }
            Frame::Error(msg) => {
                dst.put_u8(b'-');
                dst.put_slice(msg.as_bytes());
                dst.put_slice(b"\r\n");
            }
            Frame::Integer(n) => {
                dst.put_u8(b':');
                write_i64(*n, dst);
                dst.put_slice(b"\r\n");
            }
            Frame::Bulk(data) => {
                dst.put_u8(b'$');
                write_i64(data.len() as i64, dst);
                dst.put_slice(b"\r\n");
                dst.put_slice(data);
                dst.put_slice(b"\r\n");
            }
            Frame::Array(items) => {
                dst.put_u8(b'*');
                write_i64(items.len() as i64, dst);
                dst.put_slice(b"\r\n");
                for item in items {
                    item.serialize(dst);
                }
            }
            Frame::Null => {
                dst.put_slice(b"$-1\r\n");
            }
        }
    }
}

/// Writes an i64 as decimal ASCII directly into the buffer.
fn write_i64(val: i64, dst: &mut BytesMut) {
    let mut buf = itoa::Buffer::new();
    dst.put_slice(buf.format(val).as_bytes());
}
