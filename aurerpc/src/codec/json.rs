//! Symmetric JSON framing: one compact JSON value per line.
//!
//! Serialized values never contain a raw newline (serde_json escapes them
//! inside strings), so the trailing newline delimits a value even when it is
//! a bare scalar that more input could otherwise extend.

use bytes::{BufMut, BytesMut};
use serde::{Serialize, de::DeserializeOwned};

use crate::error::Result;

pub(crate) fn try_decode<T: DeserializeOwned>(buf: &[u8]) -> Result<Option<(T, usize)>> {
    let Some(end) = buf.iter().position(|&b| b == b'\n') else {
        return Ok(None);
    };
    let value = serde_json::from_slice(&buf[..end])?;
    Ok(Some((value, end + 1)))
}

pub(crate) fn encode_into<T: Serialize>(value: &T, buf: &mut BytesMut) -> Result<()> {
    serde_json::to_writer(buf.writer(), value)?;
    buf.put_u8(b'\n');
    Ok(())
}

/// Streaming decode of one JSON value, without line framing.
///
/// Used for the handshake, where the value is always an object and therefore
/// self-terminating. Returns the value and its length in bytes, or `None`
/// while the buffer holds only a prefix.
pub(crate) fn try_decode_value<T: DeserializeOwned>(buf: &[u8]) -> Result<Option<(T, usize)>> {
    let mut stream = serde_json::Deserializer::from_slice(buf).into_iter::<T>();
    match stream.next() {
        Some(Ok(value)) => {
            let consumed = stream.byte_offset();
            Ok(Some((value, consumed)))
        }
        Some(Err(e)) if e.is_eof() => Ok(None),
        Some(Err(e)) => Err(e.into()),
        None => Ok(None),
    }
}
