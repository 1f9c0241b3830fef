//! The self-describing binary codec, backed by MessagePack.

use std::io::Cursor;

use bytes::{BufMut, BytesMut};
use serde::{Serialize, de::DeserializeOwned};

use crate::error::Result;

pub(crate) fn try_decode<T: DeserializeOwned>(buf: &[u8]) -> Result<Option<(T, usize)>> {
    let mut cursor = Cursor::new(buf);
    match rmp_serde::decode::from_read(&mut cursor) {
        Ok(value) => Ok(Some((value, cursor.position() as usize))),
        Err(e) if is_incomplete(&e) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn is_incomplete(err: &rmp_serde::decode::Error) -> bool {
    use rmp_serde::decode::Error;
    match err {
        Error::InvalidMarkerRead(e) | Error::InvalidDataRead(e) => {
            e.kind() == std::io::ErrorKind::UnexpectedEof
        }
        _ => false,
    }
}

pub(crate) fn encode_into<T: Serialize>(value: &T, buf: &mut BytesMut) -> Result<()> {
    let mut writer = buf.writer();
    rmp_serde::encode::write(&mut writer, value)?;
    Ok(())
}
