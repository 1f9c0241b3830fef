//! Message framing.
//!
//! Every message after the handshake is a header/body pair encoded with the
//! codec negotiated in the connection option. Both codecs are self-framing:
//! there is no length prefix, the reader accumulates bytes and decodes one
//! value at a time, treating a truncated value as "wait for more input".

use bytes::{Buf, Bytes, BytesMut};
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};

use crate::error::{Error, ErrorKind, Result};
use crate::socket::RawStream;

mod binary;
pub(crate) mod json;

/// Per-message envelope.
///
/// `error` is empty on requests and successful responses; a non-empty value
/// carries a server-side error message. `seq` is chosen by the client and
/// pairs a response with its request; zero is reserved as invalid.
#[derive(Deserialize, Serialize, Debug, Default, PartialEq, Eq, Clone)]
pub struct Header {
    pub service_method: String,
    pub seq: u64,
    pub error: String,
}

/// Body codec negotiated at connection open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecKind {
    /// Self-describing binary encoding, the default.
    Binary,
    /// Symmetric JSON framing.
    Json,
}

impl CodecKind {
    #[must_use]
    pub fn from_name(name: &str) -> Option<CodecKind> {
        match name {
            "application/gob" => Some(CodecKind::Binary),
            "application/json" => Some(CodecKind::Json),
            _ => None,
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            CodecKind::Binary => "application/gob",
            CodecKind::Json => "application/json",
        }
    }

    /// Decodes one value from the front of `buf`. Returns the value and the
    /// number of bytes it occupied, or `None` if `buf` holds only a prefix
    /// of a value.
    pub(crate) fn try_decode<T: DeserializeOwned>(self, buf: &[u8]) -> Result<Option<(T, usize)>> {
        match self {
            CodecKind::Binary => binary::try_decode(buf),
            CodecKind::Json => json::try_decode(buf),
        }
    }

    pub(crate) fn encode_into<T: Serialize>(self, value: &T, buf: &mut BytesMut) -> Result<()> {
        match self {
            CodecKind::Binary => binary::encode_into(value, buf),
            CodecKind::Json => json::encode_into(value, buf),
        }
    }

    pub(crate) fn encode<T: Serialize>(self, value: &T) -> Result<Payload> {
        let mut buf = BytesMut::new();
        self.encode_into(value, &mut buf)?;
        Ok(Payload {
            kind: self,
            bytes: buf.freeze(),
        })
    }
}

/// One raw body value, extracted from the stream but not yet decoded.
///
/// Requests carry the call argument, responses the reply. Dropping a payload
/// discards the body, which is how responses to cancelled calls are consumed.
#[derive(Debug, Clone)]
pub struct Payload {
    kind: CodecKind,
    bytes: Bytes,
}

impl Payload {
    #[must_use]
    pub fn kind(&self) -> CodecKind {
        self.kind
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// # Errors
    ///
    /// Fails if the payload does not decode as a `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        match self.kind {
            CodecKind::Binary => Ok(rmp_serde::from_slice(&self.bytes)?),
            CodecKind::Json => Ok(serde_json::from_slice(&self.bytes)?),
        }
    }
}

/// Reading half of a codec. Owned linearly by one task per connection.
pub(crate) struct CodecReader {
    kind: CodecKind,
    stream: ReadHalf<RawStream>,
    buffer: BytesMut,
}

impl CodecReader {
    pub(crate) fn new(kind: CodecKind, stream: ReadHalf<RawStream>, buffer: BytesMut) -> Self {
        Self {
            kind,
            stream,
            buffer,
        }
    }

    pub(crate) async fn read_header(&mut self) -> Result<Header> {
        self.decode_next().await
    }

    /// Extracts the next body as raw bytes without interpreting it.
    pub(crate) async fn read_payload(&mut self) -> Result<Payload> {
        loop {
            if let Some((IgnoredAny, consumed)) = self.kind.try_decode(&self.buffer)? {
                let bytes = self.buffer.split_to(consumed).freeze();
                return Ok(Payload {
                    kind: self.kind,
                    bytes,
                });
            }
            self.fill().await?;
        }
    }

    async fn decode_next<T: DeserializeOwned>(&mut self) -> Result<T> {
        loop {
            if let Some((value, consumed)) = self.kind.try_decode(&self.buffer)? {
                self.buffer.advance(consumed);
                return Ok(value);
            }
            self.fill().await?;
        }
    }

    async fn fill(&mut self) -> Result<()> {
        let n = self
            .stream
            .read_buf(&mut self.buffer)
            .await
            .map_err(|e| Error::new(ErrorKind::RecvMsgFailed, e.to_string()))?;
        if n == 0 {
            return Err(Error::kind(ErrorKind::Eof));
        }
        Ok(())
    }
}

/// Writing half of a codec, shared under the connection's send mutex.
///
/// A header/body pair is encoded into the internal buffer first and hits the
/// wire in one write, so concurrent writers can never interleave messages.
pub(crate) struct CodecWriter {
    kind: CodecKind,
    stream: WriteHalf<RawStream>,
    buffer: BytesMut,
}

impl CodecWriter {
    pub(crate) fn new(kind: CodecKind, stream: WriteHalf<RawStream>) -> Self {
        Self {
            kind,
            stream,
            buffer: BytesMut::with_capacity(512),
        }
    }

    pub(crate) async fn write<T: Serialize>(&mut self, header: &Header, body: &T) -> Result<()> {
        self.buffer.clear();
        self.kind.encode_into(header, &mut self.buffer)?;
        self.kind.encode_into(body, &mut self.buffer)?;
        self.flush().await
    }

    pub(crate) async fn write_payload(&mut self, header: &Header, body: &Payload) -> Result<()> {
        self.buffer.clear();
        self.kind.encode_into(header, &mut self.buffer)?;
        self.buffer.extend_from_slice(&body.bytes);
        self.flush().await
    }

    async fn flush(&mut self) -> Result<()> {
        self.stream
            .write_all(&self.buffer)
            .await
            .map_err(|e| Error::new(ErrorKind::SendMsgFailed, e.to_string()))?;
        self.stream
            .flush()
            .await
            .map_err(|e| Error::new(ErrorKind::SendMsgFailed, e.to_string()))
    }

    pub(crate) async fn shutdown(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}
