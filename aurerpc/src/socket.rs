use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use serde::{Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;

use crate::codec::{CodecKind, CodecReader, CodecWriter, json};
use crate::error::{Error, ErrorKind, Result};

/// A raw stream transport for one RPC connection.
#[derive(Debug)]
pub enum RawStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl From<TcpStream> for RawStream {
    fn from(stream: TcpStream) -> Self {
        RawStream::Tcp(stream)
    }
}

#[cfg(unix)]
impl From<UnixStream> for RawStream {
    fn from(stream: UnixStream) -> Self {
        RawStream::Unix(stream)
    }
}

impl AsyncRead for RawStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            RawStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(unix)]
            RawStream::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for RawStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            RawStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(unix)]
            RawStream::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            RawStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(unix)]
            RawStream::Unix(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            RawStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(unix)]
            RawStream::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// A connection before the codec takes over: the option exchange and the
/// HTTP-CONNECT upgrade run through this.
///
/// Reads accumulate in a buffer, and whatever arrives beyond the handshake
/// is carried over into the codec reader, so a client that sends its option
/// and first request back-to-back loses nothing.
pub(crate) struct Conn {
    stream: RawStream,
    buffer: BytesMut,
}

impl Conn {
    pub(crate) fn new(stream: RawStream) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(512),
        }
    }

    /// Reads one JSON value, waiting for more input while it is incomplete.
    pub(crate) async fn read_json<T: DeserializeOwned>(&mut self) -> Result<T> {
        loop {
            if let Some((value, consumed)) = json::try_decode_value(&self.buffer)? {
                self.buffer.advance(consumed);
                return Ok(value);
            }
            self.fill().await?;
        }
    }

    pub(crate) async fn write_json<T: Serialize>(&mut self, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.write_all(&bytes).await
    }

    /// Reads one line, stripping the trailing newline and carriage return.
    pub(crate) async fn read_line(&mut self) -> Result<String> {
        loop {
            if let Some(end) = self.buffer.iter().position(|&b| b == b'\n') {
                let line = self.buffer.split_to(end + 1);
                let text = String::from_utf8_lossy(&line);
                return Ok(text.trim_end_matches(['\r', '\n']).to_string());
            }
            self.fill().await?;
        }
    }

    pub(crate) async fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream
            .write_all(bytes)
            .await
            .map_err(|e| Error::new(ErrorKind::SendMsgFailed, e.to_string()))?;
        self.stream
            .flush()
            .await
            .map_err(|e| Error::new(ErrorKind::SendMsgFailed, e.to_string()))
    }

    /// Splits into codec halves; buffered bytes move into the reader.
    pub(crate) fn into_codec(self, kind: CodecKind) -> (CodecReader, CodecWriter) {
        let (read_half, write_half) = tokio::io::split(self.stream);
        (
            CodecReader::new(kind, read_half, self.buffer),
            CodecWriter::new(kind, write_half),
        )
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
