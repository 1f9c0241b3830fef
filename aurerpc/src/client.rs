use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use foldhash::fast::RandomState;
use serde::{Serialize, de::DeserializeOwned};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::sync::{Mutex, oneshot};
use tokio_util::sync::CancellationToken;

use crate::codec::{CodecKind, CodecReader, CodecWriter, Header, Payload};
use crate::context::Context;
use crate::error::{Error, ErrorKind, Result};
use crate::option::ConnOption;
use crate::server::{CONNECTED, DEFAULT_RPC_PATH};
use crate::socket::Conn;

/// One in-flight invocation started with [`Client::go`].
///
/// Completion is a per-call oneshot: waiting on it never blocks the receive
/// loop, and dropping the handle discards the eventual response.
pub struct Call {
    seq: u64,
    service_method: String,
    rx: oneshot::Receiver<Result<Payload>>,
}

impl Call {
    /// Sequence number pairing this call with its response. Zero means the
    /// call was never registered (the client was closing or shut down).
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    #[must_use]
    pub fn service_method(&self) -> &str {
        &self.service_method
    }

    /// Waits for the response and decodes the reply.
    ///
    /// # Errors
    ///
    /// Yields the server-side error, the connection's terminating error, or
    /// a decode failure.
    pub async fn done<Rsp: DeserializeOwned>(self) -> Result<Rsp> {
        match self.rx.await {
            Ok(Ok(payload)) => payload.decode(),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::kind(ErrorKind::Shutdown)),
        }
    }
}

struct ClientState {
    seq: u64,
    pending: HashMap<u64, oneshot::Sender<Result<Payload>>, RandomState>,
    closing: bool,
    shutdown: bool,
}

struct Shared {
    state: StdMutex<ClientState>,
    stop: CancellationToken,
}

impl Shared {
    /// Assigns the next sequence and registers the call, refusing when the
    /// client is closing or shut down (the sender is dropped, which fails
    /// the call with [`ErrorKind::Shutdown`]).
    fn register_call(&self, tx: oneshot::Sender<Result<Payload>>) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        if state.closing || state.shutdown {
            return Err(Error::kind(ErrorKind::Shutdown));
        }
        let seq = state.seq;
        state.seq += 1;
        state.pending.insert(seq, tx);
        Ok(seq)
    }

    fn remove_call(&self, seq: u64) -> Option<oneshot::Sender<Result<Payload>>> {
        self.state.lock().unwrap().pending.remove(&seq)
    }

    fn terminate_calls(&self, err: Error) {
        let mut state = self.state.lock().unwrap();
        state.shutdown = true;
        for (_, tx) in state.pending.drain() {
            let _ = tx.send(Err(err.clone()));
        }
    }
}

/// An RPC client bound to one connection.
///
/// A client multiplexes any number of outstanding calls over the connection
/// and may be shared across tasks. Requests are written under a send mutex
/// with strictly increasing sequence numbers; a receive task matches each
/// response to its pending call by sequence.
pub struct Client {
    opt: ConnOption,
    writer: Mutex<CodecWriter>,
    shared: Arc<Shared>,
}

impl Client {
    /// Connects to an RPC server over TCP. `opt.connect_timeout` bounds
    /// dialing and the handshake together; zero means unlimited.
    ///
    /// # Errors
    pub async fn dial(addr: &str, opt: ConnOption) -> Result<Client> {
        let opt = opt.normalized();
        let timeout = opt.connect_timeout;
        Self::connect_within(timeout, async move {
            let stream = TcpStream::connect(addr)
                .await
                .map_err(|e| Error::new(ErrorKind::TcpConnectFailed, e.to_string()))?;
            Self::handshake(Conn::new(stream.into()), opt).await
        })
        .await
    }

    /// Connects over a unix domain socket.
    ///
    /// # Errors
    #[cfg(unix)]
    pub async fn dial_unix(path: &str, opt: ConnOption) -> Result<Client> {
        let opt = opt.normalized();
        let timeout = opt.connect_timeout;
        Self::connect_within(timeout, async move {
            let stream = UnixStream::connect(path)
                .await
                .map_err(|e| Error::new(ErrorKind::TcpConnectFailed, e.to_string()))?;
            Self::handshake(Conn::new(stream.into()), opt).await
        })
        .await
    }

    /// Connects to an RPC server listening behind an HTTP CONNECT upgrade.
    ///
    /// # Errors
    ///
    /// Fails when the server answers the upgrade with anything but
    /// `200 Connected to AureRPC`.
    pub async fn dial_http(addr: &str, opt: ConnOption) -> Result<Client> {
        let opt = opt.normalized();
        let timeout = opt.connect_timeout;
        Self::connect_within(timeout, async move {
            let stream = TcpStream::connect(addr)
                .await
                .map_err(|e| Error::new(ErrorKind::TcpConnectFailed, e.to_string()))?;
            let mut conn = Conn::new(stream.into());
            conn.write_all(format!("CONNECT {DEFAULT_RPC_PATH} HTTP/1.0\n\n").as_bytes())
                .await?;
            let status_line = conn.read_line().await?;
            let upgraded = status_line
                .strip_prefix("HTTP/1.0 ")
                .is_some_and(|status| status == CONNECTED);
            if !upgraded {
                return Err(Error::new(
                    ErrorKind::HttpUpgradeFailed,
                    format!("unexpected HTTP response: {status_line}"),
                ));
            }
            // the blank line terminating the upgrade response
            conn.read_line().await?;
            Self::handshake(conn, opt).await
        })
        .await
    }

    /// Dials an address of the form `"<scheme>@<target>"` with scheme
    /// `tcp`, `unix` or `http`.
    ///
    /// # Errors
    pub async fn xdial(rpc_addr: &str, opt: ConnOption) -> Result<Client> {
        match rpc_addr.split_once('@') {
            Some(("tcp", addr)) => Self::dial(addr, opt).await,
            Some(("http", addr)) => Self::dial_http(addr, opt).await,
            #[cfg(unix)]
            Some(("unix", path)) => Self::dial_unix(path, opt).await,
            Some((scheme, _)) => Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("rpc client: unsupported protocol {scheme}"),
            )),
            None => Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("rpc client: wrong address format {rpc_addr}, expect protocol@addr"),
            )),
        }
    }

    async fn connect_within<F>(timeout: Duration, connect: F) -> Result<Client>
    where
        F: Future<Output = Result<Client>>,
    {
        if timeout.is_zero() {
            return connect.await;
        }
        match tokio::time::timeout(timeout, connect).await {
            Ok(result) => result,
            // the racing connect future is dropped here, closing the socket
            Err(_) => Err(Error::new(
                ErrorKind::Timeout,
                format!(
                    "rpc client: connect timeout: expect within {}",
                    humantime::format_duration(timeout)
                ),
            )),
        }
    }

    async fn handshake(mut conn: Conn, opt: ConnOption) -> Result<Client> {
        conn.write_json(&opt).await?;
        let accepted: ConnOption = conn.read_json().await?;
        let Some(kind) = CodecKind::from_name(&accepted.codec) else {
            return Err(Error::new(
                ErrorKind::HandshakeFailed,
                format!("rpc client: invalid codec type {}", accepted.codec),
            ));
        };
        let (reader, writer) = conn.into_codec(kind);
        let shared = Arc::new(Shared {
            state: StdMutex::new(ClientState {
                seq: 1, // 0 is reserved as invalid
                pending: HashMap::default(),
                closing: false,
                shutdown: false,
            }),
            stop: CancellationToken::new(),
        });
        tokio::spawn(Self::receive_loop(shared.clone(), reader));
        Ok(Client {
            opt: accepted,
            writer: Mutex::new(writer),
            shared,
        })
    }

    /// The option the server accepted during the handshake.
    #[must_use]
    pub fn option(&self) -> &ConnOption {
        &self.opt
    }

    /// Starts a call without waiting for the reply.
    ///
    /// The request is fully written before this returns; the response is
    /// awaited through the returned [`Call`].
    pub async fn go<Req: Serialize>(&self, service_method: &str, args: &Req) -> Call {
        let (tx, rx) = oneshot::channel();
        let mut writer = self.writer.lock().await;
        let seq = match self.shared.register_call(tx) {
            Ok(seq) => seq,
            Err(_) => {
                // tx was dropped, the call fails with Shutdown
                return Call {
                    seq: 0,
                    service_method: service_method.to_string(),
                    rx,
                };
            }
        };
        let header = Header {
            service_method: service_method.to_string(),
            seq,
            error: String::new(),
        };
        if let Err(err) = writer.write(&header, args).await {
            // a missing entry means the response was already handled, the
            // write only partially failed and the error is swallowed
            if let Some(tx) = self.shared.remove_call(seq) {
                let _ = tx.send(Err(err));
            }
        }
        Call {
            seq,
            service_method: service_method.to_string(),
            rx,
        }
    }

    /// Invokes the named method and waits for the reply or for `ctx`.
    ///
    /// Cancellation removes the pending entry; a response arriving later is
    /// discarded by the receive loop and the client stays usable.
    ///
    /// # Errors
    pub async fn call<Req, Rsp>(&self, ctx: &Context, service_method: &str, args: &Req) -> Result<Rsp>
    where
        Req: Serialize,
        Rsp: DeserializeOwned,
    {
        let call = self.go(service_method, args).await;
        let seq = call.seq;
        tokio::select! {
            reason = ctx.done() => {
                self.shared.remove_call(seq);
                let kind = if reason == "context canceled" {
                    ErrorKind::Canceled
                } else {
                    ErrorKind::Timeout
                };
                Err(Error::new(kind, format!("rpc client: call failed: {reason}")))
            }
            result = call.done::<Rsp>() => result,
        }
    }

    /// A client is usable until it is closed or the connection dies.
    #[must_use]
    pub fn is_available(&self) -> bool {
        let state = self.shared.state.lock().unwrap();
        !state.closing && !state.shutdown
    }

    /// Closes the connection. Calling close more than once is a no-op.
    ///
    /// # Errors
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.closing {
                return Ok(());
            }
            state.closing = true;
        }
        self.shared.stop.cancel();
        self.writer.lock().await.shutdown().await;
        Ok(())
    }

    async fn receive_loop(shared: Arc<Shared>, mut reader: CodecReader) {
        let err = tokio::select! {
            () = shared.stop.cancelled() => Error::kind(ErrorKind::Shutdown),
            err = Self::receive(&shared, &mut reader) => err,
        };
        shared.terminate_calls(err);
    }

    /// Reads responses until the connection fails, returning the terminating
    /// error.
    async fn receive(shared: &Shared, reader: &mut CodecReader) -> Error {
        loop {
            let header = match reader.read_header().await {
                Ok(header) => header,
                Err(e) => return e,
            };
            match shared.remove_call(header.seq) {
                // no pending call: the request was cancelled, discard the body
                None => {
                    if let Err(e) = reader.read_payload().await {
                        return e;
                    }
                }
                Some(tx) if !header.error.is_empty() => {
                    let discarded = reader.read_payload().await;
                    let _ = tx.send(Err(Error::new(ErrorKind::RemoteError, header.error)));
                    if let Err(e) = discarded {
                        return e;
                    }
                }
                Some(tx) => match reader.read_payload().await {
                    Ok(payload) => {
                        let _ = tx.send(Ok(payload));
                    }
                    Err(e) => {
                        let _ = tx.send(Err(Error::new(
                            ErrorKind::RecvMsgFailed,
                            format!("rpc client: reading body: {e}"),
                        )));
                        return e;
                    }
                },
            }
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shared.stop.cancel();
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("codec", &self.opt.codec)
            .field("available", &self.is_available())
            .finish()
    }
}
