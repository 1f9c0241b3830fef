use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use foldhash::fast::RandomState;
use serde::Serialize;
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::codec::{CodecKind, CodecReader, CodecWriter, Header, Payload};
use crate::error::{Error, ErrorKind, Result};
use crate::option::{ConnOption, MAGIC_NUMBER};
use crate::service::{Method, Service, ServiceSnapshot};
use crate::socket::{Conn, RawStream};

/// Fixed path for RPC connections established via HTTP CONNECT.
pub const DEFAULT_RPC_PATH: &str = "/_aurerpc_/";

/// Status the server answers a CONNECT upgrade with; the client requires it
/// verbatim.
pub(crate) const CONNECTED: &str = "200 Connected to AureRPC";

/// Placeholder body sent with every error response.
#[derive(Serialize)]
struct EmptyBody {}

/// An RPC server: a uniquely-named set of services plus the accept loops
/// that serve them.
///
/// Each accepted connection runs on its own task: option handshake, then a
/// read-dispatch-respond loop where every request is handled concurrently
/// and responses are serialized by a per-connection send mutex.
pub struct Server {
    services: DashMap<String, Arc<Service>, RandomState>,
    stop: CancellationToken,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    #[must_use]
    pub fn new() -> Self {
        Self {
            services: DashMap::default(),
            stop: CancellationToken::new(),
        }
    }

    /// Publishes a service. Service names must look like exported type names
    /// and be unique within the server.
    ///
    /// # Errors
    ///
    /// Fails on an invalid name or when the name is already registered.
    pub fn register(&self, service: Service) -> Result<()> {
        let name = service.name().to_string();
        if !name.chars().next().is_some_and(|c| c.is_uppercase()) {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("rpc server: {name} is not a valid service name"),
            ));
        }
        if let Some(method) = service.method_names().find(|m| m.contains('.')) {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("rpc server: invalid method name {name}.{method}"),
            ));
        }
        match self.services.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("rpc server: service already defined: {name}"),
            )),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                for method in service.method_names() {
                    tracing::info!("rpc server: register {name}.{method}");
                }
                entry.insert(Arc::new(service));
                Ok(())
            }
        }
    }

    /// Stops the accept loops. Connections already being served drain on
    /// their own.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Introspection over registered services: method signatures and call
    /// counts, sorted by service name.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ServiceSnapshot> {
        let mut services: Vec<ServiceSnapshot> =
            self.services.iter().map(|e| e.value().snapshot()).collect();
        services.sort_by(|a, b| a.name.cmp(&b.name));
        services
    }

    fn find_method(&self, service_method: &str) -> Result<Arc<Method>> {
        let Some(dot) = service_method.rfind('.') else {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("rpc server: service/method request ill-formed: {service_method}"),
            ));
        };
        let (service_name, method_name) = (&service_method[..dot], &service_method[dot + 1..]);
        let service = self
            .services
            .get(service_name)
            .map(|s| s.value().clone())
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::MethodNotFound,
                    format!("rpc server: can't find service {service_name}"),
                )
            })?;
        service.get(method_name).ok_or_else(|| {
            Error::new(
                ErrorKind::MethodNotFound,
                format!("rpc server: can't find method {method_name}"),
            )
        })
    }

    /// Serves connections accepted from `listener` until the listener fails
    /// or [`Server::stop`] is called.
    pub async fn accept(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                () = self.stop.cancelled() => {
                    tracing::info!("rpc server: stop accept loop");
                    return;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        tokio::spawn(self.clone().serve_conn(stream.into()));
                    }
                    Err(e) => {
                        tracing::error!("rpc server: accept error: {e}");
                        return;
                    }
                }
            }
        }
    }

    #[cfg(unix)]
    pub async fn accept_unix(self: Arc<Self>, listener: UnixListener) {
        loop {
            tokio::select! {
                () = self.stop.cancelled() => {
                    tracing::info!("rpc server: stop accept loop");
                    return;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        tokio::spawn(self.clone().serve_conn(stream.into()));
                    }
                    Err(e) => {
                        tracing::error!("rpc server: accept error: {e}");
                        return;
                    }
                }
            }
        }
    }

    /// Serves connections that start with an HTTP CONNECT upgrade on
    /// [`DEFAULT_RPC_PATH`] instead of a bare option exchange.
    pub async fn accept_http(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                () = self.stop.cancelled() => {
                    tracing::info!("rpc server: stop accept loop");
                    return;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        tokio::spawn(self.clone().serve_http_conn(stream.into()));
                    }
                    Err(e) => {
                        tracing::error!("rpc server: accept error: {e}");
                        return;
                    }
                }
            }
        }
    }

    /// Runs the RPC protocol on a single connection, blocking until the
    /// client hangs up.
    pub async fn serve_conn(self: Arc<Self>, stream: RawStream) {
        self.serve_rpc(Conn::new(stream)).await;
    }

    async fn serve_http_conn(self: Arc<Self>, stream: RawStream) {
        let mut conn = Conn::new(stream);
        let request_line = match conn.read_line().await {
            Ok(line) => line,
            Err(e) => {
                tracing::error!("rpc server: read http request error: {e}");
                return;
            }
        };
        // drain the rest of the request head
        loop {
            match conn.read_line().await {
                Ok(line) if line.is_empty() => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::error!("rpc server: read http request error: {e}");
                    return;
                }
            }
        }

        let mut parts = request_line.split_whitespace();
        let method = parts.next().unwrap_or_default();
        let path = parts.next().unwrap_or_default();
        if path != DEFAULT_RPC_PATH {
            let _ = conn
                .write_all(
                    b"HTTP/1.0 404 Not Found\r\n\
                      Content-Type: text/plain; charset=utf-8\r\n\r\n\
                      404 page not found\n",
                )
                .await;
            return;
        }
        if method != "CONNECT" {
            let _ = conn
                .write_all(
                    b"HTTP/1.0 405 Method Not Allowed\r\n\
                      Content-Type: text/plain; charset=utf-8\r\n\r\n\
                      405 must CONNECT\n",
                )
                .await;
            return;
        }
        if let Err(e) = conn
            .write_all(format!("HTTP/1.0 {CONNECTED}\n\n").as_bytes())
            .await
        {
            tracing::error!("rpc server: http upgrade error: {e}");
            return;
        }
        self.serve_rpc(conn).await;
    }

    async fn serve_rpc(self: Arc<Self>, mut conn: Conn) {
        let opt: ConnOption = match conn.read_json().await {
            Ok(opt) => opt,
            Err(e) => {
                tracing::error!("rpc server: receive options error: {e}");
                return;
            }
        };
        if opt.magic != MAGIC_NUMBER {
            tracing::error!("rpc server: invalid magic number: {:#x}", opt.magic);
            return;
        }
        let Some(kind) = CodecKind::from_name(&opt.codec) else {
            tracing::error!("rpc server: invalid codec type {}", opt.codec);
            return;
        };
        if let Err(e) = conn.write_json(&opt).await {
            tracing::error!("rpc server: send options error: {e}");
            return;
        }
        let (reader, writer) = conn.into_codec(kind);
        self.serve_codec(reader, writer, &opt).await;
    }

    async fn serve_codec(&self, mut reader: CodecReader, writer: CodecWriter, opt: &ConnOption) {
        let writer = Arc::new(Mutex::new(writer));
        let mut inflight = JoinSet::new();
        loop {
            let mut header = match reader.read_header().await {
                Ok(header) => header,
                Err(e) => {
                    if e.kind != ErrorKind::Eof {
                        tracing::error!("rpc server: read header error: {e}");
                    }
                    break;
                }
            };
            if header.seq == 0 {
                let _ = reader.read_payload().await;
                header.error = "rpc server: invalid sequence number 0".to_string();
                Self::send_response(&writer, &header, &EmptyBody {}).await;
                continue;
            }
            let method = match self.find_method(&header.service_method) {
                Ok(method) => method,
                Err(e) => {
                    // consume the body best-effort so the stream stays framed
                    let _ = reader.read_payload().await;
                    header.error = e.to_string();
                    Self::send_response(&writer, &header, &EmptyBody {}).await;
                    continue;
                }
            };
            let argv = match reader.read_payload().await {
                Ok(argv) => argv,
                Err(e) => {
                    tracing::error!("rpc server: read request argv error: {e}");
                    break;
                }
            };
            inflight.spawn(Self::handle_request(
                method,
                header,
                argv,
                writer.clone(),
                opt.handle_timeout,
            ));
        }
        // drain in-flight requests before closing the codec
        while inflight.join_next().await.is_some() {}
        writer.lock().await.shutdown().await;
    }

    async fn handle_request(
        method: Arc<Method>,
        mut header: Header,
        argv: Payload,
        writer: Arc<Mutex<CodecWriter>>,
        timeout: Duration,
    ) {
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            // the send is non-blocking: if the request already timed out the
            // receiver is gone and the result is simply dropped
            let _ = tx.send(method.call(argv).await);
        });

        let result = if timeout.is_zero() {
            rx.await.ok()
        } else {
            tokio::select! {
                () = tokio::time::sleep(timeout) => {
                    header.error = format!(
                        "rpc server: request handle timeout: expect within {}",
                        humantime::format_duration(timeout)
                    );
                    Self::send_response(&writer, &header, &EmptyBody {}).await;
                    return;
                }
                result = rx => result.ok(),
            }
        };

        match result {
            Some(Ok(reply)) => {
                let mut writer = writer.lock().await;
                if let Err(e) = writer.write_payload(&header, &reply).await {
                    tracing::error!("rpc server: write response error: {e}");
                }
            }
            Some(Err(e)) => {
                header.error = e.to_string();
                Self::send_response(&writer, &header, &EmptyBody {}).await;
            }
            None => {
                header.error = "rpc server: handler terminated unexpectedly".to_string();
                Self::send_response(&writer, &header, &EmptyBody {}).await;
            }
        }
    }

    async fn send_response<T: Serialize>(writer: &Mutex<CodecWriter>, header: &Header, body: &T) {
        let mut writer = writer.lock().await;
        if let Err(e) = writer.write(header, body).await {
            tracing::error!("rpc server: write response error: {e}");
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("services", &self.services.len())
            .finish()
    }
}
