use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use foldhash::fast::RandomState;
use http_body_util::Full;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};

use crate::error::{Error, ErrorKind, Result};

/// Fixed path the registry endpoint is usually served at.
pub const DEFAULT_REGISTRY_PATH: &str = "/_aurerpc_/registry";

/// How long a heartbeat keeps a server alive.
pub const DEFAULT_REGISTRY_TIMEOUT: Duration = Duration::from_secs(300);

/// Response header carrying the comma-joined list of alive servers.
pub const HEADER_SERVERS: &str = "X-Aurerpc-Servers";

/// Request header carrying the address a heartbeat announces.
pub const HEADER_SERVER: &str = "X-Aurerpc-Server";

/// An in-memory directory of live server addresses, maintained by heartbeats
/// and exposed over HTTP.
///
/// `GET` lists alive servers in the [`HEADER_SERVERS`] response header,
/// evicting expired entries on the way; `POST` upserts the address in the
/// [`HEADER_SERVER`] request header; anything else is rejected.
pub struct Registry {
    timeout: Duration,
    services: Mutex<HashMap<String, Instant, RandomState>>,
}

impl Registry {
    /// A `timeout` of zero selects [`DEFAULT_REGISTRY_TIMEOUT`].
    #[must_use]
    pub fn new(timeout: Duration) -> Arc<Self> {
        let timeout = if timeout.is_zero() {
            DEFAULT_REGISTRY_TIMEOUT
        } else {
            timeout
        };
        Arc::new(Self {
            timeout,
            services: Mutex::default(),
        })
    }

    fn put_server(&self, addr: &str) {
        self.services
            .lock()
            .unwrap()
            .insert(addr.to_string(), Instant::now());
    }

    /// Lists alive servers sorted ascending; expired entries are evicted as
    /// a side effect.
    fn alive_servers(&self) -> Vec<String> {
        let mut services = self.services.lock().unwrap();
        services.retain(|_, start| start.elapsed() <= self.timeout);
        let mut alive: Vec<String> = services.keys().cloned().collect();
        alive.sort();
        alive
    }

    /// Serves the registry endpoint at `path` on `listener`.
    pub fn handle_http(self: &Arc<Self>, listener: TcpListener, path: &str) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        let path = path.to_string();
        tracing::info!("rpc registry: serving at {path}");
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let registry = registry.clone();
                let path = path.clone();
                tokio::spawn(async move {
                    let service = hyper::service::service_fn(move |request| {
                        let registry = registry.clone();
                        let path = path.clone();
                        async move { Ok::<_, Infallible>(registry.handle(&path, &request)) }
                    });
                    if let Err(e) = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                    {
                        tracing::error!("rpc registry: serve connection error: {e}");
                    }
                });
            }
        })
    }

    fn handle(&self, path: &str, request: &Request<hyper::body::Incoming>) -> Response<Full<Bytes>> {
        if request.uri().path() != path {
            return plain_response(StatusCode::NOT_FOUND, "404 page not found\n", None);
        }
        if request.method() == Method::GET {
            let servers = self.alive_servers().join(",");
            plain_response(StatusCode::OK, "", Some((HEADER_SERVERS, servers)))
        } else if request.method() == Method::POST {
            let addr = request
                .headers()
                .get(HEADER_SERVER)
                .and_then(|value| value.to_str().ok())
                .filter(|addr| !addr.is_empty());
            match addr {
                Some(addr) => {
                    self.put_server(addr);
                    plain_response(StatusCode::OK, "", None)
                }
                None => {
                    plain_response(StatusCode::BAD_REQUEST, "server address is required\n", None)
                }
            }
        } else {
            plain_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed\n", None)
        }
    }
}

fn plain_response(
    status: StatusCode,
    body: &str,
    header: Option<(&str, String)>,
) -> Response<Full<Bytes>> {
    let mut builder = Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8");
    if let Some((name, value)) = header {
        builder = builder.header(name, value);
    }
    builder
        .body(Full::from(Bytes::from(body.to_string())))
        .unwrap_or_else(|_| Response::new(Full::default()))
}

/// Announces `addr` to the registry at `registry` every `interval` (zero
/// selects `timeout - 1min`). The first heartbeat is synchronous and its
/// failure aborts the whole thing; later failures stop the ticker task but
/// never the caller.
///
/// # Errors
///
/// Fails when the initial heartbeat is rejected or undeliverable.
pub async fn heartbeat(registry: &str, addr: &str, interval: Duration) -> Result<()> {
    let interval = if interval.is_zero() {
        DEFAULT_REGISTRY_TIMEOUT - Duration::from_secs(60)
    } else {
        interval
    };
    send_heartbeat(registry, addr).await?;

    let registry = registry.to_string();
    let addr = addr.to_string();
    tracing::info!("rpc registry: heartbeat started for {addr}");
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // the immediate first tick
        loop {
            ticker.tick().await;
            if let Err(e) = send_heartbeat(&registry, &addr).await {
                tracing::error!("rpc registry: heartbeat failed: {e}");
                break;
            }
        }
    });
    Ok(())
}

async fn send_heartbeat(registry: &str, addr: &str) -> Result<()> {
    tracing::info!("rpc registry: send heartbeat to {registry} for {addr}");
    let response = http_request(Method::POST, registry, Some((HEADER_SERVER, addr))).await?;
    if !response.status().is_success() {
        return Err(Error::new(
            ErrorKind::HttpRequestFailed,
            format!("heartbeat rejected: {}", response.status()),
        ));
    }
    Ok(())
}

/// One-shot HTTP request over a fresh connection, used for heartbeats and
/// registry refreshes.
pub(crate) async fn http_request(
    method: Method,
    url: &str,
    header: Option<(&str, &str)>,
) -> Result<Response<hyper::body::Incoming>> {
    let uri: hyper::Uri = url
        .parse()
        .map_err(|e: hyper::http::uri::InvalidUri| {
            Error::new(ErrorKind::InvalidArgument, e.to_string())
        })?;
    let authority = uri
        .authority()
        .ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidArgument,
                format!("registry url without authority: {url}"),
            )
        })?
        .clone();

    let stream = TcpStream::connect(authority.as_str())
        .await
        .map_err(|e| Error::new(ErrorKind::TcpConnectFailed, e.to_string()))?;
    let (mut sender, conn) = hyper::client::conn::http1::handshake::<TokioIo<_>, Full<Bytes>>(
        TokioIo::new(stream),
    )
    .await
    .map_err(|e| Error::new(ErrorKind::HttpRequestFailed, e.to_string()))?;
    tokio::spawn(conn);

    let mut builder = Request::builder()
        .method(method)
        .uri(uri.path())
        .header(hyper::header::HOST, authority.as_str());
    if let Some((name, value)) = header {
        builder = builder.header(name, value);
    }
    let request = builder
        .body(Full::default())
        .map_err(|e| Error::new(ErrorKind::HttpRequestFailed, e.to_string()))?;

    sender
        .send_request(request)
        .await
        .map_err(|e| Error::new(ErrorKind::HttpRequestFailed, e.to_string()))
}
