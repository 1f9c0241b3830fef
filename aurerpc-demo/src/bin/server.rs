use std::sync::Arc;
use std::time::Duration;

use aurerpc::{Server, heartbeat};
use aurerpc_demo::arith_service;
use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Listen address.
    #[arg(default_value = "127.0.0.1:0")]
    pub addr: std::net::SocketAddr,

    /// Registry endpoint to heartbeat, e.g.
    /// "http://127.0.0.1:9999/_aurerpc_/registry".
    #[arg(long)]
    pub registry: Option<String>,

    /// Serve RPC behind the HTTP CONNECT upgrade instead of plain TCP.
    #[arg(long, default_value_t = false)]
    pub http: bool,
}

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();
    let server = Arc::new(Server::new());
    server.register(arith_service()).unwrap();

    let listener = tokio::net::TcpListener::bind(args.addr).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let scheme = if args.http { "http" } else { "tcp" };
    tracing::info!("serving on {scheme}@{addr}");

    if let Some(registry) = &args.registry {
        heartbeat(registry, &format!("{scheme}@{addr}"), Duration::ZERO)
            .await
            .unwrap();
    }

    if args.http {
        server.accept_http(listener).await;
    } else {
        server.accept(listener).await;
    }
}
