use std::time::Duration;

use aurerpc::{DEFAULT_REGISTRY_PATH, Registry};
use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Listen address.
    #[arg(default_value = "127.0.0.1:9999")]
    pub addr: std::net::SocketAddr,

    /// How long a heartbeat keeps a server listed, in seconds.
    #[arg(long, default_value = "300")]
    pub timeout: u64,
}

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();
    let registry = Registry::new(Duration::from_secs(args.timeout));
    let listener = tokio::net::TcpListener::bind(args.addr).await.unwrap();
    tracing::info!(
        "registry listening on http://{}{}",
        args.addr,
        DEFAULT_REGISTRY_PATH
    );
    registry
        .handle_http(listener, DEFAULT_REGISTRY_PATH)
        .await
        .unwrap();
}
