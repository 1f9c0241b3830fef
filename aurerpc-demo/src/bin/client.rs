use std::sync::Arc;
use std::time::Duration;

use aurerpc::{
    ConnOption, Context, MultiServersDiscovery, RegistryDiscovery, SelectMode, XClient,
};
use aurerpc_demo::SumArgs;
use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Registry endpoint, e.g. "http://127.0.0.1:9999/_aurerpc_/registry".
    #[arg(long)]
    pub registry: Option<String>,

    /// Explicit server addresses ("tcp@host:port"), used when no registry
    /// is given.
    #[arg(long)]
    pub server: Vec<String>,

    /// Number of calls to issue.
    #[arg(long, default_value = "5")]
    pub count: i64,

    /// Also broadcast one call to every server.
    #[arg(long, default_value_t = false)]
    pub broadcast: bool,
}

async fn run<D: aurerpc::Discovery + 'static>(xclient: Arc<XClient<D>>, args: &Args) {
    for i in 0..args.count {
        let ctx = Context::with_timeout(Duration::from_secs(3));
        let call_args = SumArgs { num1: i, num2: i * i };
        match xclient.call::<_, i64>(&ctx, "Arith.Sum", &call_args).await {
            Ok(reply) => tracing::info!("{} + {} = {reply}", call_args.num1, call_args.num2),
            Err(e) => tracing::error!("Arith.Sum failed: {e}"),
        }
    }

    if args.broadcast {
        let ctx = Context::with_timeout(Duration::from_secs(3));
        let call_args = SumArgs { num1: 20, num2: 22 };
        match xclient
            .broadcast::<_, i64>(&ctx, "Arith.Sum", &call_args)
            .await
        {
            Ok(reply) => tracing::info!("broadcast reply: {reply}"),
            Err(e) => tracing::error!("broadcast failed: {e}"),
        }
    }

    if let Err(e) = xclient.close().await {
        tracing::error!("close failed: {e}");
    }
}

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();
    if let Some(registry) = &args.registry {
        let discovery = RegistryDiscovery::new(registry.clone(), Duration::ZERO);
        run(
            Arc::new(XClient::new(
                discovery,
                SelectMode::RoundRobin,
                ConnOption::default(),
            )),
            &args,
        )
        .await;
    } else {
        let discovery = MultiServersDiscovery::new(args.server.clone());
        run(
            Arc::new(XClient::new(
                discovery,
                SelectMode::Random,
                ConnOption::default(),
            )),
            &args,
        )
        .await;
    }
}
