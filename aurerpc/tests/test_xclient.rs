use std::sync::Arc;
use std::time::{Duration, Instant};

use aurerpc::{
    ConnOption, Context, Error, ErrorKind, MultiServersDiscovery, SelectMode, Server, Service,
    XClient,
};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
struct SumArgs {
    num1: i64,
    num2: i64,
}

fn arith_service() -> Service {
    Service::new("Arith")
        .method("Sum", |args: SumArgs| async move { Ok(args.num1 + args.num2) })
}

async fn start_server(service: Service) -> (Arc<Server>, String) {
    let server = Arc::new(Server::new());
    server.register(service).unwrap();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(server.clone().accept(listener));
    (server, format!("tcp@{addr}"))
}

fn sum_calls(server: &Server) -> u64 {
    server
        .snapshot()
        .iter()
        .flat_map(|s| s.methods.iter())
        .map(|m| m.num_calls)
        .sum()
}

#[tokio::test]
async fn test_random_load_balance() {
    let (server1, addr1) = start_server(arith_service()).await;
    let (server2, addr2) = start_server(arith_service()).await;

    let discovery = MultiServersDiscovery::new(vec![addr1, addr2]);
    let xclient = Arc::new(XClient::new(
        discovery,
        SelectMode::Random,
        ConnOption::default(),
    ));

    let mut tasks = Vec::new();
    for i in 0..100i64 {
        let xclient = xclient.clone();
        tasks.push(tokio::spawn(async move {
            let reply: i64 = xclient
                .call(&Context::new(), "Arith.Sum", &SumArgs { num1: i, num2: 1 })
                .await
                .unwrap();
            assert_eq!(reply, i + 1);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let (calls1, calls2) = (sum_calls(&server1), sum_calls(&server2));
    assert_eq!(calls1 + calls2, 100);
    assert!(calls1 > 0, "first server never selected");
    assert!(calls2 > 0, "second server never selected");
}

#[tokio::test]
async fn test_round_robin_is_even() {
    let (server1, addr1) = start_server(arith_service()).await;
    let (server2, addr2) = start_server(arith_service()).await;

    let discovery = MultiServersDiscovery::new(vec![addr1, addr2]);
    let xclient = Arc::new(XClient::new(
        discovery,
        SelectMode::RoundRobin,
        ConnOption::default(),
    ));

    for i in 0..10i64 {
        let reply: i64 = xclient
            .call(&Context::new(), "Arith.Sum", &SumArgs { num1: i, num2: 0 })
            .await
            .unwrap();
        assert_eq!(reply, i);
    }

    assert_eq!(sum_calls(&server1), 5);
    assert_eq!(sum_calls(&server2), 5);
}

#[tokio::test]
async fn test_broadcast_success() {
    let (_server1, addr1) = start_server(arith_service()).await;
    let (_server2, addr2) = start_server(arith_service()).await;

    let discovery = MultiServersDiscovery::new(vec![addr1, addr2]);
    let xclient = Arc::new(XClient::new(
        discovery,
        SelectMode::Random,
        ConnOption::default(),
    ));

    let reply: i64 = xclient
        .broadcast(&Context::new(), "Arith.Sum", &SumArgs { num1: 7, num2: 8 })
        .await
        .unwrap();
    assert_eq!(reply, 15);
}

#[tokio::test]
async fn test_broadcast_fail_fast() {
    let failing = Service::new("Arith").method("Sum", |_: SumArgs| async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        Err::<i64, _>(Error::new(ErrorKind::InvalidArgument, "boom".to_string()))
    });
    let slow = || {
        Service::new("Arith").method("Sum", |args: SumArgs| async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Ok(args.num1 + args.num2)
        })
    };

    let (_server1, addr1) = start_server(failing).await;
    let (_server2, addr2) = start_server(slow()).await;
    let (_server3, addr3) = start_server(slow()).await;

    let discovery = MultiServersDiscovery::new(vec![addr1, addr2, addr3]);
    let xclient = Arc::new(XClient::new(
        discovery,
        SelectMode::Random,
        ConnOption::default(),
    ));

    let started = Instant::now();
    let err = xclient
        .broadcast::<_, i64>(&Context::new(), "Arith.Sum", &SumArgs { num1: 1, num2: 1 })
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(err.to_string().contains("boom"), "unexpected error: {err}");
    assert!(
        elapsed < Duration::from_secs(1),
        "broadcast was not fail-fast: {elapsed:?}"
    );
}

#[tokio::test]
async fn test_broadcast_empty_set() {
    let discovery = MultiServersDiscovery::new(Vec::new());
    let xclient = Arc::new(XClient::new(
        discovery,
        SelectMode::Random,
        ConnOption::default(),
    ));

    let err = xclient
        .broadcast::<_, i64>(&Context::new(), "Arith.Sum", &SumArgs { num1: 0, num2: 0 })
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::NoAvailableServers);
}

#[tokio::test]
async fn test_close_evicts_and_redials() {
    let (server, addr) = start_server(arith_service()).await;

    let discovery = MultiServersDiscovery::new(vec![addr]);
    let xclient = Arc::new(XClient::new(
        discovery,
        SelectMode::RoundRobin,
        ConnOption::default(),
    ));

    let args = SumArgs { num1: 1, num2: 2 };
    let reply: i64 = xclient.call(&Context::new(), "Arith.Sum", &args).await.unwrap();
    assert_eq!(reply, 3);

    xclient.close().await.unwrap();

    // the cache is empty, the next call dials a fresh connection
    let reply: i64 = xclient.call(&Context::new(), "Arith.Sum", &args).await.unwrap();
    assert_eq!(reply, 3);
    assert_eq!(sum_calls(&server), 2);
}
