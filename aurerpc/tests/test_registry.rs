use std::sync::Arc;
use std::time::Duration;

use aurerpc::{
    heartbeat, ConnOption, Context, Discovery, Registry, RegistryDiscovery, SelectMode, Server,
    Service, XClient, DEFAULT_REGISTRY_PATH, HEADER_SERVER, HEADER_SERVERS,
};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
struct SumArgs {
    num1: i64,
    num2: i64,
}

async fn start_registry(timeout: Duration) -> (Arc<Registry>, String, tokio::task::JoinHandle<()>) {
    let registry = Registry::new(timeout);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = registry.handle_http(listener, DEFAULT_REGISTRY_PATH);
    let url = format!("http://{addr}{DEFAULT_REGISTRY_PATH}");
    (registry, url, handle)
}

fn servers_header(response: &reqwest::Response) -> String {
    response
        .headers()
        .get(HEADER_SERVERS)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

#[tokio::test]
async fn test_registry_endpoint() {
    let (_registry, url, _handle) = start_registry(Duration::from_secs(60)).await;
    let http = reqwest::Client::new();

    // empty registry lists nothing
    let response = http.get(&url).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(servers_header(&response), "");

    // a POST with the address header upserts the entry
    let response = http
        .post(&url)
        .header(HEADER_SERVER, "tcp@127.0.0.1:9002")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let response = http
        .post(&url)
        .header(HEADER_SERVER, "tcp@127.0.0.1:9001")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    // listed sorted ascending
    let response = http.get(&url).send().await.unwrap();
    assert_eq!(
        servers_header(&response),
        "tcp@127.0.0.1:9001,tcp@127.0.0.1:9002"
    );

    // a heartbeat without an address is rejected
    let response = http.post(&url).send().await.unwrap();
    assert_eq!(response.status(), 400);

    // only GET and POST are allowed
    let response = http.put(&url).send().await.unwrap();
    assert_eq!(response.status(), 405);

    // only the registry path is served
    let wrong = url.replace(DEFAULT_REGISTRY_PATH, "/other");
    let response = http.get(&wrong).send().await.unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_registry_evicts_expired() {
    let (_registry, url, _handle) = start_registry(Duration::from_millis(200)).await;
    let http = reqwest::Client::new();

    http.post(&url)
        .header(HEADER_SERVER, "tcp@127.0.0.1:9001")
        .send()
        .await
        .unwrap();
    let response = http.get(&url).send().await.unwrap();
    assert_eq!(servers_header(&response), "tcp@127.0.0.1:9001");

    tokio::time::sleep(Duration::from_millis(300)).await;
    let response = http.get(&url).send().await.unwrap();
    assert_eq!(servers_header(&response), "");
}

#[tokio::test]
async fn test_heartbeat_keeps_server_alive() {
    let (_registry, url, _handle) = start_registry(Duration::from_millis(300)).await;

    heartbeat(&url, "tcp@127.0.0.1:9009", Duration::from_millis(100))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    let response = reqwest::Client::new().get(&url).send().await.unwrap();
    assert_eq!(servers_header(&response), "tcp@127.0.0.1:9009");
}

#[tokio::test]
async fn test_heartbeat_fails_without_registry() {
    heartbeat(
        "http://127.0.0.1:1/_aurerpc_/registry",
        "tcp@127.0.0.1:9009",
        Duration::ZERO,
    )
    .await
    .unwrap_err();
}

#[tokio::test]
async fn test_registry_discovery_refresh_ttl() {
    let (_registry, url, handle) = start_registry(Duration::from_secs(60)).await;
    let http = reqwest::Client::new();
    http.post(&url)
        .header(HEADER_SERVER, "tcp@127.0.0.1:9001")
        .send()
        .await
        .unwrap();

    let discovery = RegistryDiscovery::new(url.as_str(), Duration::from_millis(300));
    assert_eq!(
        discovery.get_all().await.unwrap(),
        vec!["tcp@127.0.0.1:9001"]
    );

    // kill the registry: within the TTL the cached list is served with no
    // HTTP request, past it the refresh has to hit the network and fails
    handle.abort();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        discovery.get_all().await.unwrap(),
        vec!["tcp@127.0.0.1:9001"]
    );

    tokio::time::sleep(Duration::from_millis(300)).await;
    discovery.get_all().await.unwrap_err();
}

#[tokio::test]
async fn test_registry_discovery_update_bypasses_ttl() {
    let discovery = RegistryDiscovery::new("http://127.0.0.1:1/x", Duration::from_secs(10));
    discovery
        .update(vec!["tcp@127.0.0.1:9001".to_string()])
        .await
        .unwrap();
    // update stamped last_update, so no refresh happens within the TTL
    assert_eq!(
        discovery.get(SelectMode::RoundRobin).await.unwrap(),
        "tcp@127.0.0.1:9001"
    );
}

#[tokio::test]
async fn test_end_to_end_with_registry() {
    let (_registry, url, _handle) = start_registry(Duration::from_secs(60)).await;

    let mut addrs = Vec::new();
    for _ in 0..2 {
        let server = Arc::new(Server::new());
        let service = Service::new("Arith")
            .method("Sum", |args: SumArgs| async move { Ok(args.num1 + args.num2) });
        server.register(service).unwrap();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = format!("tcp@{}", listener.local_addr().unwrap());
        tokio::spawn(server.clone().accept(listener));
        heartbeat(&url, &addr, Duration::from_secs(30)).await.unwrap();
        addrs.push(addr);
    }

    let discovery = RegistryDiscovery::new(url.as_str(), Duration::ZERO);
    let mut found = discovery.get_all().await.unwrap();
    found.sort();
    addrs.sort();
    assert_eq!(found, addrs);

    let xclient = Arc::new(XClient::new(
        discovery,
        SelectMode::RoundRobin,
        ConnOption::default(),
    ));
    for i in 0..4i64 {
        let reply: i64 = xclient
            .call(&Context::new(), "Arith.Sum", &SumArgs { num1: i, num2: 10 })
            .await
            .unwrap();
        assert_eq!(reply, i + 10);
    }

    let reply: i64 = xclient
        .broadcast(&Context::new(), "Arith.Sum", &SumArgs { num1: 1, num2: 1 })
        .await
        .unwrap();
    assert_eq!(reply, 2);
}
