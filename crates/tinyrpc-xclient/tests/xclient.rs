//! Multi-endpoint client tests over real TCP servers.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tinyrpc::{MethodError, Options, Server, Service, ServiceBuilder};
use tinyrpc_xclient::{xdial, MultiServersDiscovery, SelectMode, XClient, XClientError};
use tokio::net::TcpListener;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Args {
    num1: i64,
    num2: i64,
}

struct Foo;

fn sum_service() -> Service {
    ServiceBuilder::new("Foo", Foo)
        .unwrap()
        .method("Sum", |_foo: Arc<Foo>, args: Args| async move {
            Ok::<_, MethodError>(args.num1 + args.num2)
        })
        .unwrap()
        .method("Sleep", |_foo: Arc<Foo>, args: Args| async move {
            tokio::time::sleep(Duration::from_millis(args.num1 as u64)).await;
            Ok::<_, MethodError>(args.num1 + args.num2)
        })
        .unwrap()
        .build()
}

fn failing_service() -> Service {
    ServiceBuilder::new("Foo", Foo)
        .unwrap()
        .method("Sum", |_foo: Arc<Foo>, _args: Args| async move {
            Err::<i64, _>(MethodError::new("endpoint down"))
        })
        .unwrap()
        .method("Sleep", |_foo: Arc<Foo>, _args: Args| async move {
            Err::<i64, _>(MethodError::new("endpoint down"))
        })
        .unwrap()
        .build()
}

async fn start_server(service: Service) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = format!("tcp@{}", listener.local_addr().unwrap());
    let server = Arc::new(Server::new());
    server.register(service).unwrap();
    tokio::spawn(server.accept(listener));
    addr
}

#[tokio::test(flavor = "multi_thread")]
async fn call_round_robin_spreads_over_endpoints() {
    let addrs = vec![
        start_server(sum_service()).await,
        start_server(sum_service()).await,
        start_server(sum_service()).await,
    ];
    let discovery = MultiServersDiscovery::new(addrs);
    let xclient = XClient::new(discovery, SelectMode::RoundRobin, Options::default());

    for i in 0..9i64 {
        let reply: i64 = xclient
            .call("Foo.Sum", &Args { num1: i, num2: 1 })
            .await
            .unwrap();
        assert_eq!(reply, i + 1);
    }
    xclient.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn call_random_mode() {
    let addrs = vec![
        start_server(sum_service()).await,
        start_server(sum_service()).await,
    ];
    let discovery = MultiServersDiscovery::new(addrs);
    let xclient = XClient::new(discovery, SelectMode::Random, Options::default());

    let reply: i64 = xclient
        .call("Foo.Sum", &Args { num1: 40, num2: 2 })
        .await
        .unwrap();
    assert_eq!(reply, 42);
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_discovery_fails_call() {
    let discovery = MultiServersDiscovery::new(Vec::new());
    let xclient = XClient::new(discovery, SelectMode::Random, Options::default());

    let err = xclient
        .call::<_, i64>("Foo.Sum", &Args { num1: 1, num2: 2 })
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "rpc discovery: no available servers");
}

#[tokio::test(flavor = "multi_thread")]
async fn broadcast_all_success() {
    let addrs = vec![
        start_server(sum_service()).await,
        start_server(sum_service()).await,
        start_server(sum_service()).await,
    ];
    let discovery = MultiServersDiscovery::new(addrs);
    let xclient = XClient::new(discovery, SelectMode::RoundRobin, Options::default());

    let reply: Option<i64> = xclient
        .broadcast("Foo.Sum", &Args { num1: 1, num2: 2 })
        .await
        .unwrap();
    assert_eq!(reply, Some(3));
}

#[tokio::test(flavor = "multi_thread")]
async fn broadcast_returns_first_error() {
    // Two healthy endpoints that answer slowly, one that fails fast: the
    // failure must win and cancel the peers.
    let addrs = vec![
        start_server(sum_service()).await,
        start_server(failing_service()).await,
        start_server(sum_service()).await,
    ];
    let discovery = MultiServersDiscovery::new(addrs);
    let xclient = XClient::new(discovery, SelectMode::RoundRobin, Options::default());

    let err = xclient
        .broadcast::<_, i64>("Foo.Sleep", &Args { num1: 300, num2: 2 })
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "endpoint down");
}

#[tokio::test(flavor = "multi_thread")]
async fn broadcast_no_endpoints() {
    let discovery = MultiServersDiscovery::new(Vec::new());
    let xclient = XClient::new(discovery, SelectMode::Random, Options::default());

    let reply: Option<i64> = xclient
        .broadcast("Foo.Sum", &Args { num1: 1, num2: 2 })
        .await
        .unwrap();
    assert_eq!(reply, None);
}

#[tokio::test(flavor = "multi_thread")]
async fn cached_client_is_reused() {
    let addr = start_server(sum_service()).await;
    let discovery = MultiServersDiscovery::new(vec![addr]);
    let xclient = XClient::new(discovery, SelectMode::RoundRobin, Options::default());

    // The second call takes the cached-client path.
    let one: i64 = xclient
        .call("Foo.Sum", &Args { num1: 1, num2: 0 })
        .await
        .unwrap();
    let two: i64 = xclient
        .call("Foo.Sum", &Args { num1: 2, num2: 0 })
        .await
        .unwrap();
    assert_eq!((one, two), (1, 2));
}

#[tokio::test(flavor = "multi_thread")]
async fn xdial_rejects_malformed_addresses() {
    let err = xdial("localhost:9999", Options::default()).await.unwrap_err();
    assert!(matches!(err, XClientError::BadAddress(_)));
    assert!(err.to_string().contains("expect protocol@addr"));

    let err = xdial("carrier-pigeon@localhost:9999", Options::default())
        .await
        .unwrap_err();
    assert!(matches!(err, XClientError::BadAddress(_)));
}
