//! Integration tests for rpcbus
//!
//! End-to-end calls between a client and a server over the in-memory broker,
//! on both bindings.

use rpcbus::memory::MemoryBroker;
use rpcbus::{
    handler_fn, json_handler, Binding, BindingKind, Client, ClientConfig, ConnectionConfig,
    HandlerError, Message, Request, Router, RpcError, Server, ServerConfig, TransportError,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const REQUESTS: &str = "calc.requests";
const REPLIES: &str = "calc.replies";

fn connection() -> ConnectionConfig {
    ConnectionConfig::new("memory://test").retry(Duration::from_millis(20), 5)
}

fn binding(broker: &MemoryBroker, kind: BindingKind) -> Binding {
    match kind {
        BindingKind::Exchange => Binding::exchange(broker.clone()),
        BindingKind::Log => Binding::log(broker.clone()),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Point {
    x: i32,
    y: i32,
}

fn router() -> Router {
    Router::builder()
        .route("echo", json_handler(|value: Value| async move { Ok::<_, anyhow::Error>(value) }))
        .route(
            "sum",
            json_handler(|numbers: Vec<i64>| async move {
                Ok::<_, anyhow::Error>(numbers.iter().sum::<i64>())
            }),
        )
        .route(
            "mirror",
            json_handler(|p: Point| async move { Ok::<_, anyhow::Error>(Point { x: p.y, y: p.x }) }),
        )
        .route(
            "body_len",
            handler_fn(|request: Request| async move {
                Ok::<_, HandlerError>(json!(request.body().len()))
            }),
        )
        .route(
            "fail",
            json_handler(|_: Value| async move {
                Err::<Value, _>(anyhow::anyhow!("ledger row 42 is locked"))
            }),
        )
        .route(
            "boom",
            handler_fn(|_request: Request| async move {
                if true {
                    panic!("handler exploded");
                }
                Ok::<_, HandlerError>(Value::Null)
            }),
        )
        .build()
}

async fn start_server(broker: &MemoryBroker, kind: BindingKind, router: Router) -> Server {
    let config = ServerConfig::new(connection().group_id("calc-servers"));
    let server = Server::new(binding(broker, kind), config, REQUESTS, router)
        .await
        .unwrap();
    server.start();
    server
}

async fn connect_client(broker: &MemoryBroker, kind: BindingKind) -> Client {
    let config = ClientConfig::new(connection()).call_timeout(Duration::from_secs(2));
    Client::connect(binding(broker, kind), config, REQUESTS, REPLIES)
        .await
        .unwrap()
}

async fn pair(kind: BindingKind) -> (MemoryBroker, Server, Client) {
    let broker = MemoryBroker::new();
    let server = start_server(&broker, kind, router()).await;
    let client = connect_client(&broker, kind).await;
    (broker, server, client)
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

async fn echo_round_trip(kind: BindingKind) {
    let (_broker, server, client) = pair(kind).await;

    let payload = json!({"id": 7, "tags": ["a", "b"], "nested": {"ok": true}});
    let echoed: Value = client.remote_call("echo", Some(&payload)).await.unwrap();
    assert_eq!(echoed, payload);
    assert_eq!(client.pending_calls(), 0);

    client.shutdown().await.unwrap();
    server.shutdown().await.unwrap();
}

/// Echo returns the request unchanged over the exchange binding
#[tokio::test]
async fn test_echo_round_trip_exchange() {
    echo_round_trip(BindingKind::Exchange).await;
}

/// Echo returns the request unchanged over the log binding
#[tokio::test]
async fn test_echo_round_trip_log() {
    echo_round_trip(BindingKind::Log).await;
}

/// Typed requests and responses decode on both ends
#[tokio::test]
async fn test_typed_handlers() {
    for kind in [BindingKind::Exchange, BindingKind::Log] {
        let (_broker, server, client) = pair(kind).await;

        let total: i64 = client.remote_call("sum", Some(&vec![1, 2, 3, 4])).await.unwrap();
        assert_eq!(total, 10);

        let mirrored: Point = client
            .remote_call("mirror", Some(&Point { x: 1, y: 2 }))
            .await
            .unwrap();
        assert_eq!(mirrored, Point { x: 2, y: 1 });

        client.shutdown().await.unwrap();
        server.shutdown().await.unwrap();
    }
}

/// A call without a payload sends an empty body
#[tokio::test]
async fn test_no_request_sends_empty_body() {
    let (_broker, _server, client) = pair(BindingKind::Exchange).await;

    let len: usize = client.remote_call::<Value, _>("body_len", None).await.unwrap();
    assert_eq!(len, 0);

    let len: usize = client.remote_call("body_len", Some("abc")).await.unwrap();
    assert_eq!(len, 5);
}

/// Unknown handler names come back as BadHandler
#[tokio::test]
async fn test_unknown_handler() {
    for kind in [BindingKind::Exchange, BindingKind::Log] {
        let (_broker, _server, client) = pair(kind).await;

        let result = client.remote_call::<Value, Value>("nope", Some(&json!(1))).await;
        assert!(matches!(result, Err(RpcError::BadHandler)));
        assert_eq!(client.pending_calls(), 0);
    }
}

/// A server with an empty router answers every call with BadHandler
#[tokio::test]
async fn test_empty_router() {
    let broker = MemoryBroker::new();
    let _server = start_server(&broker, BindingKind::Log, Router::empty()).await;
    let client = connect_client(&broker, BindingKind::Log).await;

    for handler in ["echo", "sum"] {
        let result = client.remote_call::<Value, Value>(handler, None).await;
        assert!(matches!(result, Err(RpcError::BadHandler)));
    }
}

/// An empty handler name fails before anything is published
#[tokio::test]
async fn test_empty_handler_name_fails_fast() {
    let (broker, _server, client) = pair(BindingKind::Exchange).await;
    let acked_before = broker.acked_count();

    let result = client.remote_call::<Value, Value>("", Some(&json!(1))).await;
    assert!(matches!(result, Err(RpcError::BadHandler)));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.acked_count(), acked_before);
}

/// Handler errors surface as InternalServer without leaking the handler's message
#[tokio::test]
async fn test_handler_error_isolation() {
    for kind in [BindingKind::Exchange, BindingKind::Log] {
        let (_broker, _server, client) = pair(kind).await;

        let err = client
            .remote_call::<Value, Value>("fail", Some(&json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::InternalServer));
        assert!(!err.to_string().contains("ledger"));
    }
}

/// A panicking handler is answered with InternalServer and the server keeps serving
#[tokio::test]
async fn test_panicking_handler() {
    let (_broker, _server, client) = pair(BindingKind::Exchange).await;

    let result = client.remote_call::<Value, Value>("boom", None).await;
    assert!(matches!(result, Err(RpcError::InternalServer)));

    let echoed: String = client.remote_call("echo", Some("still alive")).await.unwrap();
    assert_eq!(echoed, "still alive");
}

/// A reply that does not fit the response type is a decode error
#[tokio::test]
async fn test_response_decode_error() {
    let (_broker, _server, client) = pair(BindingKind::Log).await;

    let result = client.remote_call::<_, u32>("echo", Some("not a number")).await;
    assert!(matches!(result, Err(RpcError::Decode(_))));
}

/// Concurrent calls each get their own reply
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_calls_do_not_cross_deliver() {
    for kind in [BindingKind::Exchange, BindingKind::Log] {
        let (_broker, server, client) = pair(kind).await;

        let mut handles = vec![];
        for i in 0..200 {
            let client = client.clone();
            handles.push(tokio::spawn(async move {
                let payload = json!({"call": i});
                let echoed: Value = client.remote_call("echo", Some(&payload)).await.unwrap();
                assert_eq!(echoed, payload);
                i
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            seen.insert(handle.await.unwrap());
        }
        assert_eq!(seen.len(), 200);
        assert_eq!(client.pending_calls(), 0);

        client.shutdown().await.unwrap();
        server.shutdown().await.unwrap();
    }
}

/// Several clients share one reply exchange; each only sees its own results
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_clients_sharing_reply_destination() {
    for kind in [BindingKind::Exchange, BindingKind::Log] {
        let broker = MemoryBroker::new();
        let _server = start_server(&broker, kind, router()).await;

        let mut handles = vec![];
        for c in 0..4 {
            let client = connect_client(&broker, kind).await;
            handles.push(tokio::spawn(async move {
                for i in 0..25 {
                    let total: i64 = client.remote_call("sum", Some(&vec![c, i])).await.unwrap();
                    assert_eq!(total, c + i);
                }
                client.shutdown().await.unwrap();
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }
    }
}

/// With concurrent dispatch enabled, slow handlers overlap
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_dispatch_overlaps_handlers() {
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let router = {
        let running = running.clone();
        let peak = peak.clone();
        Router::builder()
            .route(
                "slow",
                handler_fn(move |_request: Request| {
                    let running = running.clone();
                    let peak = peak.clone();
                    async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, HandlerError>(Value::Null)
                    }
                }),
            )
            .build()
    };

    let broker = MemoryBroker::new();
    let config = ServerConfig::new(connection()).max_concurrent_handlers(4);
    let server = Server::new(binding(&broker, BindingKind::Exchange), config, REQUESTS, router)
        .await
        .unwrap();
    server.start();
    let client = connect_client(&broker, BindingKind::Exchange).await;

    let started = Instant::now();
    let mut handles = vec![];
    for _ in 0..4 {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            client.remote_call::<Value, Value>("slow", None).await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }

    assert!(started.elapsed() < Duration::from_millis(700));
    assert!(peak.load(Ordering::SeqCst) > 1);
    assert!(peak.load(Ordering::SeqCst) <= 4);
}

/// Serial dispatch runs one handler at a time
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_serial_dispatch_runs_one_handler_at_a_time() {
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let router = {
        let running = running.clone();
        let peak = peak.clone();
        Router::builder()
            .route(
                "slow",
                handler_fn(move |_request: Request| {
                    let running = running.clone();
                    let peak = peak.clone();
                    async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, HandlerError>(Value::Null)
                    }
                }),
            )
            .build()
    };

    let broker = MemoryBroker::new();
    let _server = start_server(&broker, BindingKind::Log, router).await;
    let client = connect_client(&broker, BindingKind::Log).await;

    let mut handles = vec![];
    for _ in 0..5 {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            client.remote_call::<Value, Value>("slow", None).await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }

    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

/// A logged-binding server without a consumer group is rejected at construction
#[tokio::test]
async fn test_log_server_requires_group() {
    let broker = MemoryBroker::new();
    let result = Server::new(
        Binding::log(broker.clone()),
        ServerConfig::new(connection()),
        REQUESTS,
        router(),
    )
    .await;

    assert!(matches!(result, Err(RpcError::Config(_))));
    assert_eq!(broker.dial_count(), 0);
}

/// An empty consumer group counts as no group at all
#[tokio::test]
async fn test_log_server_rejects_empty_group() {
    let broker = MemoryBroker::new();
    let result = Server::new(
        Binding::log(broker.clone()),
        ServerConfig::new(connection().group_id("")),
        REQUESTS,
        router(),
    )
    .await;

    assert!(matches!(result, Err(RpcError::Config(_))));
    assert_eq!(broker.dial_count(), 0);
}

/// A log client with an empty group gets a generated one and still sees its replies
#[tokio::test]
async fn test_log_client_with_empty_group() {
    let broker = MemoryBroker::new();
    let _server = start_server(&broker, BindingKind::Log, router()).await;
    let config = ClientConfig::new(connection().group_id(""));
    let client = Client::connect(Binding::log(broker.clone()), config, REQUESTS, REPLIES)
        .await
        .unwrap();

    let echoed: Value = client.remote_call("echo", Some(&json!("grouped"))).await.unwrap();
    assert_eq!(echoed, json!("grouped"));
}

/// With two servers on one fanout exchange the first reply wins
#[tokio::test]
async fn test_duplicate_replies_first_wins() {
    let broker = MemoryBroker::new();
    let first = start_server(&broker, BindingKind::Exchange, router()).await;
    let second = start_server(&broker, BindingKind::Exchange, router()).await;
    let client = connect_client(&broker, BindingKind::Exchange).await;

    for i in 0..5 {
        let total: i64 = client.remote_call("sum", Some(&vec![i, 10])).await.unwrap();
        assert_eq!(total, i + 10);
        assert_eq!(client.pending_calls(), 0);
    }

    // the late duplicate of the last call is dropped without disturbing the next one
    tokio::time::sleep(Duration::from_millis(50)).await;
    let echoed: Value = client.remote_call("echo", Some(&json!("single"))).await.unwrap();
    assert_eq!(echoed, json!("single"));

    // two request deliveries and two reply deliveries per call
    assert!(eventually(|| broker.acked_count() == 6 * 4).await);

    first.shutdown().await.unwrap();
    second.shutdown().await.unwrap();
}

/// A reply with a status code the client does not know surfaces as UnknownStatus
#[tokio::test]
async fn test_unknown_status_over_the_wire() {
    use futures::StreamExt;
    use rpcbus::envelope::{self, header, Status};
    use rpcbus::transport::LogTransport;
    use rpcbus::OffsetReset;

    let broker = MemoryBroker::new();
    let responder = LogTransport::dial(&broker, &connection()).await.unwrap();
    let mut requests = responder
        .subscribe(REQUESTS, "impostors", OffsetReset::Latest)
        .await
        .unwrap();
    let client = connect_client(&broker, BindingKind::Log).await;

    let answer = tokio::spawn(async move {
        let mut delivery = requests.next().await.unwrap().unwrap();
        delivery.ack().unwrap();
        let request = envelope::decode_request(BindingKind::Log, delivery.message).unwrap();

        let mut reply = envelope::encode_response(
            BindingKind::Log,
            &request.correlation_id,
            Status::Success,
            b"1".to_vec(),
        );
        reply.headers.insert(header::STATUS.to_string(), "moved".to_string());
        responder.produce(&request.reply_to, reply).await.unwrap();
    });

    let result = client.remote_call::<Value, Value>("echo", Some(&json!(1))).await;
    match result {
        Err(RpcError::UnknownStatus(status)) => assert_eq!(status, "moved"),
        other => panic!("expected UnknownStatus, got {:?}", other.map(|_| ())),
    }
    assert_eq!(client.pending_calls(), 0);
    answer.await.unwrap();
}

/// Empty destinations are rejected
#[tokio::test]
async fn test_client_requires_destinations() {
    let broker = MemoryBroker::new();
    let result = Client::connect(
        Binding::exchange(broker),
        ClientConfig::new(connection()),
        REQUESTS,
        "",
    )
    .await;

    assert!(matches!(result, Err(RpcError::Config(_))));
}

/// Both sides acknowledge every exchange delivery
#[tokio::test]
async fn test_exchange_deliveries_are_acked() {
    let (broker, _server, client) = pair(BindingKind::Exchange).await;

    for i in 0..3 {
        let _: Value = client.remote_call("echo", Some(&json!(i))).await.unwrap();
    }

    // one request ack on the server, one reply ack on the client, per call
    assert_eq!(broker.acked_count(), 6);
}

/// Requests missing routing headers are dropped without a reply
#[tokio::test]
async fn test_malformed_request_discarded() {
    use rpcbus::transport::ExchangeTransport;

    let (broker, _server, client) = pair(BindingKind::Exchange).await;

    let raw = ExchangeTransport::dial(&broker, &connection()).await.unwrap();
    let mut headers = BTreeMap::new();
    headers.insert("type".to_string(), "echo".to_string());
    headers.insert("correlation_id".to_string(), "orphan".to_string());
    raw.publish(
        REQUESTS,
        Message {
            key: None,
            headers,
            body: b"1".to_vec(),
        },
    )
    .await
    .unwrap();

    let echoed: Value = client.remote_call("echo", Some(&json!("after"))).await.unwrap();
    assert_eq!(echoed, json!("after"));
    assert_eq!(broker.acked_count(), 3);
}

/// Shutdown is idempotent and later calls fail with ConnectionClosed
#[tokio::test]
async fn test_shutdown_idempotent() {
    let (broker, server, client) = pair(BindingKind::Log).await;

    assert!(client.shutdown().await.is_ok());
    assert!(client.shutdown().await.is_ok());
    assert!(server.shutdown().await.is_ok());
    assert!(server.shutdown().await.is_ok());

    let result = client.remote_call::<Value, Value>("echo", Some(&json!(1))).await;
    assert!(matches!(result, Err(RpcError::ConnectionClosed)));
    assert_eq!(broker.live_sessions(), 0);
}

/// The notification receiver is handed out once and closes on shutdown
#[tokio::test]
async fn test_notify_closes_on_shutdown() {
    let (_broker, server, client) = pair(BindingKind::Exchange).await;

    let mut client_errors = client.notify().unwrap();
    assert!(client.notify().is_none());
    let mut server_errors = server.notify().unwrap();

    client.shutdown().await.unwrap();
    server.shutdown().await.unwrap();

    assert!(client_errors.recv().await.is_none());
    assert!(server_errors.recv().await.is_none());
}

/// Starting a server twice is harmless
#[tokio::test]
async fn test_start_twice() {
    let (_broker, server, client) = pair(BindingKind::Exchange).await;
    server.start();

    let total: i64 = client.remote_call("sum", Some(&vec![2, 2])).await.unwrap();
    assert_eq!(total, 4);
}

/// Publishing to a reply destination nobody declared is logged, not fatal
#[tokio::test]
async fn test_reply_to_unknown_exchange_is_survivable() {
    use rpcbus::transport::ExchangeTransport;

    let (broker, _server, client) = pair(BindingKind::Exchange).await;

    let raw = ExchangeTransport::dial(&broker, &connection()).await.unwrap();
    let mut headers = BTreeMap::new();
    headers.insert("type".to_string(), "echo".to_string());
    headers.insert("correlation_id".to_string(), "c-x".to_string());
    headers.insert("reply_to".to_string(), "nobody.listens".to_string());
    raw.publish(REQUESTS, Message { key: None, headers, body: b"1".to_vec() })
        .await
        .unwrap();

    assert_eq!(
        raw.publish("nobody.listens", Message::default()).await,
        Err(TransportError::Publish("no exchange 'nobody.listens'".to_string()))
    );

    let echoed: Value = client.remote_call("echo", Some(&json!(2))).await.unwrap();
    assert_eq!(echoed, json!(2));
}
