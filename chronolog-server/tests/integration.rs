//! End-to-end tests over real WebSocket connections.
//!
//! Each test binds a server to an ephemeral port and talks to it with a raw
//! tokio-tungstenite client.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use chronolog_server::protocol::{QueryResponse, QueryUserResponse};
use chronolog_server::server::BoxError;
use chronolog_server::{Server, ServerConfig, ServerStats};
use chronolog_store::{CollectionPattern, CollectionRouter, Record, RouterConfig, SystemClock};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tempfile::tempdir;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

const SECRET: &str = "test-secret";

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    addr: SocketAddr,
    server: Arc<Server>,
    router: Arc<CollectionRouter>,
    stop: Option<oneshot::Sender<()>>,
    handle: JoinHandle<Result<(), BoxError>>,
}

impl TestServer {
    fn url(&self) -> String {
        format!("ws://{}/", self.addr)
    }

    async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            stop.send(()).unwrap();
        }
        timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }
}

fn router_config(patterns: &[&str], root: Option<&Path>) -> RouterConfig {
    RouterConfig {
        storage_root: root.map(Path::to_path_buf),
        patterns: patterns
            .iter()
            .map(|p| p.parse::<CollectionPattern>().unwrap())
            .collect(),
    }
}

async fn start_server(
    patterns: &[&str],
    root: Option<&Path>,
    storage_interval: Option<Duration>,
) -> TestServer {
    let router = Arc::new(
        CollectionRouter::open(router_config(patterns, root), Arc::new(SystemClock)).unwrap(),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = ServerConfig {
        bind_addr: addr.to_string(),
        secret_key: SECRET.to_string(),
        storage_interval,
    };
    let server = Arc::new(Server::new(config, router.clone()));
    let (stop, stop_rx) = oneshot::channel::<()>();
    let running = server.clone();
    let handle = tokio::spawn(async move {
        running
            .serve(listener, async move {
                let _ = stop_rx.await;
            })
            .await
    });
    TestServer {
        addr,
        server,
        router,
        stop: Some(stop),
        handle,
    }
}

async fn connect(server: &TestServer) -> Client {
    let (ws, _) = tokio_tungstenite::connect_async(server.url()).await.unwrap();
    ws
}

async fn send(ws: &mut Client, id: &str, msg_type: &str, data: String) {
    let frame = json!({ "id": id, "type": msg_type, "data": data }).to_string();
    ws.send(Message::Text(frame.into())).await.unwrap();
}

async fn recv_text(ws: &mut Client) -> String {
    match timeout(Duration::from_secs(2), ws.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => text.as_str().to_string(),
        other => panic!("expected a text frame, got {other:?}"),
    }
}

/// The server must close without replying.
async fn expect_closed(ws: &mut Client) {
    match timeout(Duration::from_secs(2), ws.next()).await {
        Ok(Some(Ok(Message::Close(_)))) | Ok(None) | Ok(Some(Err(_))) => {}
        other => panic!("expected the connection to close, got {other:?}"),
    }
}

async fn authenticate(ws: &mut Client) {
    send(ws, "auth", "api-key", SECRET.to_string()).await;
    assert_eq!(recv_text(ws).await, r#"{"id":"auth"}"#);
}

async fn insert(ws: &mut Client, id: &str, items: serde_json::Value) {
    send(ws, id, "insert", items.to_string()).await;
    assert_eq!(recv_text(ws).await, format!(r#"{{"id":"{id}"}}"#));
}

async fn query(ws: &mut Client, id: &str, ts: i64, collection: &str) -> QueryResponse {
    let data = json!({ "ts": ts, "collection": collection }).to_string();
    send(ws, id, "query", data).await;
    serde_json::from_str(&recv_text(ws).await).unwrap()
}

#[tokio::test]
async fn test_insert_then_query_latest() {
    let server = start_server(&["public:60"], None, None).await;
    let mut ws = connect(&server).await;
    authenticate(&mut ws).await;

    insert(
        &mut ws,
        "1",
        json!([{ "ts": 1, "uid": "u", "data": "x", "collection": "public" }]),
    )
    .await;

    let resp = query(&mut ws, "2", 5, "public").await;
    assert_eq!(resp.id, "2");
    assert_eq!(resp.records.len(), 1);
    assert_eq!(resp.records["u"], Record::new(1, "x"));

    server.shutdown().await;
}

#[tokio::test]
async fn test_query_user_range() {
    let server = start_server(&["public:60"], None, None).await;
    let mut ws = connect(&server).await;
    authenticate(&mut ws).await;

    let items: Vec<_> = (1..=15)
        .map(|ts| json!({ "ts": ts, "uid": "u", "data": format!("v{ts}"), "collection": "public" }))
        .collect();
    insert(&mut ws, "1", serde_json::Value::Array(items)).await;

    let data = json!({ "uid": "u", "from": 5, "to": 10, "collection": "public" }).to_string();
    send(&mut ws, "2", "query-user", data).await;
    let resp: QueryUserResponse = serde_json::from_str(&recv_text(&mut ws).await).unwrap();
    let ts: Vec<i64> = resp.records.iter().map(|r| r.ts).collect();
    assert_eq!(resp.id, "2");
    assert_eq!(ts, vec![5, 6, 7, 8, 9, 10]);

    server.shutdown().await;
}

#[tokio::test]
async fn test_wildcard_collections() {
    let server = start_server(&["events.*:10"], None, None).await;
    let mut ws = connect(&server).await;
    authenticate(&mut ws).await;

    insert(
        &mut ws,
        "1",
        json!([{ "ts": 1, "uid": "u", "data": "x", "collection": "events.login" }]),
    )
    .await;
    let store = server.router.get("events.login").unwrap();
    assert_eq!(store.ttl(), Duration::from_secs(600));

    let resp = query(&mut ws, "2", 5, "events.login").await;
    assert_eq!(resp.records["u"], Record::new(1, "x"));

    // `events` itself is not registered
    let data = json!({ "ts": 5, "collection": "events" }).to_string();
    send(&mut ws, "3", "query", data).await;
    expect_closed(&mut ws).await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_no_response_before_api_key() {
    let server = start_server(&["public:60"], None, None).await;
    let mut ws = connect(&server).await;

    let data = json!({ "ts": 5, "collection": "public" }).to_string();
    send(&mut ws, "1", "query", data).await;
    expect_closed(&mut ws).await;

    let stats = server_stats_eventually(&server, |s| s.rejected_connections == 1).await;
    assert_eq!(stats.total_connections, 1);
    server.shutdown().await;
}

#[tokio::test]
async fn test_wrong_api_key_closes() {
    let server = start_server(&["public:60"], None, None).await;
    let mut ws = connect(&server).await;

    send(&mut ws, "auth", "api-key", "not-the-secret".to_string()).await;
    expect_closed(&mut ws).await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_unknown_path_is_404() {
    let server = start_server(&["public:60"], None, None).await;
    let url = format!("ws://{}/elsewhere", server.addr);

    match tokio_tungstenite::connect_async(url).await {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 404),
        Err(e) => panic!("expected a 404, got {e}"),
        Ok(_) => panic!("expected a 404, but the upgrade succeeded"),
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_missing_field_closes_and_inserts_nothing() {
    let server = start_server(&["public:60"], None, None).await;
    let mut ws = connect(&server).await;
    authenticate(&mut ws).await;

    let items = json!([
        { "ts": 1, "uid": "u", "data": "x", "collection": "public" },
        { "ts": 2, "uid": "u", "collection": "public" }
    ]);
    send(&mut ws, "1", "insert", items.to_string()).await;
    expect_closed(&mut ws).await;

    let store = server.router.resolve("public").unwrap();
    assert_eq!(store.record_count(), 0);

    // A fresh connection works normally
    let mut ws = connect(&server).await;
    authenticate(&mut ws).await;
    assert!(query(&mut ws, "2", 5, "public").await.records.is_empty());

    server.shutdown().await;
}

#[tokio::test]
async fn test_delete_user() {
    let server = start_server(&["public:60", "private:60"], None, None).await;
    let mut ws = connect(&server).await;
    authenticate(&mut ws).await;

    insert(
        &mut ws,
        "1",
        json!([
            { "ts": 1, "uid": "u", "data": "a", "collection": "public" },
            { "ts": 1, "uid": "u", "data": "b", "collection": "private" },
            { "ts": 1, "uid": "v", "data": "c", "collection": "public" }
        ]),
    )
    .await;

    send(&mut ws, "2", "delete-user", json!({ "uid": "u" }).to_string()).await;
    assert_eq!(recv_text(&mut ws).await, r#"{"id":"2"}"#);

    let public = query(&mut ws, "3", 5, "public").await;
    assert_eq!(public.records.keys().collect::<Vec<_>>(), vec!["v"]);
    assert!(query(&mut ws, "4", 5, "private").await.records.is_empty());

    server.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_clients() {
    let server = start_server(&["public:60"], None, None).await;

    let mut tasks = Vec::new();
    for n in 0..8 {
        let url = server.url();
        tasks.push(tokio::spawn(async move {
            let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
            authenticate(&mut ws).await;
            let items: Vec<_> = (0..25)
                .map(|ts| {
                    let uid = format!("user-{n}");
                    json!({ "ts": ts, "uid": uid, "data": "x", "collection": "public" })
                })
                .collect();
            insert(&mut ws, "1", serde_json::Value::Array(items)).await;
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let store = server.router.get("public").unwrap();
    assert_eq!(store.user_count(), 8);
    assert_eq!(store.record_count(), 200);

    server.shutdown().await;
}

#[tokio::test]
async fn test_flush_ticker_survives_restart() {
    let dir = tempdir().unwrap();
    let server = start_server(&["public:60"], Some(dir.path()), Some(Duration::from_secs(1))).await;
    let mut ws = connect(&server).await;
    authenticate(&mut ws).await;

    insert(
        &mut ws,
        "1",
        json!([
            { "ts": 1, "uid": "a", "data": "one", "collection": "public" },
            { "ts": 2, "uid": "b", "data": "two", "collection": "public" },
            { "ts": 3, "uid": "c", "data": "three", "collection": "public" }
        ]),
    )
    .await;
    tokio::time::sleep(Duration::from_millis(2500)).await;

    // The ticker has flushed; a second router on the same root sees the data
    let config = router_config(&["public:60"], Some(dir.path()));
    let reopened = CollectionRouter::open(config, Arc::new(SystemClock)).unwrap();
    let latest = reopened.get("public").unwrap().all_latest(i64::MAX);
    assert_eq!(latest.len(), 3);
    assert_eq!(latest["c"], Record::new(3, "three"));

    server.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_flushes_pending_records() {
    let dir = tempdir().unwrap();
    let server =
        start_server(&["public:60"], Some(dir.path()), Some(Duration::from_secs(3600))).await;
    let mut ws = connect(&server).await;
    authenticate(&mut ws).await;

    insert(
        &mut ws,
        "1",
        json!([{ "ts": 42, "uid": "u", "data": "pending", "collection": "public" }]),
    )
    .await;

    let router = server.router.clone();
    server.shutdown().await;
    expect_closed(&mut ws).await;
    assert!(router.get("public").unwrap().is_closed());

    let config = router_config(&["public:60"], Some(dir.path()));
    let reopened = CollectionRouter::open(config, Arc::new(SystemClock)).unwrap();
    let store = reopened.get("public").unwrap();
    assert_eq!(store.latest_for_user("u", i64::MAX), Some(Record::new(42, "pending")));
}

/// Poll the counters until `done` holds; connection tasks update them
/// after the client has already seen the close.
async fn server_stats_eventually(
    server: &TestServer,
    done: impl Fn(&ServerStats) -> bool,
) -> ServerStats {
    for _ in 0..100 {
        let stats = server.server.stats();
        if done(&stats) {
            return stats;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("stats never settled: {:?}", server.server.stats());
}
