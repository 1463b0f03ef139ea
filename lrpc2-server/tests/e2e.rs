//! End-to-end tests driving a real listener over a unix socket with the
//! production client.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lrpc2_client::client::ClientSession;
use lrpc2_client::config::Timeouts as ClientTimeouts;
use lrpc2_proto::{ProtocolError, Value, LRPC2_MAX_MSG_LEN, LRPC2_NACK};
use lrpc2_server::config::Timeouts as ServerTimeouts;
use lrpc2_server::context::SessionContext;
use lrpc2_server::server::{CommandHandler, HandlerFuture, SessionServer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

const MSG_ECHO: u16 = 100;
const MSG_ASYNC: u16 = 102;
const MSG_SLEEP: u16 = 103;

fn endpoint(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("lrpc2-e2e-{}-{}.sock", name, std::process::id()))
}

fn echo(_ctx: &mut SessionContext, args: Vec<Value>) -> HandlerFuture<'_> {
    Box::pin(async move { Some(args) })
}

fn sleep_millis(_ctx: &mut SessionContext, args: Vec<Value>) -> HandlerFuture<'_> {
    Box::pin(async move {
        let millis = args.first().and_then(Value::as_u32).unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(u64::from(millis))).await;
        Some(vec![Value::Uint32(millis)])
    })
}

struct CountingHandler {
    count: Arc<AtomicU32>,
}

impl CommandHandler for CountingHandler {
    fn handle<'a>(&'a self, _ctx: &'a mut SessionContext, _args: Vec<Value>) -> HandlerFuture<'a> {
        Box::pin(async move {
            self.count.fetch_add(1, Ordering::SeqCst);
            None
        })
    }
}

fn start_server(path: &PathBuf) -> (SessionServer, Arc<AtomicU32>) {
    let count = Arc::new(AtomicU32::new(0));
    let mut server = SessionServer::new(path, ServerTimeouts::default());
    server.register(MSG_ECHO, echo).unwrap();
    server.register(MSG_SLEEP, sleep_millis).unwrap();
    server
        .register(
            MSG_ASYNC,
            CountingHandler {
                count: Arc::clone(&count),
            },
        )
        .unwrap();
    server.start().unwrap();
    (server, count)
}

async fn connect(path: &PathBuf) -> ClientSession {
    let mut session = ClientSession::new(path, ClientTimeouts::default());
    session.connect().await.unwrap();
    session
}

async fn shutdown(server: SessionServer, path: &PathBuf) {
    server.stop();
    server.wait().await;
    let _ = std::fs::remove_file(path);
}

#[tokio::test]
async fn test_echo_roundtrip() {
    let path = endpoint("echo");
    let (server, _) = start_server(&path);

    let mut session = connect(&path).await;

    let args = vec![
        Value::Uint32(12345),
        Value::Bool(true),
        Value::Str("test string".to_string()),
        Value::Int32(-3456),
    ];
    let results = session.do_request(u32::from(MSG_ECHO), &args).await.unwrap();
    assert_eq!(results, args);

    // Same connection serves further requests.
    let results = session.do_request(u32::from(MSG_ECHO), &[]).await.unwrap();
    assert!(results.is_empty());

    session.close().await.unwrap();
    shutdown(server, &path).await;
}

#[tokio::test]
async fn test_echo_null_and_collections() {
    let path = endpoint("collections");
    let (server, _) = start_server(&path);

    let mut session = connect(&path).await;

    let mut map = HashMap::new();
    map.insert("user".to_string(), "root".to_string());
    map.insert("shell".to_string(), "/bin/sh".to_string());

    let args = vec![
        Value::Null,
        Value::Blob(vec![0u8, 1, 2, 255]),
        Value::StringSet(vec!["a".to_string(), "b".to_string()]),
        Value::StringMap(map),
    ];
    let results = session.do_request(u32::from(MSG_ECHO), &args).await.unwrap();
    assert_eq!(results, args);

    session.close().await.unwrap();
    shutdown(server, &path).await;
}

#[tokio::test]
async fn test_unknown_message_id_closes_connection() {
    let path = endpoint("unknown-id");
    let (server, _) = start_server(&path);

    let mut session = connect(&path).await;
    let result = session.do_request(999, &[]).await;
    assert!(matches!(result, Err(ProtocolError::Io(_))));

    // Only the offending connection is torn down.
    let mut session = connect(&path).await;
    let results = session
        .do_request(u32::from(MSG_ECHO), &[Value::Bool(false)])
        .await
        .unwrap();
    assert_eq!(results, vec![Value::Bool(false)]);

    session.close().await.unwrap();
    shutdown(server, &path).await;
}

#[tokio::test]
async fn test_unsupported_version_nacked() {
    let path = endpoint("bad-version");
    let (server, _) = start_server(&path);

    let mut raw = UnixStream::connect(&path).await.unwrap();
    raw.write_all(&3u32.to_le_bytes()).await.unwrap();

    let mut reply = [0u8; 8];
    raw.read_exact(&mut reply).await.unwrap();
    let answer = u32::from_le_bytes(reply[..4].try_into().unwrap());
    assert_eq!(answer, LRPC2_NACK);
    drop(raw);

    // A well-versioned client is still served.
    let mut session = connect(&path).await;
    let results = session
        .do_request(u32::from(MSG_ECHO), &[Value::Uint32(1)])
        .await
        .unwrap();
    assert_eq!(results, vec![Value::Uint32(1)]);

    session.close().await.unwrap();
    shutdown(server, &path).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_do_not_serialize() {
    let path = endpoint("concurrent");
    let (server, _) = start_server(&path);

    let started = Instant::now();
    let mut tasks = Vec::new();
    for millis in [300u32, 200, 100] {
        let path = path.clone();
        tasks.push(tokio::spawn(async move {
            let mut session = connect(&path).await;
            let results = session
                .do_request(u32::from(MSG_SLEEP), &[Value::Uint32(millis)])
                .await
                .unwrap();
            assert_eq!(results, vec![Value::Uint32(millis)]);
            session.close().await.unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(300), "elapsed {:?}", elapsed);
    // Far less than the 600ms a serialized server would need.
    assert!(elapsed < Duration::from_millis(550), "elapsed {:?}", elapsed);

    shutdown(server, &path).await;
}

#[tokio::test]
async fn test_oversized_request_rejected_locally() {
    let path = endpoint("oversized");
    let (server, _) = start_server(&path);

    let mut session = connect(&path).await;

    let blob = vec![0u8; LRPC2_MAX_MSG_LEN as usize + 1];
    let result = session
        .do_request(u32::from(MSG_ECHO), &[Value::Blob(blob)])
        .await;
    assert!(matches!(result, Err(ProtocolError::MsgTooLong(_, _))));

    // Nothing hit the wire; the connection is still usable.
    let results = session
        .do_request(u32::from(MSG_ECHO), &[Value::Str("still here".to_string())])
        .await
        .unwrap();
    assert_eq!(results, vec![Value::Str("still here".to_string())]);

    session.close().await.unwrap();
    shutdown(server, &path).await;
}

#[tokio::test]
async fn test_async_request_writes_no_reply() {
    let path = endpoint("async");
    let (server, count) = start_server(&path);

    let mut session = connect(&path).await;

    session
        .do_async_request(u32::from(MSG_ASYNC), &[])
        .await
        .unwrap();

    // Requests on one connection are handled in order, so by the time the
    // echo reply arrives the async handler has run.
    let results = session
        .do_request(u32::from(MSG_ECHO), &[Value::Uint32(9)])
        .await
        .unwrap();
    assert_eq!(results, vec![Value::Uint32(9)]);
    assert_eq!(count.load(Ordering::SeqCst), 1);

    session.close().await.unwrap();
    shutdown(server, &path).await;
}

#[tokio::test]
async fn test_shutdown_stops_accepting() {
    let path = endpoint("shutdown");
    let (server, _) = start_server(&path);

    let mut session = connect(&path).await;
    session.do_request(u32::from(MSG_ECHO), &[]).await.unwrap();
    session.close().await.unwrap();

    server.stop();
    server.wait().await;

    let mut session = ClientSession::new(&path, ClientTimeouts::default());
    assert!(session.connect().await.is_err());

    let _ = std::fs::remove_file(&path);
}
