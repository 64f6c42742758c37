//! End-to-end tests for the connection protocol engine (C6), driving a
//! real `Connection` over an in-memory duplex transport instead of a TCP
//! socket, matching §8's scenario list (simple GET, pipelined pair,
//! request body, graceful shutdown).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use gasket::proto::h1::conn::{Connection, ConnectionConfig};
use gasket::{Application, BoxFuture, RequestEvent, ResponseEvent, Scope};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn test_app_state() -> gasket::AppState {
    Arc::new(RwLock::new(serde_json::Map::new()))
}

fn test_config(app: Arc<dyn Application>) -> ConnectionConfig {
    ConnectionConfig {
        scheme: "http",
        client: ("127.0.0.1".to_string(), 1),
        server: ("127.0.0.1".to_string(), 2),
        root_path: Arc::from(""),
        app_state: test_app_state(),
        app,
        access_log: true,
    }
}

/// Responds `200 OK` with a body of `path` after draining any request body.
fn echo_path_app() -> Arc<dyn Application> {
    let f = |scope: Scope, mut receive: gasket::Receiver<'_>, mut send: gasket::Sender<'_>| -> BoxFuture<'_, Result<(), String>> {
        Box::pin(async move {
            let env = match scope {
                Scope::Http(env) => env,
                Scope::Lifespan(_) => return Ok(()),
            };
            loop {
                match receive().await {
                    RequestEvent::Http { more_body: false, .. } => break,
                    RequestEvent::Http { .. } => continue,
                    _ => break,
                }
            }
            let body = Bytes::from(env.path.clone().into_bytes());
            send(ResponseEvent::Start { status: 200, headers: vec![] }).await;
            send(ResponseEvent::Body { body, more_body: false }).await;
            Ok(())
        })
    };
    Arc::new(f)
}

/// Responds with the request body echoed back verbatim.
fn echo_body_app() -> Arc<dyn Application> {
    let f = |scope: Scope, mut receive: gasket::Receiver<'_>, mut send: gasket::Sender<'_>| -> BoxFuture<'_, Result<(), String>> {
        Box::pin(async move {
            if !matches!(scope, Scope::Http(_)) {
                return Ok(());
            }
            let mut collected = Vec::new();
            loop {
                match receive().await {
                    RequestEvent::Http { body, more_body } => {
                        if let Some(b) = body {
                            collected.extend_from_slice(&b);
                        }
                        if !more_body {
                            break;
                        }
                    }
                    _ => break,
                }
            }
            send(ResponseEvent::Start { status: 200, headers: vec![] }).await;
            send(ResponseEvent::Body { body: Bytes::from(collected), more_body: false }).await;
            Ok(())
        })
    };
    Arc::new(f)
}

/// Reads until the connection goes quiet for a short window, rather than a
/// fixed byte count, since head and body may arrive as separate writes.
async fn read_available(stream: &mut tokio::io::DuplexStream, _at_least: usize) -> Vec<u8> {
    let mut out = Vec::new();
    let mut chunk = vec![0u8; 4096];
    loop {
        match tokio::time::timeout(std::time::Duration::from_millis(200), stream.read(&mut chunk)).await {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(n)) => out.extend_from_slice(&chunk[..n]),
            Ok(Err(e)) => panic!("read error: {e}"),
        }
    }
    out
}

#[tokio::test]
async fn simple_get_returns_200() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let (mut client, server) = tokio::io::duplex(64 * 1024);
            let (reader, writer) = tokio::io::split(server);
            let cfg = test_config(echo_path_app());
            let conn = Connection::new(reader, writer, None, cfg);
            let should_stop = Arc::new(AtomicBool::new(false));
            let handle = tokio::task::spawn_local(conn.run(should_stop.clone()));

            client.write_all(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();

            let response = read_available(&mut client, 1).await;
            let text = String::from_utf8_lossy(&response);
            assert!(text.starts_with("HTTP/1.1 200"));
            assert!(text.ends_with("/hello"));

            should_stop.store(true, Ordering::SeqCst);
            drop(client);
            let _ = handle.await;
        })
        .await;
}

#[tokio::test]
async fn pipelined_pair_responds_in_fifo_order() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let (mut client, server) = tokio::io::duplex(64 * 1024);
            let (reader, writer) = tokio::io::split(server);
            let cfg = test_config(echo_path_app());
            let conn = Connection::new(reader, writer, None, cfg);
            let should_stop = Arc::new(AtomicBool::new(false));
            let handle = tokio::task::spawn_local(conn.run(should_stop.clone()));

            client
                .write_all(b"GET /first HTTP/1.1\r\nHost: x\r\n\r\nGET /second HTTP/1.1\r\nHost: x\r\n\r\n")
                .await
                .unwrap();

            let response = read_available(&mut client, 1).await;
            let text = String::from_utf8_lossy(&response);
            let first_idx = text.find("/first").expect("first path present");
            let second_idx = text.find("/second").expect("second path present");
            assert!(first_idx < second_idx, "responses must come back in request order");

            should_stop.store(true, Ordering::SeqCst);
            drop(client);
            let _ = handle.await;
        })
        .await;
}

#[tokio::test]
async fn post_body_is_delivered_to_application() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let (mut client, server) = tokio::io::duplex(64 * 1024);
            let (reader, writer) = tokio::io::split(server);
            let cfg = test_config(echo_body_app());
            let conn = Connection::new(reader, writer, None, cfg);
            let should_stop = Arc::new(AtomicBool::new(false));
            let handle = tokio::task::spawn_local(conn.run(should_stop.clone()));

            client
                .write_all(b"POST /x HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello")
                .await
                .unwrap();

            let response = read_available(&mut client, 1).await;
            let text = String::from_utf8_lossy(&response);
            assert!(text.ends_with("hello"));

            should_stop.store(true, Ordering::SeqCst);
            drop(client);
            let _ = handle.await;
        })
        .await;
}

#[tokio::test]
async fn should_stop_ends_idle_connection() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let (client, server) = tokio::io::duplex(64 * 1024);
            let (reader, writer) = tokio::io::split(server);
            let cfg = test_config(echo_path_app());
            let conn = Connection::new(reader, writer, None, cfg);
            let should_stop = Arc::new(AtomicBool::new(true));
            let handle = tokio::task::spawn_local(conn.run(should_stop));
            drop(client);
            let result = tokio::time::timeout(std::time::Duration::from_millis(500), handle).await;
            assert!(result.is_ok(), "connection with no in-flight work must exit promptly on should_stop");
        })
        .await;
}
