//! `HttpEndpoint` against a scripted in-process HTTP server.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chainrelay_core::{ClientPool, Endpoint, JsonRpcRequest, PoolConfig, RetryConfig, Tier, TransportError};
use chainrelay_http::{HttpEndpoint, HttpEndpointConfig};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Serves one scripted `(status, body)` per connection, repeating the last
/// entry once the script runs out. `{id}` in a body is replaced with the
/// request's id.
struct ScriptedServer {
    url: String,
    hits: Arc<AtomicUsize>,
}

async fn serve(script: Vec<(u16, &'static str)>) -> ScriptedServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let n = counter.fetch_add(1, Ordering::SeqCst);
            let (status, body) = script[n.min(script.len() - 1)];
            tokio::spawn(async move {
                let request = read_request(&mut socket).await;
                let id = serde_json::from_str::<Value>(&request)
                    .ok()
                    .and_then(|v| v.get("id").cloned())
                    .unwrap_or(Value::Null);
                let body = body.replace("{id}", &id.to_string());
                let reason = if status == 200 { "OK" } else { "ERR" };
                let response = format!(
                    "HTTP/1.1 {status} {reason}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    ScriptedServer { url, hits }
}

/// Read one HTTP request and return its body.
async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = socket.read(&mut chunk).await.unwrap_or(0);
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        let text = String::from_utf8_lossy(&buf);
        if let Some(split) = text.find("\r\n\r\n") {
            let content_length = text[..split]
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse::<usize>().ok())
                        .flatten()
                })
                .unwrap_or(0);
            if buf.len() >= split + 4 + content_length {
                return String::from_utf8_lossy(&buf[split + 4..split + 4 + content_length]).into_owned();
            }
        }
    }
    String::new()
}

fn fast_config(max_retries: u32) -> HttpEndpointConfig {
    HttpEndpointConfig {
        request_timeout: Duration::from_secs(5),
        max_retries,
        retry: RetryConfig {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            multiplier: 2.0,
        },
        ..HttpEndpointConfig::default()
    }
}

#[tokio::test]
async fn call_deserializes_result() {
    let server = serve(vec![(200, r#"{"jsonrpc":"2.0","id":{id},"result":{"height":"42"}}"#)]).await;
    let ep = HttpEndpoint::new(&server.url, fast_config(0)).unwrap();

    let result: Value = ep.call("status", json!({})).await.unwrap();
    assert_eq!(result["height"], "42");
    assert_eq!(server.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn node_error_is_not_retried() {
    let server = serve(vec![(
        200,
        r#"{"jsonrpc":"2.0","id":{id},"error":{"code":-32601,"message":"method not found"}}"#,
    )])
    .await;
    let ep = HttpEndpoint::new(&server.url, fast_config(3)).unwrap();

    let err = ep.call::<Value>("nope", Value::Null).await.unwrap_err();
    match err {
        TransportError::Rpc(rpc) => assert_eq!(rpc.code, -32601),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(server.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn transient_failures_are_retried_then_succeed() {
    let server = serve(vec![
        (502, "bad gateway"),
        (503, "unavailable"),
        (200, r#"{"jsonrpc":"2.0","id":{id},"result":"ok"}"#),
    ])
    .await;
    let ep = HttpEndpoint::new(&server.url, fast_config(2)).unwrap();

    let result: String = ep.call("status", Value::Null).await.unwrap();
    assert_eq!(result, "ok");
    assert_eq!(server.hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn retry_budget_is_bounded() {
    let server = serve(vec![(503, "unavailable")]).await;
    let ep = HttpEndpoint::new(&server.url, fast_config(1)).unwrap();

    let err = ep.call::<Value>("status", Value::Null).await.unwrap_err();
    assert!(matches!(err, TransportError::Http(ref msg) if msg.contains("503")));
    assert_eq!(server.hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn status_429_surfaces_as_rate_limit() {
    let server = serve(vec![(429, "too many requests")]).await;
    let ep = HttpEndpoint::new(&server.url, fast_config(0)).unwrap();

    let err = ep.call::<Value>("status", Value::Null).await.unwrap_err();
    assert!(err.is_rate_limited());
}

#[tokio::test]
async fn batch_responses_follow_request_order() {
    let server = serve(vec![(
        200,
        r#"[{"jsonrpc":"2.0","id":2,"result":"second"},{"jsonrpc":"2.0","id":1,"result":"first"}]"#,
    )])
    .await;
    let ep = HttpEndpoint::new(&server.url, fast_config(0)).unwrap();

    let responses = ep
        .send_batch(vec![
            JsonRpcRequest::new(1, "a", vec![]),
            JsonRpcRequest::new(2, "b", vec![]),
        ])
        .await
        .unwrap();
    let results: Vec<Value> = responses.into_iter().map(|r| r.into_result().unwrap()).collect();
    assert_eq!(results, vec![json!("first"), json!("second")]);
    assert!(ep.send_batch(vec![]).await.unwrap().is_empty());
}

#[tokio::test]
async fn health_check_reports_failures() {
    let healthy = serve(vec![(200, r#"{"jsonrpc":"2.0","id":{id},"result":{}}"#)]).await;
    let broken = serve(vec![(500, "boom")]).await;

    let ok = HttpEndpoint::new(&healthy.url, fast_config(2)).unwrap();
    ok.health_check().await.unwrap();

    let bad = HttpEndpoint::new(&broken.url, fast_config(2)).unwrap();
    let err = bad.health_check().await.unwrap_err();
    assert!(matches!(err, TransportError::HealthCheck { .. }));
    // Probes are never retried at the transport level.
    assert_eq!(broken.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn pool_fails_over_between_http_endpoints() {
    let down = serve(vec![(500, "down")]).await;
    let up = serve(vec![(200, r#"{"jsonrpc":"2.0","id":{id},"result":"up"}"#)]).await;

    let endpoints = vec![
        Arc::new(HttpEndpoint::new(&down.url, fast_config(0)).unwrap()),
        Arc::new(HttpEndpoint::new(&up.url, fast_config(0)).unwrap()),
    ];
    let pool = ClientPool::new(endpoints, PoolConfig::default()).unwrap();

    for _ in 0..3 {
        let out: String = pool
            .execute("status", |ep| async move { ep.call("status", Value::Null).await })
            .await
            .unwrap();
        assert_eq!(out, "up");
    }
    assert!(down.hits.load(Ordering::SeqCst) <= 1);
    assert_eq!(pool.tier_of(&up.url), Some(Tier::Active));
}
