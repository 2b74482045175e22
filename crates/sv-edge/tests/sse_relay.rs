//! SSE relay behavior against a scripted upstream: bytes are piped through
//! verbatim with the event-stream headers, and an upstream failure
//! mid-stream surfaces as a final error frame instead of a torn body.

use axum::http::{HeaderMap, Method};
use bytes::Bytes;
use sv_edge::proxy::ProxyClient;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Upstream that writes SSE headers plus `frames`, then optionally lies
/// about content length so the relayed stream errors mid-flight.
async fn spawn_upstream(frames: Vec<&'static str>, truncate: bool) -> std::net::SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 2048];
        let _ = socket.read(&mut buf).await;

        let body: String = frames.concat();
        let advertised = if truncate { body.len() + 512 } else { body.len() };
        let head = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\n\
             Content-Length: {advertised}\r\n\r\n"
        );
        let _ = socket.write_all(head.as_bytes()).await;
        let _ = socket.write_all(body.as_bytes()).await;
        // Dropping the socket here cuts the advertised body short when
        // `truncate` is set.
    });
    addr
}

#[tokio::test]
async fn relay_pipes_frames_and_sets_stream_headers() {
    let addr = spawn_upstream(
        vec!["data: {\"type\":\"token\",\"text\":\"hi\"}\n\n", "data: [DONE]\n\n"],
        false,
    )
    .await;

    let proxy = ProxyClient::new();
    let response = proxy
        .forward_sse(
            Method::POST,
            &format!("http://{addr}/api/assistant/chat"),
            &HeaderMap::new(),
            Bytes::from_static(b"{\"message\":\"hello\"}"),
            None,
        )
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "text/event-stream"
    );
    assert_eq!(
        response.headers()["cache-control"].to_str().unwrap(),
        "no-cache"
    );
    assert_eq!(
        response.headers()["x-accel-buffering"].to_str().unwrap(),
        "no"
    );

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("\"text\":\"hi\""));
    assert!(text.contains("[DONE]"));
}

#[tokio::test]
async fn truncated_upstream_yields_final_error_frame() {
    let addr = spawn_upstream(vec!["data: {\"type\":\"token\",\"text\":\"partial\"}\n\n"], true).await;

    let proxy = ProxyClient::new();
    let response = proxy
        .forward_sse(
            Method::POST,
            &format!("http://{addr}/api/assistant/chat"),
            &HeaderMap::new(),
            Bytes::new(),
            None,
        )
        .await
        .unwrap();

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();

    // The bytes that made it through are preserved, and the stream closes
    // with a typed error frame rather than a silent truncation.
    assert!(text.contains("partial"));
    assert!(text.contains("\"type\":\"error\""));
}
