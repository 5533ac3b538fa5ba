//! Shared helpers for the integration tests.
#![allow(dead_code)]

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use arena_presence::config::PresenceConfig;
use arena_presence::state::AppState;

pub const CONTROL_TOKEN: &str = "test-secret";

pub type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
pub type WsSink = SplitSink<WsStream, Message>;
pub type WsRead = SplitStream<WsStream>;

/// Start the server on a random port and return (base_url, addr).
pub async fn start_test_server() -> (String, SocketAddr) {
    let state = AppState::spawn(
        &PresenceConfig::default(),
        Some(CONTROL_TOKEN.to_string()),
        CancellationToken::new(),
    );
    let app = arena_presence::routes::build_router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    (format!("http://{}", addr), addr)
}

/// Open a raw WebSocket and consume the `connected` greeting.
pub async fn ws_connect(addr: SocketAddr) -> (WsSink, WsRead) {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
        .await
        .expect("WebSocket connect");
    let (sink, mut read) = ws.split();
    let greeting = next_event(&mut read, "connected").await;
    assert!(greeting["data"]["connection_id"].is_string());
    (sink, read)
}

pub async fn send(sink: &mut WsSink, event: &str, data: Value) {
    let frame = json!({ "event": event, "data": data }).to_string();
    sink.send(Message::Text(frame.into())).await.unwrap();
}

/// Read frames until one with the given event name arrives (2s limit).
pub async fn next_event(read: &mut WsRead, event: &str) -> Value {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let frame = tokio::time::timeout_at(deadline, read.next())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for `{event}`"));
        match frame {
            Some(Ok(Message::Text(text))) => {
                let value: Value = serde_json::from_str(text.as_str()).unwrap();
                if value["event"] == event {
                    return value;
                }
            }
            Some(Ok(_)) => continue,
            other => panic!("socket ended while waiting for `{event}`: {other:?}"),
        }
    }
}

/// Collect every event with the given name that arrives within `window`.
pub async fn collect_events(read: &mut WsRead, event: &str, window: Duration) -> Vec<Value> {
    let deadline = tokio::time::Instant::now() + window;
    let mut found = Vec::new();
    while let Ok(Some(Ok(frame))) = tokio::time::timeout_at(deadline, read.next()).await {
        if let Message::Text(text) = frame {
            let value: Value = serde_json::from_str(text.as_str()).unwrap();
            if value["event"] == event {
                found.push(value);
            }
        }
    }
    found
}

pub async fn control(base_url: &str, body: Value) -> reqwest::StatusCode {
    reqwest::Client::new()
        .post(format!("{}/control", base_url))
        .json(&body)
        .send()
        .await
        .unwrap()
        .status()
}

/// Retry `check` every 20ms for up to 2s.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached within 2s");
}

pub async fn get_json(url: &str) -> (reqwest::StatusCode, Value) {
    let resp = reqwest::get(url).await.unwrap();
    let status = resp.status();
    let body = resp.json::<Value>().await.unwrap_or(Value::Null);
    (status, body)
}
