//! Both client transports against a live server: same callbacks, same order.

mod common;

use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arena_presence::client::{self, ClientIdentity, Transport, TransportKind, TransportOptions};
use arena_presence::presence::RoomKey;
use arena_presence::proto::ServerMessage;
use common::{control, eventually, get_json, start_test_server, CONTROL_TOKEN};

fn fast_options() -> TransportOptions {
    TransportOptions {
        heartbeat_interval: Duration::from_millis(200),
        poll_interval: Duration::from_millis(50),
        ..TransportOptions::default()
    }
}

/// Record the broadcast ids of every `team_update` the transport delivers.
fn record_team_updates(transport: &dyn Transport) -> Arc<Mutex<Vec<String>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    transport.on(
        "team_update",
        Arc::new(move |msg: &ServerMessage| {
            if let Some(b) = msg.broadcast() {
                sink.lock().unwrap().push(b.broadcast_id.clone());
            }
        }),
    );
    seen
}

async fn room_count(base_url: &str, family: &str, id: &str) -> u64 {
    let (_, body) = get_json(&format!("{}/room/{}/{}/count", base_url, family, id)).await;
    body["count"].as_u64().unwrap_or(0)
}

#[tokio::test]
async fn test_socket_and_polling_see_identical_sequences() {
    let (base_url, _addr) = start_test_server().await;

    let socket = client::connect(
        TransportKind::Persistent,
        &base_url,
        ClientIdentity::named("alice"),
        fast_options(),
    )
    .await
    .unwrap();
    let polling = client::connect(
        TransportKind::Polling,
        &base_url,
        ClientIdentity::named("bob"),
        fast_options(),
    )
    .await
    .unwrap();
    assert_eq!(socket.kind(), TransportKind::Persistent);
    assert_eq!(polling.kind(), TransportKind::Polling);

    let via_socket = record_team_updates(socket.as_ref());
    let via_polling = record_team_updates(polling.as_ref());

    socket.join(RoomKey::team("T1")).await.unwrap();
    polling.join(RoomKey::team("T1")).await.unwrap();
    eventually(|| {
        let url = base_url.clone();
        async move { room_count(&url, "team", "T1").await == 2 }
    })
    .await;

    for n in 1..=3 {
        let publish = json!({
            "token": CONTROL_TOKEN,
            "action": "publish",
            "event": {
                "event": "team_update",
                "data": {"team_id": "T1", "action": "points_update", "points": n * 10, "broadcast_id": format!("tu-{n}")},
            },
        });
        assert_eq!(control(&base_url, publish).await, 200);
    }
    // A duplicate of an already relayed event.
    let duplicate = json!({
        "token": CONTROL_TOKEN,
        "action": "publish",
        "event": {"event": "team_update", "data": {"team_id": "T1", "action": "points_update", "broadcast_id": "tu-2"}},
    });
    control(&base_url, duplicate).await;

    eventually(|| {
        let (a, b) = (via_socket.clone(), via_polling.clone());
        async move { a.lock().unwrap().len() >= 3 && b.lock().unwrap().len() >= 3 }
    })
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let expected = vec!["tu-1".to_string(), "tu-2".to_string(), "tu-3".to_string()];
    assert_eq!(*via_socket.lock().unwrap(), expected);
    assert_eq!(*via_polling.lock().unwrap(), expected);

    socket.disconnect().await;
    polling.disconnect().await;
    eventually(|| {
        let url = base_url.clone();
        async move { room_count(&url, "team", "T1").await == 0 }
    })
    .await;
}

#[tokio::test]
async fn test_polling_transport_recovers_after_server_drop() {
    let (base_url, _addr) = start_test_server().await;

    let polling = client::connect(
        TransportKind::Polling,
        &base_url,
        ClientIdentity::named("dave"),
        fast_options(),
    )
    .await
    .unwrap();
    polling.join(RoomKey::challenge("web-1")).await.unwrap();
    eventually(|| {
        let url = base_url.clone();
        async move { room_count(&url, "challenge", "web-1").await == 1 }
    })
    .await;

    // The server forgets the connection, as the reaper would.
    let first_id = polling.connection_id().unwrap();
    reqwest::Client::new()
        .post(format!("{}/poll/{}/disconnect", base_url, first_id))
        .send()
        .await
        .unwrap();

    eventually(|| {
        let current = polling.connection_id();
        let first = first_id.clone();
        async move { current.is_some_and(|id| id != first) }
    })
    .await;
    eventually(|| {
        let url = base_url.clone();
        async move { room_count(&url, "challenge", "web-1").await == 1 }
    })
    .await;

    polling.disconnect().await;
}

#[tokio::test]
async fn test_socket_transport_counts_presence() {
    let (base_url, _addr) = start_test_server().await;

    let counts = Arc::new(Mutex::new(Vec::new()));
    let socket = client::connect(
        TransportKind::Persistent,
        &base_url,
        ClientIdentity::named("erin").with_tab("tab-1"),
        fast_options(),
    )
    .await
    .unwrap();
    let sink = counts.clone();
    socket.on(
        "presence_count",
        Arc::new(move |msg: &ServerMessage| {
            if let ServerMessage::PresenceCount { count } = msg {
                sink.lock().unwrap().push(*count);
            }
        }),
    );

    let other = client::connect(
        TransportKind::Polling,
        &base_url,
        ClientIdentity::anonymous(),
        fast_options(),
    )
    .await
    .unwrap();

    eventually(|| {
        let counts = counts.clone();
        async move { counts.lock().unwrap().last() == Some(&2) }
    })
    .await;

    other.disconnect().await;
    eventually(|| {
        let counts = counts.clone();
        async move { counts.lock().unwrap().last() == Some(&1) }
    })
    .await;
    socket.disconnect().await;
}
