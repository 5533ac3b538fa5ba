//! Integration tests for the persistent transport: registration, rooms,
//! fan-out and the freeze control frame.

mod common;

use serde_json::json;
use std::time::Duration;

use common::{collect_events, get_json, next_event, send, start_test_server, ws_connect, CONTROL_TOKEN};

#[tokio::test]
async fn test_register_updates_presence_count() {
    let (base_url, addr) = start_test_server().await;

    let (mut alice, mut alice_rx) = ws_connect(addr).await;
    send(&mut alice, "register", json!({"display_name": "alice", "tab_id": "t1"})).await;
    let count = next_event(&mut alice_rx, "presence_count").await;
    assert_eq!(count["data"]["count"], 1);

    let (mut anon, mut anon_rx) = ws_connect(addr).await;
    send(&mut anon, "register", json!({})).await;
    let count = next_event(&mut anon_rx, "presence_count").await;
    assert_eq!(count["data"]["count"], 2);
    let count = next_event(&mut alice_rx, "presence_count").await;
    assert_eq!(count["data"]["count"], 2);

    let (status, body) = get_json(&format!("{}/presence/count", base_url)).await;
    assert_eq!(status, 200);
    assert_eq!(body["count"], 2);

    // Closing alice's only socket takes her offline.
    drop(alice);
    drop(alice_rx);
    let count = next_event(&mut anon_rx, "presence_count").await;
    assert_eq!(count["data"]["count"], 1);
}

#[tokio::test]
async fn test_second_tab_does_not_change_count() {
    let (_base_url, addr) = start_test_server().await;

    let (mut tab1, mut tab1_rx) = ws_connect(addr).await;
    send(&mut tab1, "register", json!({"display_name": "alice", "tab_id": "t1"})).await;
    next_event(&mut tab1_rx, "presence_count").await;

    let (mut tab2, mut tab2_rx) = ws_connect(addr).await;
    send(&mut tab2, "register", json!({"display_name": "alice", "tab_id": "t2"})).await;
    let count = next_event(&mut tab2_rx, "presence_count").await;
    assert_eq!(count["data"]["count"], 1);

    let extra = collect_events(&mut tab1_rx, "presence_count", Duration::from_millis(200)).await;
    assert!(extra.is_empty());
}

#[tokio::test]
async fn test_team_update_reaches_only_team_members() {
    let (base_url, addr) = start_test_server().await;

    let mut members = Vec::new();
    for team in ["T1", "T1", "T2"] {
        let (mut sink, mut read) = ws_connect(addr).await;
        send(&mut sink, "register", json!({})).await;
        send(&mut sink, "join_team_room", json!({"team_id": team})).await;
        let replay = next_event(&mut read, "recent_team_updates").await;
        assert_eq!(replay["data"]["room_id"], team);
        members.push((sink, read));
    }

    let (status, body) = get_json(&format!("{}/room/team/T1/count", base_url)).await;
    assert_eq!(status, 200);
    assert_eq!(body["count"], 2);

    let (publisher, _) = &mut members[0];
    send(
        publisher,
        "team_update",
        json!({"team_id": "T1", "action": "points_update", "points": 100}),
    )
    .await;

    for (_, read) in members.iter_mut().take(2) {
        let update = next_event(read, "team_update").await;
        assert_eq!(update["data"]["points"], 100);
        assert!(update["data"]["broadcast_id"].is_string());
        assert!(update["data"]["timestamp"].is_string());
    }
    let (_, outsider) = &mut members[2];
    assert!(collect_events(outsider, "team_update", Duration::from_millis(300))
        .await
        .is_empty());
}

#[tokio::test]
async fn test_late_joiner_receives_recent_points() {
    let (_base_url, addr) = start_test_server().await;

    let (mut first, mut first_rx) = ws_connect(addr).await;
    send(&mut first, "join_team_room", json!({"team_id": "T1"})).await;
    next_event(&mut first_rx, "recent_team_updates").await;
    for points in [10, 20] {
        send(
            &mut first,
            "team_update",
            json!({"team_id": "T1", "action": "points_update", "points": points}),
        )
        .await;
        next_event(&mut first_rx, "team_update").await;
    }

    let (mut late, mut late_rx) = ws_connect(addr).await;
    send(&mut late, "join_team_room", json!({"team_id": "T1"})).await;
    let replay = next_event(&mut late_rx, "recent_team_updates").await;
    let events = replay["data"]["events"].as_array().unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0]["points"], 10);
    assert_eq!(events[1]["points"], 20);
}

#[tokio::test]
async fn test_freeze_control_then_system_state() {
    let (_base_url, addr) = start_test_server().await;

    let (mut admin, mut admin_rx) = ws_connect(addr).await;
    send(&mut admin, "register", json!({"display_name": "admin"})).await;
    next_event(&mut admin_rx, "presence_count").await;
    send(
        &mut admin,
        "admin_freeze_control",
        json!({"token": CONTROL_TOKEN, "frozen": true}),
    )
    .await;
    let freeze = next_event(&mut admin_rx, "system_freeze").await;
    assert_eq!(freeze["data"]["frozen"], true);
    assert!(freeze["data"]["timestamp"].is_string());

    // A connection opened after the transition asks for the state.
    let (mut late, mut late_rx) = ws_connect(addr).await;
    send(&mut late, "get_system_state", json!({})).await;
    let state = next_event(&mut late_rx, "system_state").await;
    assert_eq!(state["data"]["frozen"], true);
    assert_eq!(state["data"]["global_frozen"], true);
    assert_eq!(state["data"]["enabled"], true);
}

#[tokio::test]
async fn test_unauthorized_freeze_control_is_ignored() {
    let (_base_url, addr) = start_test_server().await;

    let (mut sink, mut read) = ws_connect(addr).await;
    send(&mut sink, "register", json!({})).await;
    send(
        &mut sink,
        "admin_freeze_control",
        json!({"token": "guess", "frozen": true}),
    )
    .await;
    send(&mut sink, "get_system_state", json!({})).await;

    let state = next_event(&mut read, "system_state").await;
    assert_eq!(state["data"]["frozen"], false);
}

#[tokio::test]
async fn test_malformed_frames_keep_connection_open() {
    let (_base_url, addr) = start_test_server().await;

    let (mut sink, mut read) = ws_connect(addr).await;
    sink_raw(&mut sink, "not json at all").await;
    send(&mut sink, "join_challenge_room", json!({})).await;
    send(&mut sink, "self_destruct", json!({})).await;
    send(&mut sink, "register", json!({"display_name": "bob"})).await;

    let count = next_event(&mut read, "presence_count").await;
    assert_eq!(count["data"]["count"], 1);
}

async fn sink_raw(sink: &mut common::WsSink, text: &str) {
    use futures_util::SinkExt;
    sink.send(tokio_tungstenite::tungstenite::Message::Text(text.into()))
        .await
        .unwrap();
}
