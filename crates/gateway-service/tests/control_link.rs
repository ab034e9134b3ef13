//! Integration tests for the control link and the hub.
//!
//! A full gateway runs against a [`FakeDialer`]: the test plays the control
//! server on the socket end of each dial.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]

use common::types::ObserverId;
use gateway_service::actors::{HubStatus, Observer};
use gateway_service::storage::{REG_TOKEN_KEY, ROOM_TOKEN_KEY};
use gateway_service::wire::{LocalCommand, LocalCommandKind, ServerCommand, Status};
use gateway_service::Gateway;
use gateway_test_utils::*;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;

async fn hub_status(gateway: &Gateway) -> HubStatus {
    gateway.hub.status().await.unwrap()
}

async fn wait_for_status(gateway: &Gateway, expected: Status) {
    let result =
        assert_eventually(move || async move { hub_status(gateway).await.status == expected })
            .await;
    assert!(result.is_ok(), "hub never reached {expected}");
}

/// Body of a `one:ResponseToMany:<to>:<json>` frame.
fn reply_body(frame: &str, to: u64) -> Value {
    let prefix = format!("one:ResponseToMany:{to}:");
    let body = frame
        .strip_prefix(&prefix)
        .unwrap_or_else(|| panic!("not a reply to {to}: {frame}"));
    serde_json::from_str(body).unwrap()
}

fn local(kind: LocalCommandKind, content: Value) -> LocalCommand {
    LocalCommand { kind, content }
}

/// Start a gateway and complete the login handshake.
async fn ready_gateway(harness: &TestContext) -> (Gateway, FakeSocket) {
    let gateway = harness.start().await;
    let mut server = harness.dialer.next_socket().await.expect("gateway dials");

    let login = server.recv_frame().await.expect("login frame");
    assert_eq!(login, format!("one:Login:{TEST_ROOM_TOKEN}"));

    server.send_frame(r#"{"name":"LoginOk"}"#).await;
    wait_for_status(&gateway, Status::Ready).await;
    (gateway, server)
}

// ============================================================================
// Connection state machine
// ============================================================================

#[tokio::test]
async fn test_login_then_device_list() {
    let harness = TestContext::new(
        MemoryStore::new().with_device(camera("cam1")),
        MockConductor::new(),
    );
    let (gateway, mut server) = ready_gateway(&harness).await;
    assert_eq!(server.url, "ws://server.test/one/ctrl");

    let frame = server
        .recv_until(|frame| frame.starts_with("one:Ipcams:"))
        .await
        .expect("device list pushed after login");
    let list: Value = serde_json::from_str(frame.strip_prefix("one:Ipcams:").unwrap()).unwrap();
    assert_eq!(list[0]["Id"], "cam1");
    assert!(list[0].get("Url").is_none());

    let status = hub_status(&gateway).await;
    assert!(status.has_control_link);
    assert!(harness.ctx.health.is_ready());

    gateway.stop(Duration::from_secs(5)).await;
    assert!(server.closed_by_gateway().await);
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_server_is_retried_after_fixed_delay() {
    let harness = TestContext::new(MemoryStore::new(), MockConductor::new());
    harness.dialer.refuse(true);
    let gateway = harness.start().await;

    let dialer = std::sync::Arc::clone(&harness.dialer);
    wait_until("first attempt", || dialer.attempts() == 1).await;
    wait_for_status(&gateway, Status::Unreachable).await;

    tokio::time::advance(Duration::from_secs(8)).await;
    assert_eq!(harness.dialer.attempts(), 1);

    tokio::time::advance(Duration::from_secs(3)).await;
    wait_until("second attempt", || dialer.attempts() == 2).await;

    harness.dialer.refuse(false);
    tokio::time::advance(Duration::from_secs(11)).await;
    let server = harness.dialer.next_socket().await;
    assert!(server.is_some());

    gateway.stop(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_local_connect_cuts_retry_delay_short() {
    let harness = TestContext::new(MemoryStore::new(), MockConductor::new());
    harness.dialer.refuse(true);
    let gateway = harness.start().await;
    wait_for_status(&gateway, Status::Unreachable).await;

    gateway
        .hub
        .local_command(ObserverId::new(), local(LocalCommandKind::DoConnect, Value::Null))
        .await
        .unwrap();

    let dialer = std::sync::Arc::clone(&harness.dialer);
    wait_until("retried without waiting", || dialer.attempts() >= 2).await;
    gateway.stop(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_malformed_room_token_is_rejected_locally() {
    let harness = TestContext::new(
        MemoryStore::new().with_scalar(ROOM_TOKEN_KEY, "not-a-token"),
        MockConductor::new(),
    );
    let gateway = harness.start().await;
    let mut server = harness.dialer.next_socket().await.unwrap();

    assert!(server.closed_by_gateway().await);
    wait_for_status(&gateway, Status::BadRoomToken).await;
    assert!(server.drain().is_empty());

    gateway.stop(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_stored_room_token_wins_over_seed() {
    let harness = TestContext::new(
        MemoryStore::new().with_scalar(ROOM_TOKEN_KEY, "stored.room.token"),
        MockConductor::new(),
    );
    let gateway = harness.start().await;
    let mut server = harness.dialer.next_socket().await.unwrap();

    assert_eq!(server.recv_frame().await.unwrap(), "one:Login:stored.room.token");
    gateway.stop(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_login_rejected_by_server() {
    let harness = TestContext::new(MemoryStore::new(), MockConductor::new());
    let gateway = harness.start().await;
    let mut server = harness.dialer.next_socket().await.unwrap();
    server.recv_frame().await.unwrap();

    server.send_frame(r#"{"name":"LoginAddrError"}"#).await;
    wait_for_status(&gateway, Status::AuthFailed).await;
    assert!(server.closed_by_gateway().await);
    assert!(!hub_status(&gateway).await.has_control_link);

    gateway.stop(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_relogin_rejected_after_room_token_change() {
    let harness = TestContext::new(MemoryStore::new(), MockConductor::new());
    let (gateway, mut server) = ready_gateway(&harness).await;

    server
        .send_frame(r#"{"name":"SetRoomToken","content":"new.room.token"}"#)
        .await;
    server
        .recv_until(|frame| frame.starts_with("one:Login:"))
        .await
        .unwrap();

    server.send_frame(r#"{"name":"LoginAddrError"}"#).await;
    wait_for_status(&gateway, Status::AuthFailed).await;
    assert!(server.closed_by_gateway().await);

    let gateway_ref = &gateway;
    let result =
        assert_eventually(move || async move { !hub_status(gateway_ref).await.has_control_link })
            .await;
    assert!(result.is_ok());

    // The closed reader must not overwrite the rejection
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(hub_status(&gateway).await.status, Status::AuthFailed);
    assert_eq!(harness.ctx.health.status(), Status::AuthFailed);

    gateway.stop(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_bad_server_message_drops_link() {
    let harness = TestContext::new(MemoryStore::new(), MockConductor::new());
    let gateway = harness.start().await;
    let mut server = harness.dialer.next_socket().await.unwrap();
    server.recv_frame().await.unwrap();

    server.send_frame("one:what").await;
    wait_for_status(&gateway, Status::BadServerMsg).await;
    assert!(server.closed_by_gateway().await);

    gateway.stop(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_server_hang_up_clears_link() {
    let harness = TestContext::new(MemoryStore::new(), MockConductor::new());
    let (gateway, mut server) = ready_gateway(&harness).await;

    server.hang_up();
    wait_for_status(&gateway, Status::Disconnected).await;

    let gateway_ref = &gateway;
    let result =
        assert_eventually(move || async move { !hub_status(gateway_ref).await.has_control_link })
            .await;
    assert!(result.is_ok());
    assert!(!harness.ctx.health.is_ready());

    gateway.stop(Duration::from_secs(5)).await;
}

// ============================================================================
// Server commands
// ============================================================================

#[tokio::test]
async fn test_manage_get_replies_to_requester() {
    let harness = TestContext::new(
        MemoryStore::new().with_device(camera("cam1")),
        MockConductor::new(),
    );
    let (gateway, mut server) = ready_gateway(&harness).await;

    server
        .send_frame(r#"{"from":7,"name":"ManageGetIpcam","content":"cam1"}"#)
        .await;
    let frame = server
        .recv_until(|frame| frame.starts_with("one:ResponseToMany:7:"))
        .await
        .unwrap();
    let body = reply_body(&frame, 7);
    assert_eq!(body["type"], "Response");
    assert_eq!(body["content"]["type"], "ManageGetIpcam");
    assert_eq!(body["content"]["content"]["Id"], "cam1");

    server
        .send_frame(r#"{"from":7,"name":"ManageGetIpcam","content":"ghost"}"#)
        .await;
    let frame = server
        .recv_until(|frame| frame.starts_with("one:ResponseToMany:7:"))
        .await
        .unwrap();
    assert_eq!(
        reply_body(&frame, 7),
        json!({"type": "Info", "content": "Camera not found: ghost"})
    );

    gateway.stop(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_manage_set_creates_device() {
    let harness = TestContext::new(
        MemoryStore::new(),
        MockConductor::new().with_report("cam2", online_report()),
    );
    let (gateway, mut server) = ready_gateway(&harness).await;

    server
        .send_frame(
            r#"{"from":3,"name":"ManageSetIpcam","content":{"Id":"cam2","Url":"rtsp://10.0.0.2/"}}"#,
        )
        .await;
    let frame = server
        .recv_until(|frame| frame.starts_with("one:ResponseToMany:3:"))
        .await
        .unwrap();
    let body = reply_body(&frame, 3);
    assert_eq!(body["content"]["type"], "ManageSetIpcam");
    assert_eq!(body["content"]["content"]["Id"], "cam2");
    assert_eq!(body["content"]["content"]["Online"], true);

    assert!(harness.store.device("cam2").is_some());
    assert!(gateway.directory.contains("cam2"));

    server
        .send_frame(r#"{"from":3,"name":"ManageSetIpcam","content":"{broken"}"#)
        .await;
    let frame = server
        .recv_until(|frame| frame.starts_with("one:ResponseToMany:3:"))
        .await
        .unwrap();
    assert_eq!(reply_body(&frame, 3)["content"], "Cannot parse camera");

    gateway.stop(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_rename_announces_id_change() {
    let harness = TestContext::new(
        MemoryStore::new().with_device(camera("cam1")),
        MockConductor::new(),
    );
    let (gateway, mut server) = ready_gateway(&harness).await;

    server
        .send_frame(
            r#"{"from":3,"name":"ManageSetIpcam","content":{"target":"cam1","Id":"lobby","Url":"rtsp://10.0.0.1/"}}"#,
        )
        .await;
    let frame = server
        .recv_until(|frame| frame.starts_with("one:IpcamIdChanged:"))
        .await
        .unwrap();
    let body: Value =
        serde_json::from_str(frame.strip_prefix("one:IpcamIdChanged:").unwrap()).unwrap();
    assert_eq!(body, json!({"old": "cam1", "new": "lobby"}));

    assert_eq!(gateway.directory.ids(), vec!["lobby".to_string()]);
    gateway.stop(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_manage_delete_replies_and_pushes_list() {
    let harness = TestContext::new(
        MemoryStore::new().with_device(camera("cam1")),
        MockConductor::new(),
    );
    let (gateway, mut server) = ready_gateway(&harness).await;
    server
        .recv_until(|frame| frame.starts_with("one:Ipcams:"))
        .await
        .unwrap();

    server
        .send_frame(r#"{"from":4,"name":"ManageDelIpcam","content":"cam1"}"#)
        .await;
    let frame = server
        .recv_until(|frame| frame.starts_with("one:ResponseToMany:4:"))
        .await
        .unwrap();
    assert_eq!(reply_body(&frame, 4)["content"], "Camera removed: cam1");

    let frame = server
        .recv_until(|frame| frame.starts_with("one:Ipcams:"))
        .await
        .unwrap();
    assert_eq!(frame, "one:Ipcams:[]");

    gateway.stop(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_viewer_joined_gets_ids() {
    let harness = TestContext::new(
        MemoryStore::new()
            .with_device(camera("cam1"))
            .with_device(camera("cam2")),
        MockConductor::new(),
    );
    let (gateway, mut server) = ready_gateway(&harness).await;

    server.send_frame(r#"{"from":9,"name":"UserOnline"}"#).await;
    let frame = server
        .recv_until(|frame| frame.starts_with("one:ResponseToMany:9:"))
        .await
        .unwrap();
    let body = reply_body(&frame, 9);
    assert_eq!(body["content"]["type"], "Ids");
    assert_eq!(body["content"]["content"], json!(["cam1", "cam2"]));

    gateway.stop(Duration::from_secs(5)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_viewer_joined_burst_larger_than_link_queue() {
    let ids: Vec<String> = (0..80).map(|n| format!("cam{n:02}")).collect();
    let mut store = MemoryStore::new();
    let mut conductor = MockConductor::new();
    for id in &ids {
        store = store.with_device(camera(id));
        conductor = conductor.with_report(id, online_report());
    }
    let harness = TestContext::new(store, conductor);
    let (gateway, mut server) = ready_gateway(&harness).await;

    // Keep the link drained until every camera is online
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        server.drain();
        let snapshot = gateway.directory.snapshot_all().await;
        if snapshot.len() == ids.len() && snapshot.iter().all(|record| record.online) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "cameras never came online");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    server.drain();

    // Let the whole burst queue up before reading any of it
    server.send_frame(r#"{"from":9,"name":"UserOnline"}"#).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut replies = 0;
    while replies < ids.len() + 1 {
        server
            .recv_until(|frame| frame.starts_with("one:ResponseToMany:9:"))
            .await
            .expect("every viewer reply arrives");
        replies += 1;
    }
    assert!(!server.is_closed_by_gateway());
    assert!(hub_status(&gateway).await.has_control_link);

    gateway.stop(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_set_room_token_stores_and_logs_in_again() {
    let harness = TestContext::new(MemoryStore::new(), MockConductor::new());
    let (gateway, mut server) = ready_gateway(&harness).await;

    server
        .send_frame(r#"{"name":"SetRoomToken","content":"new.room.token"}"#)
        .await;
    let frame = server
        .recv_until(|frame| frame.starts_with("one:Login:"))
        .await
        .unwrap();
    assert_eq!(frame, "one:Login:new.room.token");
    assert_eq!(
        harness.store.scalar(ROOM_TOKEN_KEY).as_deref(),
        Some("new.room.token")
    );
    wait_for_status(&gateway, Status::LoggingIn).await;

    gateway.stop(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_set_room_token_storage_failure() {
    let harness = TestContext::new(MemoryStore::new(), MockConductor::new());
    let (gateway, server) = ready_gateway(&harness).await;
    harness.store.fail_scalars(true);

    server
        .send_frame(r#"{"name":"SetRoomToken","content":"new.room.token"}"#)
        .await;
    wait_for_status(&gateway, Status::SaveRoomTokenError).await;

    gateway.stop(Duration::from_secs(5)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_hub_stays_responsive_under_device_request_flood() {
    let harness = TestContext::new(
        MemoryStore::new().with_device(camera("cam1")),
        MockConductor::new(),
    );
    // No control link: replies are dropped instead of queueing on a socket
    harness.dialer.refuse(true);
    let gateway = harness.start().await;

    let command =
        ServerCommand::parse(r#"{"from":7,"name":"ManageGetIpcam","content":"cam1"}"#).unwrap();
    let senders: Vec<_> = (0..8)
        .map(|_| {
            let hub = gateway.hub.clone();
            let command = command.clone();
            tokio::spawn(async move {
                for _ in 0..400 {
                    hub.server_command(command.clone()).await.unwrap();
                }
            })
        })
        .collect();
    for sender in senders {
        tokio::time::timeout(Duration::from_secs(10), sender)
            .await
            .expect("hub kept draining its mailbox")
            .unwrap();
    }

    let status = tokio::time::timeout(Duration::from_secs(10), gateway.hub.status())
        .await
        .expect("hub answered after the flood")
        .unwrap();
    assert_eq!(status.device_count, 1);

    gateway.stop(Duration::from_secs(5)).await;
}

// ============================================================================
// Local observers
// ============================================================================

#[tokio::test]
async fn test_observer_receives_status_changes() {
    let harness = TestContext::new(MemoryStore::new(), MockConductor::new());
    harness.dialer.refuse(true);
    let gateway = harness.start().await;

    let (tx, mut rx) = mpsc::channel(16);
    let id = ObserverId::new();
    gateway
        .hub
        .add_observer(Observer { id, sender: tx })
        .await
        .unwrap();
    gateway
        .hub
        .local_command(id, local(LocalCommandKind::GetStatus, Value::Null))
        .await
        .unwrap();

    let frame = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    let status: Value = serde_json::from_str(&frame).unwrap();
    assert_eq!(status["type"], "Status");

    gateway.stop(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_slow_observer_is_evicted() {
    let harness = TestContext::new(MemoryStore::new(), MockConductor::new());
    harness.dialer.refuse(true);
    let gateway = harness.start().await;
    wait_for_status(&gateway, Status::Unreachable).await;

    let (tx, _rx) = mpsc::channel(1);
    gateway
        .hub
        .add_observer(Observer {
            id: ObserverId::new(),
            sender: tx,
        })
        .await
        .unwrap();
    assert_eq!(hub_status(&gateway).await.observer_count, 1);

    for payload in ["one", "two", "three"] {
        gateway
            .hub
            .change_no_status(payload.to_string())
            .await
            .unwrap();
    }
    assert_eq!(hub_status(&gateway).await.observer_count, 0);

    gateway.stop(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_recording_toggle_reaches_observers() {
    let harness = TestContext::new(
        MemoryStore::new().with_device(camera("cam1")),
        MockConductor::new(),
    );
    harness.dialer.refuse(true);
    let gateway = harness.start().await;

    let (tx, mut rx) = mpsc::channel(16);
    let id = ObserverId::new();
    gateway
        .hub
        .add_observer(Observer { id, sender: tx })
        .await
        .unwrap();
    gateway
        .hub
        .local_command(id, local(LocalCommandKind::SetRecOn, json!("cam1")))
        .await
        .unwrap();

    let notice = loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        if value["type"] == "Rec" {
            break value;
        }
    };
    assert_eq!(notice["camera"]["Id"], "cam1");
    assert_eq!(notice["camera"]["Rec"], true);
    assert_eq!(notice["ids"], json!(["cam1"]));

    gateway.stop(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_local_exit_cancels_shutdown() {
    let harness = TestContext::new(MemoryStore::new(), MockConductor::new());
    harness.dialer.refuse(true);
    let gateway = harness.start().await;

    gateway
        .hub
        .local_command(ObserverId::new(), local(LocalCommandKind::Exit, Value::Null))
        .await
        .unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), gateway.shutdown.cancelled()).await;
    assert!(result.is_ok());
    gateway.stop(Duration::from_secs(5)).await;
}

// ============================================================================
// Room registration
// ============================================================================

/// Attach an observer and return its queue.
async fn observe(gateway: &Gateway) -> (ObserverId, mpsc::Receiver<String>) {
    let (tx, rx) = mpsc::channel(64);
    let id = ObserverId::new();
    gateway
        .hub
        .add_observer(Observer { id, sender: tx })
        .await
        .unwrap();
    (id, rx)
}

/// Skip notices until one of type `kind` arrives and return its content.
async fn next_notice(rx: &mut mpsc::Receiver<String>, kind: &str) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap_or_else(|_| panic!("no {kind} notice"))
            .unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        if value["type"] == kind {
            return value["content"].clone();
        }
    }
}

#[tokio::test]
async fn test_reg_token_notices() {
    let harness = TestContext::new(MemoryStore::new(), MockConductor::new());
    harness.dialer.refuse(true);
    let gateway = harness.start().await;
    let (id, mut rx) = observe(&gateway).await;

    let send = |kind, content| {
        let hub = gateway.hub.clone();
        async move { hub.local_command(id, local(kind, content)).await.unwrap() }
    };

    send(LocalCommandKind::GetRegable, Value::Null).await;
    assert_eq!(next_notice(&mut rx, "Regable").await, "bad_reg_token");

    send(LocalCommandKind::SetRegToken, json!("r.e.g")).await;
    assert_eq!(next_notice(&mut rx, "Regable").await, "regable");
    assert_eq!(harness.store.scalar(REG_TOKEN_KEY).as_deref(), Some("r.e.g"));

    send(LocalCommandKind::GetRegable, Value::Null).await;
    assert_eq!(next_notice(&mut rx, "Regable").await, "regable");

    harness.store.fail_scalars(true);
    send(LocalCommandKind::SetRegToken, json!("x.y.z")).await;
    assert_eq!(next_notice(&mut rx, "Regable").await, "save_reg_token_error");
    harness.store.fail_scalars(false);

    send(LocalCommandKind::DoRemoveRegToken, Value::Null).await;
    assert_eq!(next_notice(&mut rx, "Regable").await, "bad_reg_token");
    next_notice(&mut rx, "Status").await;
    assert_eq!(harness.store.scalar(REG_TOKEN_KEY), None);

    gateway.stop(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_register_and_remove_room() {
    let harness = TestContext::new(
        MemoryStore::new().with_scalar(REG_TOKEN_KEY, "r.e.g"),
        MockConductor::new(),
    );
    let (gateway, mut server) = ready_gateway(&harness).await;
    let (id, mut rx) = observe(&gateway).await;

    gateway
        .hub
        .local_command(id, local(LocalCommandKind::DoRegRoom, json!("Front door")))
        .await
        .unwrap();
    assert_eq!(next_notice(&mut rx, "Status").await, "regging");
    let frame = server
        .recv_until(|frame| frame.starts_with("one:RegRoom:"))
        .await
        .unwrap();
    assert_eq!(frame, r#"one:RegRoom:r.e.g:"Front door""#);
    // Announced only; the connectivity status is unchanged
    assert_eq!(hub_status(&gateway).await.status, Status::Ready);

    server.send_frame(r#"{"name":"RegError"}"#).await;
    wait_for_status(&gateway, Status::RegError).await;

    server.send_frame(r#"{"name":"BadRegToken"}"#).await;
    assert_eq!(next_notice(&mut rx, "Regable").await, "bad_reg_token");
    assert_eq!(harness.store.scalar(REG_TOKEN_KEY), None);

    gateway
        .hub
        .local_command(id, local(LocalCommandKind::DoRemoveRoom, Value::Null))
        .await
        .unwrap();
    let frame = server
        .recv_until(|frame| frame.starts_with("one:RemoveRoom:"))
        .await
        .unwrap();
    assert_eq!(frame, "one:RemoveRoom:");

    gateway.stop(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_register_room_without_token_or_link() {
    let harness = TestContext::new(MemoryStore::new(), MockConductor::new());
    let (gateway, mut server) = ready_gateway(&harness).await;
    let (id, mut rx) = observe(&gateway).await;

    // Linked but no registration token: nothing is sent
    gateway
        .hub
        .local_command(id, local(LocalCommandKind::DoRegRoom, json!("Front door")))
        .await
        .unwrap();
    assert_eq!(next_notice(&mut rx, "Regable").await, "bad_reg_token");
    assert!(server.drain().iter().all(|frame| !frame.starts_with("one:RegRoom:")));

    harness.dialer.refuse(true);
    server.hang_up();
    wait_for_status(&gateway, Status::Disconnected).await;
    let gateway_ref = &gateway;
    let result =
        assert_eventually(move || async move { !hub_status(gateway_ref).await.has_control_link })
            .await;
    assert!(result.is_ok());

    while rx.try_recv().is_ok() {}

    let _ = harness.store.clone().with_scalar(REG_TOKEN_KEY, "r.e.g");
    gateway
        .hub
        .local_command(id, local(LocalCommandKind::DoRegRoom, json!("Front door")))
        .await
        .unwrap();
    assert_eq!(next_notice(&mut rx, "Status").await, "disconnected");
    assert_eq!(hub_status(&gateway).await.status, Status::Disconnected);

    gateway.stop(Duration::from_secs(5)).await;
}
