use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt as _, StreamExt as _};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

use relaypoint::client::RelayClient;
use relaypoint::monitor::start_heartbeat_monitor;
use relaypoint::protocol::{parse_frame, ErrorCode, Frame, FrameBody};
use relaypoint::server::{app, RelayConfig, RelayState};
use relaypoint::store::{MessageStore, PresenceStatus};

async fn start_relay(config: RelayConfig) -> (SocketAddr, RelayState, oneshot::Sender<()>) {
    let store = MessageStore::open_in_memory().expect("open store");
    let state = RelayState::new(config, store);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind relay");
    let addr = listener.local_addr().expect("relay addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    let server = axum::serve(
        listener,
        app(state.clone()).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = shutdown_rx.await;
    });
    tokio::spawn(async move {
        let _ = server.await;
    });

    (addr, state, shutdown_tx)
}

fn ws_url(addr: SocketAddr) -> String {
    format!("ws://{addr}/ws")
}

async fn recv_frame(client: &mut RelayClient) -> Frame {
    timeout(Duration::from_secs(2), client.next_frame())
        .await
        .expect("frame within deadline")
        .expect("frame stream")
        .expect("connection open")
}

async fn recv_closed(client: &mut RelayClient) {
    let frame = timeout(Duration::from_secs(2), client.next_frame())
        .await
        .expect("close within deadline")
        .expect("frame stream");
    assert!(frame.is_none(), "expected closed connection, got {frame:?}");
}

async fn assert_silent(client: &mut RelayClient) {
    let quiet = timeout(Duration::from_millis(150), client.next_frame()).await;
    assert!(quiet.is_err(), "expected no frame, got {quiet:?}");
}

#[tokio::test]
async fn welcome_reports_connected_agents() {
    let (addr, _state, shutdown_tx) = start_relay(RelayConfig::default()).await;

    let mut alpha = RelayClient::connect(&ws_url(addr), "alpha")
        .await
        .expect("alpha connects");
    let welcome = alpha.welcome();
    assert_eq!(welcome.session_id, "session-alpha");
    assert_eq!(welcome.connected_agents, 1);
    assert_eq!(welcome.heartbeat_interval, 30);
    assert!(welcome.server_capabilities.relay);
    assert!(welcome.server_capabilities.persistence);
    assert!(welcome.server_capabilities.history);

    let beta = RelayClient::connect(&ws_url(addr), "beta")
        .await
        .expect("beta connects");
    assert_eq!(beta.welcome().connected_agents, 2);

    // A new arrival is not announced to already-connected agents.
    assert_silent(&mut alpha).await;

    shutdown_tx.send(()).ok();
}

#[tokio::test]
async fn message_is_acked_and_relayed() {
    let (addr, _state, shutdown_tx) = start_relay(RelayConfig::default()).await;

    let mut alpha = RelayClient::connect(&ws_url(addr), "alpha").await.unwrap();
    let mut beta = RelayClient::connect(&ws_url(addr), "beta").await.unwrap();

    beta.send_message("m1", "hi").await.unwrap();

    let ack = recv_frame(&mut beta).await;
    let ack_ts = match ack.body {
        FrameBody::Ack {
            message_id,
            timestamp,
        } => {
            assert_eq!(message_id, "m1");
            timestamp
        }
        other => panic!("expected ACK, got {other:?}"),
    };

    let relayed = recv_frame(&mut alpha).await;
    match relayed.body {
        FrameBody::Message {
            message_id,
            sender,
            content,
            timestamp,
        } => {
            assert_eq!(message_id, "m1");
            assert_eq!(sender, "beta");
            assert_eq!(content, "hi");
            assert_eq!(timestamp, Some(ack_ts));
        }
        other => panic!("expected relayed MESSAGE, got {other:?}"),
    }

    // The sender does not hear its own message back.
    assert_silent(&mut beta).await;

    shutdown_tx.send(()).ok();
}

#[tokio::test]
async fn duplicate_message_id_is_idempotent() {
    let (addr, _state, shutdown_tx) = start_relay(RelayConfig::default()).await;

    let mut alpha = RelayClient::connect(&ws_url(addr), "alpha").await.unwrap();

    alpha.send_message("m1", "hello").await.unwrap();
    let first = match recv_frame(&mut alpha).await.body {
        FrameBody::Ack { timestamp, .. } => timestamp,
        other => panic!("expected ACK, got {other:?}"),
    };

    // A retry earns a second ACK with the original timestamp.
    alpha.send_message("m1", "hello").await.unwrap();
    let second = match recv_frame(&mut alpha).await.body {
        FrameBody::Ack { timestamp, .. } => timestamp,
        other => panic!("expected ACK, got {other:?}"),
    };
    assert_eq!(first, second);

    alpha.request_history(None).await.unwrap();
    match recv_frame(&mut alpha).await.body {
        FrameBody::HistoryResponse { messages } => {
            assert_eq!(messages.len(), 1, "exactly one stored row");
            assert_eq!(messages[0].message_id, "m1");
        }
        other => panic!("expected HISTORY_RESPONSE, got {other:?}"),
    }

    shutdown_tx.send(()).ok();
}

#[tokio::test]
async fn history_is_ordered_and_since_filters() {
    let (addr, _state, shutdown_tx) = start_relay(RelayConfig::default()).await;

    let mut alpha = RelayClient::connect(&ws_url(addr), "alpha").await.unwrap();

    let mut timestamps = Vec::new();
    for id in ["m1", "m2", "m3"] {
        alpha.send_message(id, "x").await.unwrap();
        match recv_frame(&mut alpha).await.body {
            FrameBody::Ack { timestamp, .. } => timestamps.push(timestamp),
            other => panic!("expected ACK, got {other:?}"),
        }
    }

    alpha.request_history(None).await.unwrap();
    match recv_frame(&mut alpha).await.body {
        FrameBody::HistoryResponse { messages } => {
            let ids: Vec<&str> = messages.iter().map(|m| m.message_id.as_str()).collect();
            assert_eq!(ids, vec!["m1", "m2", "m3"]);
            assert!(messages.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        }
        other => panic!("expected HISTORY_RESPONSE, got {other:?}"),
    }

    // since is strictly-greater-than: m1's own timestamp excludes it.
    alpha.request_history(Some(timestamps[0])).await.unwrap();
    match recv_frame(&mut alpha).await.body {
        FrameBody::HistoryResponse { messages } => {
            let ids: Vec<&str> = messages.iter().map(|m| m.message_id.as_str()).collect();
            assert_eq!(ids, vec!["m2", "m3"]);
        }
        other => panic!("expected HISTORY_RESPONSE, got {other:?}"),
    }

    shutdown_tx.send(()).ok();
}

#[tokio::test]
async fn offline_messages_replay_on_reconnect() {
    let (addr, _state, shutdown_tx) = start_relay(RelayConfig::default()).await;

    let mut alpha = RelayClient::connect(&ws_url(addr), "alpha").await.unwrap();
    let mut beta = RelayClient::connect(&ws_url(addr), "beta").await.unwrap();

    beta.send_message("m1", "before disconnect").await.unwrap();
    recv_frame(&mut beta).await; // ACK

    // alpha sees m1 live, so its delivery point advances past it.
    match recv_frame(&mut alpha).await.body {
        FrameBody::Message { message_id, .. } => assert_eq!(message_id, "m1"),
        other => panic!("expected relayed MESSAGE, got {other:?}"),
    }

    alpha.goodbye().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    beta.send_message("m2", "while offline").await.unwrap();
    recv_frame(&mut beta).await; // ACK

    let mut alpha = RelayClient::connect(&ws_url(addr), "alpha")
        .await
        .expect("alpha reconnects");
    match recv_frame(&mut alpha).await.body {
        FrameBody::HistoryResponse { messages } => {
            let ids: Vec<&str> = messages.iter().map(|m| m.message_id.as_str()).collect();
            assert_eq!(ids, vec!["m2"], "replay has m2 but not already-seen m1");
            assert_eq!(messages[0].sender, "beta");
        }
        other => panic!("expected replay HISTORY_RESPONSE, got {other:?}"),
    }

    shutdown_tx.send(()).ok();
}

#[tokio::test]
async fn explicit_cursor_overrides_presence_replay() {
    let (addr, _state, shutdown_tx) = start_relay(RelayConfig::default()).await;

    let mut alpha = RelayClient::connect(&ws_url(addr), "alpha").await.unwrap();
    alpha.send_message("m1", "one").await.unwrap();
    recv_frame(&mut alpha).await;
    alpha.send_message("m2", "two").await.unwrap();
    recv_frame(&mut alpha).await;
    alpha.goodbye().await.unwrap();

    // since=0 asks for everything, regardless of recorded last-seen.
    let mut alpha = RelayClient::connect_with_cursor(&ws_url(addr), "alpha", Some(0))
        .await
        .unwrap();
    match recv_frame(&mut alpha).await.body {
        FrameBody::HistoryResponse { messages } => {
            let ids: Vec<&str> = messages.iter().map(|m| m.message_id.as_str()).collect();
            assert_eq!(ids, vec!["m1", "m2"]);
        }
        other => panic!("expected replay HISTORY_RESPONSE, got {other:?}"),
    }

    shutdown_tx.send(()).ok();
}

#[tokio::test]
async fn second_connection_supersedes_first() {
    let (addr, state, shutdown_tx) = start_relay(RelayConfig::default()).await;

    let mut first = RelayClient::connect(&ws_url(addr), "alpha").await.unwrap();
    let mut second = RelayClient::connect(&ws_url(addr), "alpha").await.unwrap();

    match recv_frame(&mut first).await.body {
        FrameBody::Error {
            error_code,
            recoverable,
            ..
        } => {
            assert_eq!(error_code, ErrorCode::Superseded);
            assert!(!recoverable);
        }
        other => panic!("expected SUPERSEDED error, got {other:?}"),
    }
    recv_closed(&mut first).await;

    assert_eq!(state.registry().online_count().await, 1);

    // The replacement session is fully live.
    second.ping().await.unwrap();
    assert!(matches!(
        recv_frame(&mut second).await.body,
        FrameBody::Pong { .. }
    ));

    shutdown_tx.send(()).ok();
}

#[tokio::test]
async fn goodbye_marks_agent_offline() {
    let (addr, state, shutdown_tx) = start_relay(RelayConfig::default()).await;

    let alpha = RelayClient::connect(&ws_url(addr), "alpha").await.unwrap();
    assert_eq!(
        state.presence_status("alpha").await.unwrap(),
        PresenceStatus::Online
    );

    alpha.goodbye().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(
        state.presence_status("alpha").await.unwrap(),
        PresenceStatus::Offline
    );
    assert_eq!(state.registry().online_count().await, 0);

    let beta = RelayClient::connect(&ws_url(addr), "beta").await.unwrap();
    assert_eq!(beta.welcome().connected_agents, 1);

    shutdown_tx.send(()).ok();
}

#[tokio::test]
async fn heartbeat_evicts_silent_sessions() {
    let config = RelayConfig {
        heartbeat_interval: Duration::from_millis(100),
        missed_threshold: 2,
        ..RelayConfig::default()
    };
    let (addr, state, shutdown_tx) = start_relay(config).await;
    let (sweep_tx, sweep_rx) = oneshot::channel();
    start_heartbeat_monitor(state.clone(), sweep_rx);

    let mut idle = RelayClient::connect(&ws_url(addr), "idle").await.unwrap();
    let mut active = RelayClient::connect(&ws_url(addr), "active").await.unwrap();

    // The active agent keeps pinging; the idle one says nothing.
    for _ in 0..6 {
        active.ping().await.unwrap();
        assert!(matches!(
            recv_frame(&mut active).await.body,
            FrameBody::Pong { .. }
        ));
        tokio::time::sleep(Duration::from_millis(80)).await;
    }

    assert_eq!(state.registry().online_count().await, 1);
    assert!(state.registry().lookup("active").await.is_some());
    assert_eq!(
        state.presence_status("idle").await.unwrap(),
        PresenceStatus::Offline
    );
    recv_closed(&mut idle).await;

    sweep_tx.send(()).ok();
    shutdown_tx.send(()).ok();
}

#[tokio::test]
async fn handshake_must_complete_within_deadline() {
    let config = RelayConfig {
        handshake_timeout: Duration::from_millis(200),
        ..RelayConfig::default()
    };
    let (addr, _state, shutdown_tx) = start_relay(config).await;

    // Connect and say nothing.
    let (mut ws, _) = tokio_tungstenite::connect_async(ws_url(addr))
        .await
        .expect("raw connect");

    let message = timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("error within deadline")
        .expect("frame before close")
        .expect("readable frame");
    let frame = match message {
        WsMessage::Text(text) => parse_frame(&text).expect("error frame"),
        other => panic!("expected text frame, got {other:?}"),
    };
    match frame.body {
        FrameBody::Error {
            error_code,
            recoverable,
            ..
        } => {
            assert_eq!(error_code, ErrorCode::InvalidHandshake);
            assert!(!recoverable);
        }
        other => panic!("expected handshake error, got {other:?}"),
    }

    shutdown_tx.send(()).ok();
}

#[tokio::test]
async fn handshake_rejects_wrong_version_and_missing_sender() {
    let (addr, _state, shutdown_tx) = start_relay(RelayConfig::default()).await;

    // Wrong protocol version.
    let (mut ws, _) = tokio_tungstenite::connect_async(ws_url(addr)).await.unwrap();
    ws.send(WsMessage::Text(
        r#"{"protocol_version":"0.2","message_type":"HELLO","sender":"x","capabilities":{}}"#
            .to_string(),
    ))
    .await
    .unwrap();
    let reply = expect_error_frame(&mut ws).await;
    assert!(matches!(
        reply.body,
        FrameBody::Error {
            error_code: ErrorCode::UnsupportedVersion,
            recoverable: false,
            ..
        }
    ));

    // Empty sender.
    let (mut ws, _) = tokio_tungstenite::connect_async(ws_url(addr)).await.unwrap();
    ws.send(WsMessage::Text(
        r#"{"protocol_version":"0.3","message_type":"HELLO","sender":"","capabilities":{}}"#
            .to_string(),
    ))
    .await
    .unwrap();
    let reply = expect_error_frame(&mut ws).await;
    assert!(matches!(
        reply.body,
        FrameBody::Error {
            error_code: ErrorCode::InvalidHandshake,
            recoverable: false,
            ..
        }
    ));

    shutdown_tx.send(()).ok();
}

async fn expect_error_frame(
    ws: &mut tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
) -> Frame {
    loop {
        let message = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("reply within deadline")
            .expect("frame before close")
            .expect("readable frame");
        match message {
            WsMessage::Text(text) => return parse_frame(&text).expect("error frame"),
            WsMessage::Close(_) => panic!("closed without an error frame"),
            _ => {}
        }
    }
}

#[tokio::test]
async fn malformed_frames_are_nonfatal_in_active_state() {
    let (addr, _state, shutdown_tx) = start_relay(RelayConfig::default()).await;

    let mut alpha = RelayClient::connect(&ws_url(addr), "alpha").await.unwrap();

    alpha.send_raw("{this is not json").await.unwrap();
    match recv_frame(&mut alpha).await.body {
        FrameBody::Error {
            error_code,
            recoverable,
            ..
        } => {
            assert_eq!(error_code, ErrorCode::InvalidJson);
            assert!(recoverable);
        }
        other => panic!("expected INVALID_JSON error, got {other:?}"),
    }

    alpha
        .send_raw(r#"{"protocol_version":"0.3","message_type":"TELEPORT"}"#)
        .await
        .unwrap();
    match recv_frame(&mut alpha).await.body {
        FrameBody::Error {
            error_code,
            recoverable,
            ..
        } => {
            assert_eq!(error_code, ErrorCode::UnknownType);
            assert!(recoverable);
        }
        other => panic!("expected UNKNOWN_TYPE error, got {other:?}"),
    }

    // The connection survived both violations.
    alpha.ping().await.unwrap();
    assert!(matches!(
        recv_frame(&mut alpha).await.body,
        FrameBody::Pong { .. }
    ));

    shutdown_tx.send(()).ok();
}

#[tokio::test]
async fn connection_limit_refuses_before_upgrade() {
    let config = RelayConfig {
        max_connections: 1,
        ..RelayConfig::default()
    };
    let (addr, _state, shutdown_tx) = start_relay(config).await;

    let _alpha = RelayClient::connect(&ws_url(addr), "alpha").await.unwrap();
    let refused = tokio_tungstenite::connect_async(ws_url(addr)).await;
    assert!(refused.is_err(), "second connection should be refused");

    shutdown_tx.send(()).ok();
}

#[tokio::test]
async fn shutdown_notifies_and_drains_sessions() {
    let (addr, state, shutdown_tx) = start_relay(RelayConfig::default()).await;

    let mut alpha = RelayClient::connect(&ws_url(addr), "alpha").await.unwrap();
    alpha.send_message("m1", "before shutdown").await.unwrap();
    recv_frame(&mut alpha).await; // ACK

    state.begin_shutdown();

    match recv_frame(&mut alpha).await.body {
        FrameBody::Error {
            error_code,
            recoverable,
            ..
        } => {
            assert_eq!(error_code, ErrorCode::ServerShutdown);
            assert!(recoverable);
        }
        other => panic!("expected SERVER_SHUTDOWN error, got {other:?}"),
    }
    recv_closed(&mut alpha).await;

    let stored = state
        .drain(Duration::from_secs(2))
        .await
        .expect("store reachable at rest");
    assert_eq!(stored, 1);
    assert_eq!(state.registry().online_count().await, 0);

    shutdown_tx.send(()).ok();
}

#[tokio::test]
async fn healthz_returns_ok() {
    let (addr, _state, shutdown_tx) = start_relay(RelayConfig::default()).await;

    let body = tokio::task::spawn_blocking(move || {
        ureq::get(&format!("http://{addr}/healthz"))
            .call()
            .expect("health request")
            .into_string()
            .expect("health body")
    })
    .await
    .expect("health task");
    assert_eq!(body, "OK");

    shutdown_tx.send(()).ok();
}
