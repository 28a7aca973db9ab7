//! Per-connection protocol state machine.
//!
//! A connection moves through `AWAITING_HELLO → ACTIVE → CLOSED`.  The first
//! frame must be a valid HELLO within the handshake deadline; the reply is a
//! WELCOME followed by a synchronous offline replay of anything the agent
//! missed since its previous session.  After that the loop multiplexes three
//! sources: frames relayed from other agents (bounded outbound channel),
//! frames arriving on the socket, and the server-wide shutdown signal.
//!
//! Handshake-phase violations are fatal.  In ACTIVE, a malformed or unknown
//! frame earns an ERROR reply but keeps the connection open; only transport
//! failure, GOODBYE, eviction, supersession, or shutdown close it.

use std::net::SocketAddr;

use axum::extract::ws::{Message, WebSocket};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{timeout, Instant};

use crate::logging;
use crate::protocol::{parse_frame, ErrorCode, Frame, FrameBody, FrameError, HistoryMessage};
use crate::registry::session_id_for;
use crate::server::RelayState;
use crate::store::now_millis;

/// Entry point for an upgraded WebSocket connection.
pub async fn run(mut socket: WebSocket, addr: SocketAddr, state: RelayState) {
    state.connection_opened();
    crate::rlog!("session: connection from {addr}");

    if let Some(active) = handshake(&mut socket, &state).await {
        active_loop(&mut socket, active, &state).await;
    }

    let _ = socket.send(Message::Close(None)).await;
    state.connection_closed();
}

/// State carried from a successful handshake into the active loop.
struct ActiveSession {
    agent_id: String,
    conn_seq: u64,
    outbound_rx: mpsc::Receiver<Frame>,
    shutdown_rx: broadcast::Receiver<()>,
}

/// Drive AWAITING_HELLO: read the first frame within the deadline, validate
/// it, register the session, reply WELCOME, and run the offline replay.
async fn handshake(socket: &mut WebSocket, state: &RelayState) -> Option<ActiveSession> {
    let deadline = Instant::now() + state.config.handshake_timeout;

    let text = loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match timeout(remaining, socket.recv()).await {
            Err(_) => {
                send_error(
                    socket,
                    ErrorCode::InvalidHandshake,
                    "handshake deadline exceeded",
                    false,
                )
                .await;
                return None;
            }
            Ok(Some(Ok(Message::Text(text)))) => break text,
            Ok(Some(Ok(Message::Ping(data)))) => {
                if socket.send(Message::Pong(data)).await.is_err() {
                    return None;
                }
            }
            Ok(Some(Ok(Message::Pong(_)))) => {}
            Ok(Some(Ok(Message::Binary(_)))) => {
                send_error(
                    socket,
                    ErrorCode::InvalidHandshake,
                    "expected a HELLO text frame",
                    false,
                )
                .await;
                return None;
            }
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) | Ok(Some(Err(_))) => return None,
        }
    };

    let frame = match parse_frame(&text) {
        Ok(frame) => frame,
        Err(FrameError::Json(error)) => {
            send_error(socket, ErrorCode::InvalidJson, error.to_string(), false).await;
            return None;
        }
        Err(error) => {
            send_error(socket, ErrorCode::InvalidHandshake, error.to_string(), false).await;
            return None;
        }
    };

    if !frame.version_supported() {
        send_error(
            socket,
            ErrorCode::UnsupportedVersion,
            format!("unsupported protocol version {:?}", frame.protocol_version),
            false,
        )
        .await;
        return None;
    }

    let (agent_id, since) = match frame.body {
        FrameBody::Hello {
            sender,
            since_timestamp,
            ..
        } => {
            if sender.is_empty() {
                send_error(
                    socket,
                    ErrorCode::InvalidHandshake,
                    "sender must be non-empty",
                    false,
                )
                .await;
                return None;
            }
            (sender, since_timestamp)
        }
        _ => {
            send_error(
                socket,
                ErrorCode::InvalidHandshake,
                "expected HELLO as first frame",
                false,
            )
            .await;
            return None;
        }
    };

    // The replay cursor comes from the previous session's last-seen time,
    // so it must be read before this connection overwrites presence.
    let cursor = match since {
        Some(ts) => Some(ts),
        None => state.presence_cursor(&agent_id).await,
    };

    let (outbound_tx, outbound_rx) = mpsc::channel(state.config.outbound_capacity);
    let (conn_seq, superseded) = state.registry().register(&agent_id, outbound_tx).await;
    if let Some(old) = superseded {
        crate::rlog!(
            "session: {} superseded by a new connection",
            logging::agent_id(&agent_id)
        );
        let _ = old.outbound.try_send(Frame::error(
            ErrorCode::Superseded,
            "superseded by new connection",
            false,
            now_millis(),
        ));
    }
    state.persist_online(&agent_id).await;

    let connected = state.online_count().await;
    let welcome = Frame::welcome(
        session_id_for(&agent_id),
        state.config.heartbeat_interval.as_secs(),
        connected,
    );
    if send_frame(socket, &welcome).await.is_err() {
        state.drop_session(&agent_id, conn_seq, "transport error").await;
        return None;
    }

    crate::rlog!(
        "session: {} established, {} agent(s) online",
        logging::agent_id(&agent_id),
        connected
    );

    // Offline replay, before any live traffic reaches this connection.
    if let Some(since_ts) = cursor {
        match state.history_since(Some(since_ts)).await {
            Ok(messages) if !messages.is_empty() => {
                crate::rlog!(
                    "replay: {} missed message(s) to {}",
                    messages.len(),
                    logging::agent_id(&agent_id)
                );
                let response = Frame::history_response(to_history(messages));
                if send_frame(socket, &response).await.is_err() {
                    state.drop_session(&agent_id, conn_seq, "transport error").await;
                    return None;
                }
            }
            Ok(_) => {}
            Err(error) => {
                crate::rlog!(
                    "replay: query failed for {}: {error}",
                    logging::agent_id(&agent_id)
                );
                send_error(socket, ErrorCode::StorageFailure, "replay unavailable", true).await;
            }
        }
    }

    Some(ActiveSession {
        agent_id,
        conn_seq,
        outbound_rx,
        shutdown_rx: state.subscribe_shutdown(),
    })
}

/// Drive ACTIVE until the connection reaches CLOSED.
async fn active_loop(socket: &mut WebSocket, active: ActiveSession, state: &RelayState) {
    let ActiveSession {
        agent_id,
        conn_seq,
        mut outbound_rx,
        mut shutdown_rx,
    } = active;

    loop {
        tokio::select! {
            relayed = outbound_rx.recv() => {
                match relayed {
                    Some(frame) => {
                        let superseded = matches!(
                            frame.body,
                            FrameBody::Error { error_code: ErrorCode::Superseded, .. }
                        );
                        if send_frame(socket, &frame).await.is_err() || superseded {
                            break;
                        }
                    }
                    // Channel dropped by the registry: evicted or superseded.
                    None => break,
                }
            }
            _ = shutdown_rx.recv() => {
                let _ = send_frame(socket, &Frame::error(
                    ErrorCode::ServerShutdown,
                    "relay shutting down",
                    true,
                    now_millis(),
                )).await;
                break;
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        if !dispatch(socket, &text, &agent_id, conn_seq, state).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        send_error(
                            socket,
                            ErrorCode::InvalidJson,
                            "binary frames are not supported",
                            true,
                        ).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                }
            }
        }
    }

    state.drop_session(&agent_id, conn_seq, "disconnected").await;
}

/// Handle one inbound text frame in ACTIVE.  Returns false when the
/// connection should close.
async fn dispatch(
    socket: &mut WebSocket,
    text: &str,
    agent_id: &str,
    conn_seq: u64,
    state: &RelayState,
) -> bool {
    // Any inbound frame counts as liveness.
    state.registry().touch(agent_id, conn_seq).await;

    let frame = match parse_frame(text) {
        Ok(frame) => frame,
        Err(FrameError::Json(error)) => {
            send_error(socket, ErrorCode::InvalidJson, error.to_string(), true).await;
            return true;
        }
        Err(error) => {
            send_error(socket, ErrorCode::UnknownType, error.to_string(), true).await;
            return true;
        }
    };

    if !frame.version_supported() {
        send_error(
            socket,
            ErrorCode::UnsupportedVersion,
            format!("unsupported protocol version {:?}", frame.protocol_version),
            true,
        )
        .await;
        return true;
    }

    match frame.body {
        FrameBody::Message {
            message_id,
            content,
            timestamp,
            ..
        } => handle_message(socket, agent_id, &message_id, &content, timestamp, state).await,
        FrameBody::Ping => send_frame(socket, &Frame::pong(now_millis())).await.is_ok(),
        FrameBody::RequestHistory { since_timestamp } => {
            match state.history_since(since_timestamp).await {
                Ok(messages) => {
                    let response = Frame::history_response(to_history(messages));
                    send_frame(socket, &response).await.is_ok()
                }
                Err(error) => {
                    crate::rlog!(
                        "history: query failed for {}: {error}",
                        logging::agent_id(agent_id)
                    );
                    send_error(socket, ErrorCode::StorageFailure, "history unavailable", true)
                        .await;
                    true
                }
            }
        }
        FrameBody::Goodbye => {
            crate::rlog!("session: {} said goodbye", logging::agent_id(agent_id));
            false
        }
        FrameBody::Hello { .. } => {
            send_error(
                socket,
                ErrorCode::InvalidHandshake,
                "session already established",
                true,
            )
            .await;
            true
        }
        FrameBody::Welcome { .. }
        | FrameBody::Ack { .. }
        | FrameBody::Pong { .. }
        | FrameBody::HistoryResponse { .. }
        | FrameBody::Error { .. } => {
            send_error(socket, ErrorCode::UnknownType, "not a client frame", true).await;
            true
        }
    }
}

/// Persist a MESSAGE, acknowledge it, and fan it out to the other sessions.
async fn handle_message(
    socket: &mut WebSocket,
    agent_id: &str,
    message_id: &str,
    content: &str,
    client_timestamp: Option<u64>,
    state: &RelayState,
) -> bool {
    // The session identity is authoritative for the stored sender; the
    // frame's own sender field is not trusted.
    let outcome = match state
        .append_message(message_id, agent_id, content, client_timestamp)
        .await
    {
        Ok(outcome) => outcome,
        Err(error) => {
            // Withhold the ACK so the sender retries; the connection stays
            // open.
            crate::rlog!(
                "store: append failed for {} from {}: {error}",
                logging::msg_id(message_id),
                logging::agent_id(agent_id)
            );
            return true;
        }
    };

    if send_frame(socket, &Frame::ack(message_id, outcome.timestamp))
        .await
        .is_err()
    {
        return false;
    }

    if !outcome.accepted {
        // Duplicate id: already stored and already relayed once.
        crate::rlog!(
            "relay: duplicate {} from {}, acknowledged without re-delivery",
            logging::msg_id(message_id),
            logging::agent_id(agent_id)
        );
        return true;
    }

    let relayed = Frame::message(message_id, agent_id, content, Some(outcome.timestamp));
    let failed = state.registry().broadcast(agent_id, &relayed).await;
    for (slow_agent, slow_seq) in failed {
        // A full outbound buffer is a liveness failure, not a reason to
        // block or to drop arbitrary frames silently.
        state
            .drop_session(&slow_agent, slow_seq, "outbound buffer overflow")
            .await;
    }

    crate::rlog!(
        "relay: stored {} from {}",
        logging::msg_id(message_id),
        logging::agent_id(agent_id)
    );
    true
}

fn to_history(messages: Vec<crate::store::StoredMessage>) -> Vec<HistoryMessage> {
    messages
        .into_iter()
        .map(|m| HistoryMessage {
            message_id: m.message_id,
            sender: m.sender,
            content: m.content,
            timestamp: m.timestamp,
        })
        .collect()
}

async fn send_frame(socket: &mut WebSocket, frame: &Frame) -> Result<(), axum::Error> {
    let text = match serde_json::to_string(frame) {
        Ok(text) => text,
        Err(error) => {
            crate::rlog!("session: failed to serialize outbound frame: {error}");
            return Ok(());
        }
    };
    socket.send(Message::Text(text)).await
}

async fn send_error(
    socket: &mut WebSocket,
    code: ErrorCode,
    message: impl Into<String>,
    recoverable: bool,
) {
    let frame = Frame::error(code, message, recoverable, now_millis());
    let _ = send_frame(socket, &frame).await;
}
