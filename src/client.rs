//! WebSocket client for the relay protocol.
//!
//! Wraps the HELLO/WELCOME handshake and frame encoding so agents, the
//! `probe` binary, and the integration tests can speak to a relay without
//! hand-assembling JSON.  The client is deliberately thin: it exposes the
//! frame stream as-is and leaves retry and de-duplication policy to the
//! caller, which must treat `message_id` as the de-duplication key.

use futures_util::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::protocol::{
    parse_frame, ErrorCode, Frame, FrameBody, FrameError, ServerCapabilities,
};
use crate::store::now_millis;

#[derive(Debug)]
pub enum ClientError {
    Transport(tokio_tungstenite::tungstenite::Error),
    Frame(FrameError),
    /// The relay replied to HELLO with an ERROR frame.
    Rejected { code: ErrorCode, message: String },
    Protocol(String),
    Closed,
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Transport(error) => write!(f, "transport error: {error}"),
            ClientError::Frame(error) => write!(f, "frame error: {error}"),
            ClientError::Rejected { code, message } => {
                write!(f, "rejected by relay ({code:?}): {message}")
            }
            ClientError::Protocol(error) => write!(f, "protocol error: {error}"),
            ClientError::Closed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(error: tokio_tungstenite::tungstenite::Error) -> Self {
        ClientError::Transport(error)
    }
}

impl From<FrameError> for ClientError {
    fn from(error: FrameError) -> Self {
        ClientError::Frame(error)
    }
}

/// The fields of the WELCOME that established this session.
#[derive(Debug, Clone)]
pub struct WelcomeInfo {
    pub session_id: String,
    pub server_capabilities: ServerCapabilities,
    pub heartbeat_interval: u64,
    pub connected_agents: usize,
}

/// A connected, welcomed relay session.
pub struct RelayClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    agent_id: String,
    welcome: WelcomeInfo,
}

impl RelayClient {
    /// Connect and complete the handshake, replaying from the relay's
    /// recorded last-seen time for this agent.
    pub async fn connect(url: &str, agent_id: &str) -> Result<Self, ClientError> {
        Self::connect_with_cursor(url, agent_id, None).await
    }

    /// Connect with an explicit replay cursor: the relay replays everything
    /// strictly after `since` instead of consulting its presence table.
    pub async fn connect_with_cursor(
        url: &str,
        agent_id: &str,
        since: Option<u64>,
    ) -> Result<Self, ClientError> {
        let (ws, _response) = connect_async(url).await?;
        let mut client = Self {
            ws,
            agent_id: agent_id.to_string(),
            welcome: WelcomeInfo {
                session_id: String::new(),
                server_capabilities: ServerCapabilities::default(),
                heartbeat_interval: 0,
                connected_agents: 0,
            },
        };

        let hello = Frame::hello(agent_id, serde_json::json!({}), since);
        client.send_frame(&hello).await?;

        match client.next_frame().await? {
            Some(Frame {
                body:
                    FrameBody::Welcome {
                        session_id,
                        server_capabilities,
                        heartbeat_interval,
                        connected_agents,
                    },
                ..
            }) => {
                client.welcome = WelcomeInfo {
                    session_id,
                    server_capabilities,
                    heartbeat_interval,
                    connected_agents,
                };
                Ok(client)
            }
            Some(Frame {
                body:
                    FrameBody::Error {
                        error_code,
                        error_message,
                        ..
                    },
                ..
            }) => Err(ClientError::Rejected {
                code: error_code,
                message: error_message,
            }),
            Some(frame) => Err(ClientError::Protocol(format!(
                "expected WELCOME, got {:?}",
                frame.body
            ))),
            None => Err(ClientError::Closed),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn welcome(&self) -> &WelcomeInfo {
        &self.welcome
    }

    /// Send a MESSAGE frame.  The relay's ACK arrives on the frame stream.
    pub async fn send_message(
        &mut self,
        message_id: &str,
        content: &str,
    ) -> Result<(), ClientError> {
        let frame = Frame::message(message_id, &self.agent_id, content, Some(now_millis()));
        self.send_frame(&frame).await
    }

    pub async fn ping(&mut self) -> Result<(), ClientError> {
        self.send_frame(&Frame::ping()).await
    }

    pub async fn request_history(&mut self, since: Option<u64>) -> Result<(), ClientError> {
        self.send_frame(&Frame::request_history(since)).await
    }

    /// Send an arbitrary frame.  Exists for tests that need to step outside
    /// the happy path.
    pub async fn send_frame(&mut self, frame: &Frame) -> Result<(), ClientError> {
        let text = serde_json::to_string(frame)
            .map_err(|error| ClientError::Protocol(error.to_string()))?;
        self.ws.send(WsMessage::Text(text)).await?;
        Ok(())
    }

    /// Send a raw text payload, bypassing frame encoding entirely.
    pub async fn send_raw(&mut self, text: &str) -> Result<(), ClientError> {
        self.ws.send(WsMessage::Text(text.to_string())).await?;
        Ok(())
    }

    /// Next frame from the relay, or `None` once the connection is closed.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>, ClientError> {
        while let Some(message) = self.ws.next().await {
            match message? {
                WsMessage::Text(text) => return Ok(Some(parse_frame(&text)?)),
                WsMessage::Close(_) => return Ok(None),
                // Protocol-level pings are answered by tungstenite itself.
                _ => {}
            }
        }
        Ok(None)
    }

    /// Announce a graceful disconnect and close the socket.
    pub async fn goodbye(mut self) -> Result<(), ClientError> {
        self.send_frame(&Frame::goodbye()).await?;
        let _ = self.ws.close(None).await;
        Ok(())
    }

    /// Drop the connection without a GOODBYE, as a crashing agent would.
    pub async fn abandon(mut self) {
        let _ = self.ws.close(None).await;
    }
}
