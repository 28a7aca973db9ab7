//! Relay wire protocol: JSON frames exchanged over a WebSocket connection.
//!
//! Every frame is a JSON object carrying `protocol_version` and
//! `message_type`, with the remaining fields determined by the type.  The set
//! of frame types is closed: anything outside it is rejected at the boundary
//! with an [`ErrorCode::UnknownType`] reply rather than deep in session logic.
//!
//! Timestamps on the wire are milliseconds since the UNIX epoch, assigned by
//! the relay's message store so that history ordering and replay cursors are
//! comparable across clients with skewed clocks.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The single protocol version this relay speaks.
pub const PROTOCOL_VERSION: &str = "0.3";

/// A complete wire frame: version envelope plus typed body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub protocol_version: String,
    #[serde(flatten)]
    pub body: FrameBody,
}

/// The closed set of frame types, tagged by `message_type` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message_type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FrameBody {
    Hello {
        sender: String,
        #[serde(default)]
        capabilities: Value,
        /// Optional replay cursor: replay everything strictly after this
        /// timestamp instead of the agent's recorded last-seen time.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        since_timestamp: Option<u64>,
    },
    Welcome {
        session_id: String,
        server_capabilities: ServerCapabilities,
        heartbeat_interval: u64,
        connected_agents: usize,
    },
    Message {
        message_id: String,
        sender: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
    Ack {
        message_id: String,
        timestamp: u64,
    },
    Ping,
    Pong {
        timestamp: u64,
    },
    RequestHistory {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        since_timestamp: Option<u64>,
    },
    HistoryResponse {
        messages: Vec<HistoryMessage>,
    },
    Error {
        error_code: ErrorCode,
        error_message: String,
        recoverable: bool,
        timestamp: u64,
    },
    Goodbye,
}

/// Capability flags advertised in WELCOME.  All true for this relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerCapabilities {
    pub relay: bool,
    pub persistence: bool,
    pub history: bool,
}

impl Default for ServerCapabilities {
    fn default() -> Self {
        Self {
            relay: true,
            persistence: true,
            history: true,
        }
    }
}

/// One entry of a HISTORY_RESPONSE, in persisted order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub message_id: String,
    pub sender: String,
    pub content: String,
    pub timestamp: u64,
}

/// Error codes carried in ERROR frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidHandshake,
    UnsupportedVersion,
    InvalidJson,
    UnknownType,
    StorageFailure,
    Superseded,
    ServerShutdown,
}

/// Why an inbound text frame could not be turned into a [`Frame`].
#[derive(Debug)]
pub enum FrameError {
    /// The payload was not valid JSON at all.
    Json(serde_json::Error),
    /// Valid JSON, but not a frame from the closed set (unknown
    /// `message_type`, missing tag, or wrong field shape).
    Shape {
        message_type: Option<String>,
        detail: String,
    },
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::Json(error) => write!(f, "invalid json: {error}"),
            FrameError::Shape {
                message_type: Some(t),
                detail,
            } => write!(f, "malformed {t} frame: {detail}"),
            FrameError::Shape {
                message_type: None,
                detail,
            } => write!(f, "malformed frame: {detail}"),
        }
    }
}

impl std::error::Error for FrameError {}

/// Parse an inbound text payload into a frame, distinguishing JSON-level
/// garbage from well-formed JSON that falls outside the frame set.
pub fn parse_frame(text: &str) -> Result<Frame, FrameError> {
    let value: Value = serde_json::from_str(text).map_err(FrameError::Json)?;
    let message_type = value
        .get("message_type")
        .and_then(Value::as_str)
        .map(str::to_string);
    serde_json::from_value(value).map_err(|error| FrameError::Shape {
        message_type,
        detail: error.to_string(),
    })
}

impl Frame {
    fn new(body: FrameBody) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            body,
        }
    }

    /// Whether the frame's version matches the one this relay speaks.
    pub fn version_supported(&self) -> bool {
        self.protocol_version == PROTOCOL_VERSION
    }

    pub fn hello(sender: impl Into<String>, capabilities: Value, since: Option<u64>) -> Self {
        Self::new(FrameBody::Hello {
            sender: sender.into(),
            capabilities,
            since_timestamp: since,
        })
    }

    pub fn welcome(
        session_id: impl Into<String>,
        heartbeat_interval: u64,
        connected_agents: usize,
    ) -> Self {
        Self::new(FrameBody::Welcome {
            session_id: session_id.into(),
            server_capabilities: ServerCapabilities::default(),
            heartbeat_interval,
            connected_agents,
        })
    }

    pub fn message(
        message_id: impl Into<String>,
        sender: impl Into<String>,
        content: impl Into<String>,
        timestamp: Option<u64>,
    ) -> Self {
        Self::new(FrameBody::Message {
            message_id: message_id.into(),
            sender: sender.into(),
            content: content.into(),
            timestamp,
        })
    }

    pub fn ack(message_id: impl Into<String>, timestamp: u64) -> Self {
        Self::new(FrameBody::Ack {
            message_id: message_id.into(),
            timestamp,
        })
    }

    pub fn ping() -> Self {
        Self::new(FrameBody::Ping)
    }

    pub fn pong(timestamp: u64) -> Self {
        Self::new(FrameBody::Pong { timestamp })
    }

    pub fn request_history(since_timestamp: Option<u64>) -> Self {
        Self::new(FrameBody::RequestHistory { since_timestamp })
    }

    pub fn history_response(messages: Vec<HistoryMessage>) -> Self {
        Self::new(FrameBody::HistoryResponse { messages })
    }

    pub fn error(
        code: ErrorCode,
        message: impl Into<String>,
        recoverable: bool,
        timestamp: u64,
    ) -> Self {
        Self::new(FrameBody::Error {
            error_code: code,
            error_message: message.into(),
            recoverable,
            timestamp,
        })
    }

    pub fn goodbye() -> Self {
        Self::new(FrameBody::Goodbye)
    }
}
