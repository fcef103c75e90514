//! JSON wire protocol for room synchronization.
//!
//! Every frame is a JSON object tagged by `type`:
//! ```text
//! client → server   {"type":"join","roomKey":"abc"}
//!                   {"type":"edit","roomKey":"abc","text":"..."}
//!                   {"type":"run","source":"...","languageId":63}
//!                   {"type":"status"}
//!
//! server → client   {"type":"init","text":"..."}
//!                   {"type":"update","text":"..."}
//!                   {"type":"runResult","stdout":"...","stderr":null,"error":null}
//!                   {"type":"status","status":"running","activeRooms":1,"activeConnections":2}
//! ```
//!
//! Inbound frames are decoded into a loose shape first and then validated,
//! so a missing field surfaces as [`ProtocolError::MissingField`] instead of
//! a generic parse failure.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::exec::{ExecutionOutput, ExecutionRequest};

/// Seed text for a room nobody has opened yet.
///
/// Clients should start their local buffer from the same value: the first
/// joiner of a room is not sent an init snapshot.
pub const DEFAULT_ROOM_TEXT: &str = "// Start coding here...\n";

/// Opaque, case-sensitive room identifier chosen by clients.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomKey(String);

impl RoomKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for RoomKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// Identity of one transport connection, assigned when the socket is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Discriminant of a client message, as carried in the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageKind {
    Join,
    Edit,
    Run,
    Status,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Join => "join",
            Self::Edit => "edit",
            Self::Run => "run",
            Self::Status => "status",
        };
        f.write_str(name)
    }
}

/// A validated client → server message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Attach to a room, seeding it if unknown.
    Join { room_key: RoomKey },
    /// Replace the whole text of a room.
    Edit { room_key: RoomKey, text: String },
    /// Hand source text to the execution collaborator.
    Run(ExecutionRequest),
    /// Ask the server for its health report.
    Status,
}

/// Inbound frame before validation: every payload field is optional.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawClientMessage {
    #[serde(rename = "type")]
    kind: MessageKind,
    room_key: Option<String>,
    text: Option<String>,
    source: Option<String>,
    language_id: Option<u32>,
}

impl RawClientMessage {
    fn validate(self) -> Result<ClientMessage, ProtocolError> {
        let kind = self.kind;
        let missing = |field: &'static str| ProtocolError::MissingField { kind, field };

        match kind {
            MessageKind::Join => {
                let room_key = self.room_key.ok_or_else(|| missing("roomKey"))?;
                Ok(ClientMessage::Join { room_key: RoomKey(room_key) })
            }
            MessageKind::Edit => {
                let room_key = self.room_key.ok_or_else(|| missing("roomKey"))?;
                let text = self.text.ok_or_else(|| missing("text"))?;
                Ok(ClientMessage::Edit { room_key: RoomKey(room_key), text })
            }
            MessageKind::Run => {
                // Empty source and language 0 count as absent.
                let source = self
                    .source
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| missing("source"))?;
                let language_id = self
                    .language_id
                    .filter(|id| *id != 0)
                    .ok_or_else(|| missing("languageId"))?;
                Ok(ClientMessage::Run(ExecutionRequest { source, language_id }))
            }
            MessageKind::Status => Ok(ClientMessage::Status),
        }
    }
}

impl ClientMessage {
    pub fn join(room_key: impl Into<RoomKey>) -> Self {
        Self::Join { room_key: room_key.into() }
    }

    pub fn edit(room_key: impl Into<RoomKey>, text: impl Into<String>) -> Self {
        Self::Edit { room_key: room_key.into(), text: text.into() }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Join { .. } => MessageKind::Join,
            Self::Edit { .. } => MessageKind::Edit,
            Self::Run(_) => MessageKind::Run,
            Self::Status => MessageKind::Status,
        }
    }

    /// Decode and validate a text frame.
    ///
    /// Once the `type` tag is readable, payload errors carry the message kind
    /// so the caller can answer a broken `run` request.
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        let value: serde_json::Value =
            serde_json::from_str(frame).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let kind = value
            .get("type")
            .and_then(|tag| MessageKind::deserialize(tag).ok());

        let raw = RawClientMessage::deserialize(value).map_err(|e| match kind {
            Some(kind) => ProtocolError::InvalidField { kind, reason: e.to_string() },
            None => ProtocolError::Malformed(e.to_string()),
        })?;
        raw.validate()
    }

    /// Decode a binary frame carrying UTF-8 JSON.
    pub fn decode_bytes(frame: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(frame).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        Self::decode(text)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

/// Health report returned for a `status` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub status: String,
    pub active_rooms: usize,
    pub active_connections: usize,
}

impl StatusReport {
    pub fn running(active_rooms: usize, active_connections: usize) -> Self {
        Self {
            status: "running".to_string(),
            active_rooms,
            active_connections,
        }
    }
}

/// A server → client message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Current room text, sent only to a joiner of a pre-existing room.
    Init { text: String },
    /// Text accepted from another member of the room.
    Update { text: String },
    /// Outcome of a `run` request.
    RunResult(ExecutionOutput),
    /// Answer to a `status` request.
    Status(StatusReport),
}

impl ServerMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(frame).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("{kind} message is missing `{field}`")]
    MissingField { kind: MessageKind, field: &'static str },
    #[error("{kind} message has an invalid field: {reason}")]
    InvalidField { kind: MessageKind, reason: String },
    #[error("edit text is {len} bytes, limit is {limit}")]
    TextTooLarge { len: usize, limit: usize },
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("connection closed")]
    ConnectionClosed,
}

impl ProtocolError {
    /// Kind of the rejected message, when its `type` tag was readable.
    pub fn kind(&self) -> Option<MessageKind> {
        match self {
            Self::MissingField { kind, .. } | Self::InvalidField { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}
