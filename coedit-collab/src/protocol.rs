//! JSON wire protocol shared by the sync server and the client link.
//!
//! Every frame is one JSON object tagged by its `type` field:
//! ```text
//! ┌───────────────┬──────────────────┬───────────────────────────────┐
//! │ direction     │ type             │ fields                        │
//! ├───────────────┼──────────────────┼───────────────────────────────┤
//! │ server→client │ initialState     │ content, lastUpdated          │
//! │ client→server │ edit             │ content, timestamp, userId    │
//! │ server→client │ updateDocument   │ content                       │
//! │ server→client │ conflictDetected │ details, currentContent       │
//! │ server→client │ userListUpdate   │ users                         │
//! └───────────────┴──────────────────┴───────────────────────────────┘
//! ```
//!
//! Timestamps travel as RFC 3339 strings and are normalized to UTC.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::registry::ConnectionId;

/// Wall-clock instant attached to edits and to the shared document.
pub type Timestamp = DateTime<Utc>;

/// Message types a client may send.
pub const CLIENT_MESSAGE_TYPES: &[&str] = &["edit"];

/// Message types the server may send.
pub const SERVER_MESSAGE_TYPES: &[&str] = &[
    "initialState",
    "updateDocument",
    "conflictDetected",
    "userListUpdate",
];

/// A proposed replacement of the whole document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edit {
    pub content: String,
    /// Client clock at the time the edit was issued
    pub timestamp: Timestamp,
    /// Opaque display label of the author
    pub user_id: String,
}

/// Client → server frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    Edit(Edit),
}

/// Server → client frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Full document, sent once when a connection opens
    InitialState {
        content: String,
        last_updated: Timestamp,
    },
    /// Accepted edit relayed to every other participant
    UpdateDocument { content: String },
    /// Stale edit rejected; carries the authoritative content
    ConflictDetected {
        details: String,
        current_content: String,
    },
    /// Current participant roster
    UserListUpdate { users: Vec<ConnectionId> },
}

impl ClientMessage {
    pub fn edit(content: impl Into<String>, timestamp: Timestamp, user_id: impl Into<String>) -> Self {
        Self::Edit(Edit {
            content: content.into(),
            timestamp,
            user_id: user_id.into(),
        })
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    /// Parse a JSON text frame received from a client.
    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        decode_tagged(raw, CLIENT_MESSAGE_TYPES)
    }
}

impl ServerMessage {
    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    /// Parse a JSON text frame received from the server.
    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        decode_tagged(raw, SERVER_MESSAGE_TYPES)
    }

    /// Wire name of this message's `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InitialState { .. } => "initialState",
            Self::UpdateDocument { .. } => "updateDocument",
            Self::ConflictDetected { .. } => "conflictDetected",
            Self::UserListUpdate { .. } => "userListUpdate",
        }
    }
}

/// Two-stage decode so that a well-formed frame with an unexpected `type`
/// is reported separately from a frame that is not valid JSON at all.
fn decode_tagged<T: DeserializeOwned>(raw: &str, known: &[&str]) -> Result<T, ProtocolError> {
    let value: Value = serde_json::from_str(raw).map_err(ProtocolError::Malformed)?;
    match value.get("type").and_then(Value::as_str) {
        None => return Err(ProtocolError::MissingType),
        Some(kind) if !known.contains(&kind) => {
            return Err(ProtocolError::UnknownType(kind.to_owned()));
        }
        Some(_) => {}
    }
    serde_json::from_value(value).map_err(ProtocolError::Malformed)
}

/// Protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(serde_json::Error),
    #[error("message has no `type` field")]
    MissingType,
    #[error("unknown message type `{0}`")]
    UnknownType(String),
    #[error("failed to encode message: {0}")]
    Encode(serde_json::Error),
}

impl ProtocolError {
    /// Whether the payload could not be understood at all, as opposed to
    /// being a valid frame of a type this side does not handle.
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed(_) | Self::MissingType)
    }
}
