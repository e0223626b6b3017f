// WebSocket message types for the reviewbox relay channel.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Messages a client may send over the relay channel.
///
/// The first frame on every connection must be [`ClientMessage::Auth`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Handshake: binds the channel to an identity.
    Auth {
        user_id: String,
        /// Access token issued upstream for `user_id`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },

    /// Start receiving events for a sheet.
    Subscribe { sheet_id: String },

    /// Stop receiving events for a sheet.
    Unsubscribe { sheet_id: String },

    /// Application-level keepalive, answered with `pong`.
    Ping,
}

/// Messages the relay sends to clients: acknowledgements and pushed events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        user_id: String,
    },

    Error {
        code: String,
        message: String,
    },

    Subscribed {
        sheet_id: String,
    },

    Unsubscribed {
        sheet_id: String,
    },

    Pong,

    /// A sheet was created, edited, or deleted.
    SheetUpdate {
        action: String,
        sheet_id: String,
        data: serde_json::Value,
    },

    /// An image on a sheet changed status (uploaded, adopted, rejected...).
    ImageUpdate {
        action: String,
        sheet_id: String,
        data: serde_json::Value,
    },

    /// The receiving user's point balance changed.
    PointsUpdate {
        points: i64,
        reason: String,
    },
}

impl ServerMessage {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error { code: code.into(), message: message.into() }
    }

    /// Wire name of the `type` tag, used for logging and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Error { .. } => "error",
            Self::Subscribed { .. } => "subscribed",
            Self::Unsubscribed { .. } => "unsubscribed",
            Self::Pong => "pong",
            Self::SheetUpdate { .. } => "sheet_update",
            Self::ImageUpdate { .. } => "image_update",
            Self::PointsUpdate { .. } => "points_update",
        }
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    #[error("frame is missing the `type` field")]
    MissingType,

    #[error("unknown message type `{0}`")]
    UnknownType(String),

    #[error("malformed `{kind}` message: {source}")]
    Malformed {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

const CLIENT_MESSAGE_TYPES: &[&str] = &["auth", "subscribe", "unsubscribe", "ping"];

/// Decode a client text frame, classifying failures so the caller can
/// report exactly what was wrong with the frame.
pub fn decode_client_message(raw: &str) -> Result<ClientMessage, ProtocolError> {
    let value: serde_json::Value = serde_json::from_str(raw).map_err(ProtocolError::InvalidJson)?;
    let kind = match value.get("type").and_then(serde_json::Value::as_str) {
        Some(kind) => kind.to_owned(),
        None => return Err(ProtocolError::MissingType),
    };

    if !CLIENT_MESSAGE_TYPES.contains(&kind.as_str()) {
        return Err(ProtocolError::UnknownType(kind));
    }

    serde_json::from_value(value).map_err(|source| ProtocolError::Malformed { kind, source })
}

pub fn encode_server_message(message: &ServerMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}
