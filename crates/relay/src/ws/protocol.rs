use axum::extract::ws::{CloseFrame, Message, WebSocket};
use reviewbox_common::protocol::ws::{encode_server_message, ServerMessage};

use crate::hub::CloseReason;

pub const AUTH_REQUIRED: &str = "AUTH_REQUIRED";
pub const AUTH_INVALID_IDENTITY: &str = "AUTH_INVALID_IDENTITY";
pub const AUTH_INVALID_TOKEN: &str = "AUTH_INVALID_TOKEN";
pub const AUTH_TIMEOUT: &str = "AUTH_TIMEOUT";
pub const ALREADY_AUTHENTICATED: &str = "ALREADY_AUTHENTICATED";
pub const INVALID_MESSAGE: &str = "INVALID_MESSAGE";
pub const INVALID_TOPIC: &str = "INVALID_TOPIC";
pub const NOT_CONNECTED: &str = "NOT_CONNECTED";

/// Superseded by a newer connection for the same identity.
pub const CLOSE_SUPERSEDED: u16 = 4001;
/// Outbound queue overflowed.
pub const CLOSE_LAGGING: u16 = 4002;
pub const CLOSE_AUTH_FAILED: u16 = 4003;

pub async fn send_server_message(
    socket: &mut WebSocket,
    message: &ServerMessage,
) -> Result<(), axum::Error> {
    let encoded = encode_server_message(message).map_err(axum::Error::new)?;
    socket.send(Message::Text(encoded.into())).await
}

/// Best-effort close frame; the peer may already be gone.
pub async fn send_close(socket: &mut WebSocket, code: u16, reason: &str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame { code, reason: reason.to_owned().into() })))
        .await;
}

pub fn close_code_for(reason: CloseReason) -> u16 {
    match reason {
        CloseReason::Superseded => CLOSE_SUPERSEDED,
        CloseReason::Lagging => CLOSE_LAGGING,
        CloseReason::Evicted => axum::extract::ws::close_code::NORMAL,
    }
}
