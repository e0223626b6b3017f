use super::protocol::{
    close_code_for, send_close, send_server_message, ALREADY_AUTHENTICATED, AUTH_INVALID_IDENTITY,
    AUTH_INVALID_TOKEN, AUTH_REQUIRED, AUTH_TIMEOUT, CLOSE_AUTH_FAILED, INVALID_MESSAGE,
    INVALID_TOPIC, NOT_CONNECTED,
};
use super::WsLimits;
use crate::auth::jwt::JwtAccessTokenService;
use crate::error::{current_request_id, request_id_from_headers_or_generate, with_request_id_scope};
use crate::hub::{CloseReason, ConnectionId, ConnectionReceiver, Hub, Identity, SubscribeError};
use crate::metrics;
use axum::{
    extract::{
        ws::{close_code, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
    Router,
};
use reviewbox_common::protocol::ws::{decode_client_message, ClientMessage, ServerMessage};
use std::sync::Arc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct WsState {
    hub: Hub,
    jwt_service: Arc<JwtAccessTokenService>,
    trust_client_identity: bool,
    limits: WsLimits,
}

impl WsState {
    /// Resolve the identity claimed by an `auth` frame. Unless the relay is
    /// configured to trust clients, the claim must be backed by a token whose
    /// subject is the same identity.
    fn verify_identity(
        &self,
        user_id: String,
        token: Option<String>,
    ) -> Result<Identity, ServerMessage> {
        if user_id.trim().is_empty() {
            return Err(ServerMessage::error(AUTH_INVALID_IDENTITY, "Invalid user_id"));
        }

        if self.trust_client_identity {
            return Ok(user_id);
        }

        let Some(token) = token.filter(|token| !token.is_empty()) else {
            return Err(ServerMessage::error(AUTH_INVALID_TOKEN, "token is required"));
        };

        match self.jwt_service.validate_user_token(&token) {
            Ok(subject) if subject == user_id => Ok(user_id),
            Ok(_) => Err(ServerMessage::error(
                AUTH_INVALID_TOKEN,
                "token subject does not match user_id",
            )),
            Err(_) => Err(ServerMessage::error(AUTH_INVALID_TOKEN, "invalid token")),
        }
    }
}

pub fn router(
    hub: Hub,
    jwt_service: Arc<JwtAccessTokenService>,
    trust_client_identity: bool,
) -> Router {
    router_with_limits(hub, jwt_service, trust_client_identity, WsLimits::default())
}

pub fn router_with_limits(
    hub: Hub,
    jwt_service: Arc<JwtAccessTokenService>,
    trust_client_identity: bool,
    limits: WsLimits,
) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .with_state(WsState { hub, jwt_service, trust_client_identity, limits })
}

pub async fn ws_upgrade(
    State(state): State<WsState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let request_id = request_id_from_headers_or_generate(&headers);
    let max_frame_bytes = state.limits.max_frame_bytes;
    ws.max_frame_size(max_frame_bytes).max_message_size(max_frame_bytes).on_upgrade(
        move |socket| async move {
            with_request_id_scope(request_id, handle_socket(state, socket)).await;
        },
    )
}

enum Handshake {
    Authenticated(Identity),
    Rejected(ServerMessage),
    FrameTooLarge,
    Disconnected,
}

/// Why the active loop ended.
#[derive(Debug, Clone, Copy)]
enum Exit {
    Hub(CloseReason),
    ClientClosed,
    HeartbeatTimeout,
    FrameTooLarge,
    SendFailed,
}

impl Exit {
    fn as_str(self) -> &'static str {
        match self {
            Self::Hub(reason) => reason.as_str(),
            Self::ClientClosed => "client_closed",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::FrameTooLarge => "frame_too_large",
            Self::SendFailed => "send_failed",
        }
    }
}

fn elapsed_ms(started_at: Instant) -> u64 {
    u64::try_from(started_at.elapsed().as_millis()).unwrap_or(u64::MAX)
}

async fn close_frame_too_large(socket: &mut WebSocket, max_frame_bytes: usize) {
    let reason = format!("websocket frame exceeds maximum size of {max_frame_bytes} bytes");
    send_close(socket, close_code::SIZE, &reason).await;
}

fn is_frame_size_violation(error: &axum::Error) -> bool {
    let message = error.to_string().to_ascii_lowercase();
    message.contains("message too long")
        || message.contains("frame too long")
        || message.contains("too large")
        || message.contains("too big")
        || message.contains("size limit")
}

async fn read_handshake(state: &WsState, socket: &mut WebSocket) -> Handshake {
    let deadline = Instant::now() + state.limits.auth_timeout;

    loop {
        let Ok(next) = tokio::time::timeout_at(deadline, socket.recv()).await else {
            return Handshake::Rejected(ServerMessage::error(
                AUTH_TIMEOUT,
                "authentication was not received in time",
            ));
        };

        let raw = match next {
            None | Some(Ok(Message::Close(_))) => return Handshake::Disconnected,
            Some(Err(error)) if is_frame_size_violation(&error) => {
                return Handshake::FrameTooLarge
            }
            Some(Err(_)) => return Handshake::Disconnected,
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Binary(_))) => {
                return Handshake::Rejected(ServerMessage::error(
                    AUTH_REQUIRED,
                    "Authentication required",
                ))
            }
            Some(Ok(Message::Text(raw))) => raw,
        };

        return match decode_client_message(raw.as_str()) {
            Ok(ClientMessage::Auth { user_id, token }) => match state.verify_identity(user_id, token)
            {
                Ok(identity) => Handshake::Authenticated(identity),
                Err(reply) => Handshake::Rejected(reply),
            },
            Ok(_) => {
                Handshake::Rejected(ServerMessage::error(AUTH_REQUIRED, "Authentication required"))
            }
            Err(error) => Handshake::Rejected(ServerMessage::error(
                AUTH_REQUIRED,
                format!("Authentication required: {error}"),
            )),
        };
    }
}

async fn handle_socket(state: WsState, mut socket: WebSocket) {
    let request_id = current_request_id().unwrap_or_else(|| "unknown".to_string());
    let handshake_started_at = Instant::now();

    let identity = match read_handshake(&state, &mut socket).await {
        Handshake::Authenticated(identity) => identity,
        Handshake::Rejected(reply) => {
            metrics::record_ws_request("auth", true, elapsed_ms(handshake_started_at));
            if let ServerMessage::Error { code, .. } = &reply {
                info!(request_id = %request_id, code = %code, "websocket handshake rejected");
            }
            let _ = send_server_message(&mut socket, &reply).await;
            send_close(&mut socket, CLOSE_AUTH_FAILED, "authentication failed").await;
            return;
        }
        Handshake::FrameTooLarge => {
            metrics::record_ws_request("auth", true, elapsed_ms(handshake_started_at));
            close_frame_too_large(&mut socket, state.limits.max_frame_bytes).await;
            return;
        }
        Handshake::Disconnected => {
            metrics::record_ws_request("auth", true, elapsed_ms(handshake_started_at));
            return;
        }
    };

    let (connection, receiver) = state.hub.open_connection();
    let connection_id = connection.id();
    state.hub.register(&identity, connection).await;

    let connected = ServerMessage::Connected { user_id: identity.clone() };
    if send_server_message(&mut socket, &connected).await.is_err() {
        metrics::record_ws_request("auth", true, elapsed_ms(handshake_started_at));
        state.hub.release(&identity, connection_id).await;
        return;
    }
    metrics::record_ws_request("auth", false, elapsed_ms(handshake_started_at));
    info!(
        request_id = %request_id,
        user_id = %identity,
        connection_id = %connection_id,
        "websocket client authenticated"
    );

    let exit = run_active_loop(&state, &identity, &mut socket, receiver).await;

    let released = state.hub.release(&identity, connection_id).await;
    match exit {
        Exit::Hub(reason) => send_close(&mut socket, close_code_for(reason), reason.as_str()).await,
        Exit::FrameTooLarge => close_frame_too_large(&mut socket, state.limits.max_frame_bytes).await,
        Exit::ClientClosed | Exit::HeartbeatTimeout | Exit::SendFailed => {}
    }

    info!(
        request_id = %request_id,
        user_id = %identity,
        connection_id = %connection_id,
        reason = exit.as_str(),
        released,
        "websocket connection closed"
    );
}

async fn run_active_loop(
    state: &WsState,
    identity: &str,
    socket: &mut WebSocket,
    receiver: ConnectionReceiver,
) -> Exit {
    let ConnectionReceiver { id: connection_id, mut outbound, mut close } = receiver;
    let WsLimits { heartbeat_interval, heartbeat_timeout, .. } = state.limits;

    // Any inbound frame within `heartbeat_timeout` of a ping counts as
    // liveness.
    let mut heartbeat =
        tokio::time::interval_at(Instant::now() + heartbeat_interval, heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let pong_deadline = tokio::time::sleep(heartbeat_timeout);
    tokio::pin!(pong_deadline);
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            changed = close.changed() => {
                let reason = match changed {
                    Ok(()) => (*close.borrow_and_update()).unwrap_or(CloseReason::Evicted),
                    Err(_) => CloseReason::Evicted,
                };
                return Exit::Hub(reason);
            }
            maybe_outbound = outbound.recv() => {
                let Some(message) = maybe_outbound else {
                    return Exit::Hub(CloseReason::Evicted);
                };
                if send_server_message(socket, &message).await.is_err() {
                    return Exit::SendFailed;
                }
            }
            _ = heartbeat.tick() => {
                if !awaiting_pong {
                    if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                        return Exit::SendFailed;
                    }
                    awaiting_pong = true;
                    pong_deadline.as_mut().reset(Instant::now() + heartbeat_timeout);
                }
            }
            () = &mut pong_deadline, if awaiting_pong => {
                warn!(user_id = %identity, "heartbeat timeout, disconnecting");
                return Exit::HeartbeatTimeout;
            }
            maybe_message = socket.recv() => {
                let message = match maybe_message {
                    None => return Exit::ClientClosed,
                    Some(Err(error)) if is_frame_size_violation(&error) => {
                        return Exit::FrameTooLarge;
                    }
                    Some(Err(error)) => {
                        debug!(user_id = %identity, error = %error, "websocket receive failed");
                        return Exit::ClientClosed;
                    }
                    Some(Ok(message)) => message,
                };
                awaiting_pong = false;

                let reply = match message {
                    Message::Text(raw) => {
                        dispatch_frame(&state.hub, identity, connection_id, raw.as_str()).await
                    }
                    Message::Binary(_) => {
                        metrics::record_ws_request("invalid", true, 0);
                        ServerMessage::error(INVALID_MESSAGE, "binary frames are not supported")
                    }
                    Message::Ping(_) | Message::Pong(_) => continue,
                    Message::Close(_) => return Exit::ClientClosed,
                };

                if send_server_message(socket, &reply).await.is_err() {
                    return Exit::SendFailed;
                }
            }
        }
    }
}

/// Handle one text frame from an authenticated client and build the reply.
/// Protocol errors are answered in-band and never end the connection.
async fn dispatch_frame(
    hub: &Hub,
    identity: &str,
    connection_id: ConnectionId,
    raw: &str,
) -> ServerMessage {
    let started_at = Instant::now();

    let (endpoint, reply) = match decode_client_message(raw) {
        Ok(ClientMessage::Subscribe { sheet_id }) => {
            let reply = match hub.subscribe(identity, connection_id, &sheet_id).await {
                Ok(()) => ServerMessage::Subscribed { sheet_id },
                Err(error) => subscription_error(error),
            };
            ("subscribe", reply)
        }
        Ok(ClientMessage::Unsubscribe { sheet_id }) => {
            let reply = match hub.unsubscribe(identity, connection_id, &sheet_id).await {
                Ok(_) => ServerMessage::Unsubscribed { sheet_id },
                Err(error) => subscription_error(error),
            };
            ("unsubscribe", reply)
        }
        Ok(ClientMessage::Ping) => ("ping", ServerMessage::Pong),
        Ok(ClientMessage::Auth { .. }) => (
            "auth",
            ServerMessage::error(ALREADY_AUTHENTICATED, "connection is already authenticated"),
        ),
        Err(error) => ("invalid", ServerMessage::error(INVALID_MESSAGE, error.to_string())),
    };

    let is_error = matches!(reply, ServerMessage::Error { .. });
    metrics::record_ws_request(endpoint, is_error, elapsed_ms(started_at));
    if is_error {
        debug!(user_id = %identity, endpoint, "rejected client frame");
    }

    reply
}

fn subscription_error(error: SubscribeError) -> ServerMessage {
    match error {
        SubscribeError::EmptyTopic => {
            ServerMessage::error(INVALID_TOPIC, "sheet_id must not be empty")
        }
        SubscribeError::NotConnected => {
            ServerMessage::error(NOT_CONNECTED, "connection is no longer registered")
        }
    }
}
