// HTTP API: heartbeat and presence lookup for users, event ingress for
// collaborating services.

mod events;
mod presence;

pub use events::BusinessEvent;

use std::sync::Arc;

use axum::{
    extract::rejection::JsonRejection,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};

use crate::{
    auth::{
        jwt::JwtAccessTokenService,
        middleware::{require_bearer_auth, require_internal_token, InternalToken},
    },
    error::{ErrorCode, RelayError},
    hub::Notifier,
    presence::PresenceStore,
};

#[derive(Debug)]
enum ApiError {
    BadRequest { message: String },
    Rejected(JsonRejection),
    PresenceUnavailable(anyhow::Error),
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest { message: message.into() }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::Rejected(rejection)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::BadRequest { message } => {
                RelayError::new(ErrorCode::ValidationFailed, message).into_response()
            }
            Self::Rejected(rejection) => {
                RelayError::from_status(rejection.status(), rejection.body_text()).into_response()
            }
            Self::PresenceUnavailable(error) => {
                tracing::error!(error = ?error, "presence store failure");
                RelayError::from_code(ErrorCode::PresenceUnavailable).into_response()
            }
        }
    }
}

/// `POST /v1/heartbeat` and `GET /v1/presence/{user_id}`, both behind
/// bearer auth.
pub fn presence_router(store: PresenceStore, jwt_service: Arc<JwtAccessTokenService>) -> Router {
    Router::new()
        .route("/v1/heartbeat", post(presence::heartbeat))
        .route("/v1/presence/{user_id}", get(presence::presence_status))
        .with_state(store)
        .route_layer(middleware::from_fn_with_state(jwt_service, require_bearer_auth))
}

/// `POST /internal/v1/events`, guarded by the shared internal token.
pub fn events_router(notifier: Notifier, token: InternalToken) -> Router {
    Router::new()
        .route("/internal/v1/events", post(events::ingest_event))
        .with_state(notifier)
        .route_layer(middleware::from_fn_with_state(token, require_internal_token))
}
