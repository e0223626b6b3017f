use axum::extract::{Extension, Json, Path, State};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    auth::middleware::AuthenticatedUser,
    presence::{is_online_at, PresenceStatus, PresenceStore},
};

use super::ApiError;

#[derive(Debug, Serialize)]
pub(super) struct HeartbeatResponse {
    status: &'static str,
    last_seen: DateTime<Utc>,
    is_online: bool,
}

impl HeartbeatResponse {
    /// Same online window as `GET /v1/presence/{user_id}`.
    fn at(last_seen: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self { status: "ok", last_seen, is_online: is_online_at(Some(last_seen), now) }
    }
}

pub(super) async fn heartbeat(
    State(store): State<PresenceStore>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Result<Json<HeartbeatResponse>, ApiError> {
    let last_seen = store.touch(&user.user_id).await.map_err(ApiError::PresenceUnavailable)?;
    tracing::debug!(user_id = %user.user_id, "heartbeat recorded");

    Ok(Json(HeartbeatResponse::at(last_seen, Utc::now())))
}

pub(super) async fn presence_status(
    State(store): State<PresenceStore>,
    Path(user_id): Path<String>,
) -> Result<Json<PresenceStatus>, ApiError> {
    let status = store.status(&user_id).await.map_err(ApiError::PresenceUnavailable)?;
    Ok(Json(status))
}
