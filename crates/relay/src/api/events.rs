use axum::{
    extract::{rejection::JsonRejection, Json, State},
    http::StatusCode,
};
use reviewbox_common::protocol::ws::ServerMessage;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::hub::Notifier;

use super::ApiError;

/// Domain events emitted by the sheet, image and points services.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusinessEvent {
    /// Pushed to the sheet's subscribers, minus the actor.
    SheetUpdate {
        sheet_id: String,
        action: String,
        #[serde(default)]
        data: Value,
        #[serde(default)]
        actor_id: Option<String>,
    },
    ImageUpdate {
        sheet_id: String,
        action: String,
        #[serde(default)]
        data: Value,
        #[serde(default)]
        actor_id: Option<String>,
    },
    /// Pushed to one user only.
    PointsUpdate { user_id: String, points: i64, reason: String },
    /// Pushed to every live connection.
    Broadcast {
        message: ServerMessage,
        #[serde(default)]
        exclude: Option<String>,
    },
}

impl BusinessEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SheetUpdate { .. } => "sheet_update",
            Self::ImageUpdate { .. } => "image_update",
            Self::PointsUpdate { .. } => "points_update",
            Self::Broadcast { .. } => "broadcast",
        }
    }

    fn validate(&self) -> Result<(), &'static str> {
        match self {
            Self::SheetUpdate { sheet_id, action, .. } | Self::ImageUpdate { sheet_id, action, .. } => {
                if sheet_id.is_empty() {
                    return Err("sheet_id must not be empty");
                }
                if action.is_empty() {
                    return Err("action must not be empty");
                }
                Ok(())
            }
            Self::PointsUpdate { user_id, .. } if user_id.is_empty() => {
                Err("user_id must not be empty")
            }
            Self::PointsUpdate { .. } => Ok(()),
            Self::Broadcast { message, .. } => match message {
                ServerMessage::SheetUpdate { .. }
                | ServerMessage::ImageUpdate { .. }
                | ServerMessage::PointsUpdate { .. } => Ok(()),
                _ => Err("broadcast message must be a push event"),
            },
        }
    }

    /// Fan the event out through `notifier`. Returns the number of
    /// connections it was handed to.
    pub async fn dispatch(self, notifier: &Notifier) -> usize {
        match self {
            Self::SheetUpdate { sheet_id, action, data, actor_id } => {
                notifier.notify_sheet_update(&sheet_id, &action, data, actor_id.as_deref()).await
            }
            Self::ImageUpdate { sheet_id, action, data, actor_id } => {
                notifier.notify_image_update(&sheet_id, &action, data, actor_id.as_deref()).await
            }
            Self::PointsUpdate { user_id, points, reason } => {
                notifier.notify_points_update(&user_id, points, &reason).await
            }
            Self::Broadcast { message, exclude } => {
                notifier.notify_all(message, exclude.as_deref()).await
            }
        }
    }
}

pub(super) async fn ingest_event(
    State(notifier): State<Notifier>,
    payload: Result<Json<BusinessEvent>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let Json(event) = payload?;
    event.validate().map_err(ApiError::bad_request)?;

    let kind = event.kind();
    let delivered = event.dispatch(&notifier).await;
    tracing::info!(event = kind, delivered, "business event dispatched");

    Ok((StatusCode::ACCEPTED, Json(json!({ "delivered": delivered }))))
}
