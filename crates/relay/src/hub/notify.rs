// Fan-out API for business collaborators (sheet, image and points routers).

use std::sync::Arc;

use reviewbox_common::protocol::ws::ServerMessage;
use tracing::debug;

use super::Hub;

/// Fire-and-forget delivery on top of the [`Hub`]. Every call returns the
/// number of connections the message was handed to; callers are free to
/// ignore it. Delivery failures are handled inside the hub and never
/// surface here.
#[derive(Debug, Clone)]
pub struct Notifier {
    hub: Hub,
}

impl Notifier {
    pub fn new(hub: Hub) -> Self {
        Self { hub }
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub async fn notify_one(&self, identity: &str, message: ServerMessage) -> usize {
        let targets = self.hub.identity_targets(identity).await;
        self.hub.deliver(targets, Arc::new(message)).await
    }

    /// Deliver to every subscriber of `topic` except `exclude`, usually the
    /// actor whose change produced the event.
    pub async fn notify_topic(
        &self,
        topic: &str,
        message: ServerMessage,
        exclude: Option<&str>,
    ) -> usize {
        let targets = self.hub.topic_targets(topic, exclude).await;
        if targets.is_empty() {
            return 0;
        }

        let kind = message.kind();
        let delivered = self.hub.deliver(targets, Arc::new(message)).await;
        debug!(topic = %topic, message_type = kind, delivered, "topic notification sent");
        delivered
    }

    pub async fn notify_all(&self, message: ServerMessage, exclude: Option<&str>) -> usize {
        let targets = self.hub.all_targets(exclude).await;
        let kind = message.kind();
        let delivered = self.hub.deliver(targets, Arc::new(message)).await;
        debug!(message_type = kind, delivered, "broadcast sent");
        delivered
    }

    pub async fn notify_sheet_update(
        &self,
        sheet_id: &str,
        action: &str,
        data: serde_json::Value,
        actor_id: Option<&str>,
    ) -> usize {
        let message = ServerMessage::SheetUpdate {
            action: action.to_owned(),
            sheet_id: sheet_id.to_owned(),
            data,
        };
        self.notify_topic(sheet_id, message, actor_id).await
    }

    pub async fn notify_image_update(
        &self,
        sheet_id: &str,
        action: &str,
        data: serde_json::Value,
        actor_id: Option<&str>,
    ) -> usize {
        let message = ServerMessage::ImageUpdate {
            action: action.to_owned(),
            sheet_id: sheet_id.to_owned(),
            data,
        };
        self.notify_topic(sheet_id, message, actor_id).await
    }

    pub async fn notify_points_update(&self, user_id: &str, points: i64, reason: &str) -> usize {
        self.notify_one(user_id, ServerMessage::PointsUpdate { points, reason: reason.to_owned() })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::Notifier;
    use crate::hub::{ConnectionReceiver, Hub};
    use reviewbox_common::protocol::ws::ServerMessage;
    use serde_json::json;
    use std::collections::HashSet;

    async fn connect(hub: &Hub, identity: &str) -> ConnectionReceiver {
        let (connection, receiver) = hub.open_connection();
        hub.register(identity, connection).await;
        receiver
    }

    #[tokio::test]
    async fn topic_notification_skips_excluded_actor() {
        let hub = Hub::default();
        let notifier = Notifier::new(hub.clone());
        let mut u1 = connect(&hub, "u1").await;
        let mut u2 = connect(&hub, "u2").await;
        hub.subscribe("u1", u1.id, "sheet-42").await.expect("u1 subscribes");
        hub.subscribe("u2", u2.id, "sheet-42").await.expect("u2 subscribes");

        let delivered = notifier
            .notify_topic(
                "sheet-42",
                ServerMessage::ImageUpdate {
                    action: "adopted".into(),
                    sheet_id: "sheet-42".into(),
                    data: json!({}),
                },
                Some("u1"),
            )
            .await;

        assert_eq!(delivered, 1);
        let received = u2.outbound.try_recv().expect("u2 receives the push");
        assert!(matches!(&*received, ServerMessage::ImageUpdate { action, .. } if action == "adopted"));
        assert!(u1.outbound.try_recv().is_err());

        hub.unregister("u1").await;
        assert_eq!(hub.members("sheet-42").await, HashSet::from(["u2".to_string()]));
    }

    #[tokio::test]
    async fn topic_notifications_arrive_in_issue_order() {
        let hub = Hub::default();
        let notifier = Notifier::new(hub.clone());
        let mut receiver = connect(&hub, "u1").await;
        hub.subscribe("u1", receiver.id, "sheet-1").await.expect("subscribe should succeed");

        for action in ["created", "updated", "deleted"] {
            notifier.notify_sheet_update("sheet-1", action, json!({}), None).await;
        }

        let mut actions = Vec::new();
        while let Ok(message) = receiver.outbound.try_recv() {
            if let ServerMessage::SheetUpdate { action, .. } = &*message {
                actions.push(action.clone());
            }
        }
        assert_eq!(actions, vec!["created", "updated", "deleted"]);
    }

    #[tokio::test]
    async fn notify_one_is_a_no_op_for_offline_identity() {
        let notifier = Notifier::new(Hub::default());
        assert_eq!(notifier.notify_points_update("offline", 10, "adopted").await, 0);
    }

    #[tokio::test]
    async fn points_update_reaches_only_its_user() {
        let hub = Hub::default();
        let notifier = Notifier::new(hub.clone());
        let mut u1 = connect(&hub, "u1").await;
        let mut u2 = connect(&hub, "u2").await;

        assert_eq!(notifier.notify_points_update("u1", 30, "image adopted").await, 1);

        let received = u1.outbound.try_recv().expect("u1 receives points update");
        assert_eq!(
            *received,
            ServerMessage::PointsUpdate { points: 30, reason: "image adopted".into() }
        );
        assert!(u2.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn notify_all_honours_exclusion() {
        let hub = Hub::default();
        let notifier = Notifier::new(hub.clone());
        let mut u1 = connect(&hub, "u1").await;
        let mut u2 = connect(&hub, "u2").await;
        let mut u3 = connect(&hub, "u3").await;

        assert_eq!(notifier.notify_all(ServerMessage::Pong, Some("u2")).await, 2);

        assert!(u1.outbound.try_recv().is_ok());
        assert!(u2.outbound.try_recv().is_err());
        assert!(u3.outbound.try_recv().is_ok());
    }

    #[tokio::test]
    async fn unknown_topic_delivers_nothing() {
        let hub = Hub::default();
        let notifier = Notifier::new(hub.clone());
        let mut receiver = connect(&hub, "u1").await;

        assert_eq!(notifier.notify_image_update("nobody-here", "uploaded", json!({}), None).await, 0);
        assert!(receiver.outbound.try_recv().is_err());
    }
}
