// Real-time hub: live connections per identity plus topic subscriptions.
//
// Registry and topic index share one lock so that disconnect cleanup is
// atomic with respect to subscribe and fan-out. Nothing blocks on a socket
// while the lock is held; messages are handed to per-connection bounded
// queues with `try_send`.

mod notify;
mod registry;
mod topics;

pub use notify::Notifier;

use std::collections::HashSet;
use std::sync::Arc;

use reviewbox_common::protocol::ws::ServerMessage;
use thiserror::Error;
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    watch, RwLock,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::metrics;
use registry::ConnectionRegistry;
use topics::TopicIndex;

pub type Identity = String;
pub type Topic = String;
pub type ConnectionId = Uuid;

pub const DEFAULT_OUTBOUND_CAPACITY: usize = 64;

/// Why the hub asked a connection to shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// A newer connection registered for the same identity.
    Superseded,
    /// The outbound queue overflowed or was closed.
    Lagging,
    /// Removed through [`Hub::unregister`].
    Evicted,
}

impl CloseReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Superseded => "superseded",
            Self::Lagging => "lagging",
            Self::Evicted => "evicted",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PushError {
    #[error("outbound queue is full")]
    QueueFull,
    #[error("connection is closed")]
    Closed,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubscribeError {
    #[error("identity has no live connection")]
    NotConnected,
    #[error("topic must not be empty")]
    EmptyTopic,
}

/// Hub-side handle of one live channel. Cheap to clone; the socket task owns
/// the matching [`ConnectionReceiver`].
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    outbound: mpsc::Sender<Arc<ServerMessage>>,
    close: Arc<watch::Sender<Option<CloseReason>>>,
}

/// Socket-task side of a connection: queued pushes and the close signal.
#[derive(Debug)]
pub struct ConnectionReceiver {
    pub id: ConnectionId,
    pub outbound: mpsc::Receiver<Arc<ServerMessage>>,
    pub close: watch::Receiver<Option<CloseReason>>,
}

impl Connection {
    pub fn channel(capacity: usize) -> (Self, ConnectionReceiver) {
        let (outbound_sender, outbound_receiver) = mpsc::channel(capacity.max(1));
        let (close_sender, close_receiver) = watch::channel(None);
        let id = Uuid::new_v4();
        (
            Self { id, outbound: outbound_sender, close: Arc::new(close_sender) },
            ConnectionReceiver { id, outbound: outbound_receiver, close: close_receiver },
        )
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn push(&self, message: Arc<ServerMessage>) -> Result<(), PushError> {
        self.outbound.try_send(message).map_err(|error| match error {
            TrySendError::Full(_) => PushError::QueueFull,
            TrySendError::Closed(_) => PushError::Closed,
        })
    }

    /// Ask the owning socket task to close. Never fails; a task that already
    /// exited simply never observes the signal.
    pub fn close(&self, reason: CloseReason) {
        self.close.send_replace(Some(reason));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct HubStats {
    pub connections: usize,
    pub topics: usize,
}

#[derive(Debug, Default)]
struct HubState {
    registry: ConnectionRegistry,
    topics: TopicIndex,
}

/// Shared connection registry and topic index. Construct once and pass
/// clones to the socket handler and to event producers.
#[derive(Debug, Clone)]
pub struct Hub {
    state: Arc<RwLock<HubState>>,
    outbound_capacity: usize,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(DEFAULT_OUTBOUND_CAPACITY)
    }
}

impl Hub {
    pub fn new(outbound_capacity: usize) -> Self {
        Self { state: Arc::new(RwLock::new(HubState::default())), outbound_capacity }
    }

    /// Create a connection sized with this hub's outbound capacity.
    pub fn open_connection(&self) -> (Connection, ConnectionReceiver) {
        Connection::channel(self.outbound_capacity)
    }

    /// Install `connection` as the live channel for `identity`. A previous
    /// connection is closed and its subscriptions dropped, so the new client
    /// starts from an empty subscription set.
    pub async fn register(&self, identity: &str, connection: Connection) {
        let connection_id = connection.id();
        let (displaced, stats) = {
            let mut guard = self.state.write().await;
            let displaced = guard.registry.insert(identity, connection);
            if displaced.is_some() {
                guard.topics.purge(identity);
            }
            (displaced, stats_of(&guard))
        };

        if let Some(previous) = displaced {
            previous.close(CloseReason::Superseded);
            info!(
                user_id = %identity,
                previous_connection_id = %previous.id(),
                connection_id = %connection_id,
                "replaced existing connection"
            );
        }
        publish_stats(stats);
    }

    /// Remove whatever connection `identity` has and drop its subscriptions.
    /// Returns false when nothing was registered.
    pub async fn unregister(&self, identity: &str) -> bool {
        let (removed, stats) = {
            let mut guard = self.state.write().await;
            let removed = guard.registry.remove(identity);
            guard.topics.purge(identity);
            (removed, stats_of(&guard))
        };
        publish_stats(stats);

        match removed {
            Some(connection) => {
                connection.close(CloseReason::Evicted);
                true
            }
            None => false,
        }
    }

    /// Compare-and-remove used by a connection's own task on exit. A stale
    /// connection (already superseded) leaves the registry untouched.
    pub async fn release(&self, identity: &str, connection_id: ConnectionId) -> bool {
        let (released, stats) = {
            let mut guard = self.state.write().await;
            let released = guard.registry.remove_if_current(identity, connection_id).is_some();
            if released {
                guard.topics.purge(identity);
            }
            (released, stats_of(&guard))
        };

        if released {
            publish_stats(stats);
            debug!(user_id = %identity, connection_id = %connection_id, "connection released");
        }
        released
    }

    /// Best-effort push to one identity. Returns whether a live connection
    /// existed; a connection whose queue refuses the message is dropped as
    /// lagging, but still counts.
    pub async fn send(&self, identity: &str, message: ServerMessage) -> bool {
        let targets = self.identity_targets(identity).await;
        if targets.is_empty() {
            return false;
        }
        self.deliver(targets, Arc::new(message)).await;
        true
    }

    /// Subscribe on behalf of `connection_id`. A connection that has been
    /// superseded or released gets [`SubscribeError::NotConnected`] and
    /// cannot touch its replacement's subscriptions.
    pub async fn subscribe(
        &self,
        identity: &str,
        connection_id: ConnectionId,
        topic: &str,
    ) -> Result<(), SubscribeError> {
        if topic.is_empty() {
            return Err(SubscribeError::EmptyTopic);
        }

        let stats = {
            let mut guard = self.state.write().await;
            if !guard.registry.is_current(identity, connection_id) {
                return Err(SubscribeError::NotConnected);
            }
            guard.topics.subscribe(identity, topic);
            stats_of(&guard)
        };
        publish_stats(stats);
        debug!(user_id = %identity, topic = %topic, "subscribed");
        Ok(())
    }

    /// Idempotent; `Ok(true)` when `identity` was subscribed. Same
    /// connection check as [`Hub::subscribe`].
    pub async fn unsubscribe(
        &self,
        identity: &str,
        connection_id: ConnectionId,
        topic: &str,
    ) -> Result<bool, SubscribeError> {
        if topic.is_empty() {
            return Err(SubscribeError::EmptyTopic);
        }

        let (removed, stats) = {
            let mut guard = self.state.write().await;
            if !guard.registry.is_current(identity, connection_id) {
                return Err(SubscribeError::NotConnected);
            }
            let removed = guard.topics.unsubscribe(identity, topic);
            (removed, stats_of(&guard))
        };
        publish_stats(stats);
        Ok(removed)
    }

    pub async fn members(&self, topic: &str) -> HashSet<Identity> {
        self.state.read().await.topics.members(topic)
    }

    pub async fn topics_for(&self, identity: &str) -> Vec<Topic> {
        self.state.read().await.topics.topics_for(identity)
    }

    pub async fn is_connected(&self, identity: &str) -> bool {
        self.state.read().await.registry.contains(identity)
    }

    pub async fn connection_id(&self, identity: &str) -> Option<ConnectionId> {
        self.state.read().await.registry.get(identity).map(Connection::id)
    }

    pub async fn stats(&self) -> HubStats {
        stats_of(&*self.state.read().await)
    }

    async fn identity_targets(&self, identity: &str) -> Vec<(Identity, Connection)> {
        let guard = self.state.read().await;
        guard
            .registry
            .get(identity)
            .map(|connection| (identity.to_owned(), connection.clone()))
            .into_iter()
            .collect()
    }

    /// Snapshot the connections subscribed to `topic`, minus `exclude`.
    async fn topic_targets(&self, topic: &str, exclude: Option<&str>) -> Vec<(Identity, Connection)> {
        let guard = self.state.read().await;
        guard
            .topics
            .members_iter(topic)
            .filter(|identity| exclude != Some(identity.as_str()))
            .filter_map(|identity| {
                guard.registry.get(identity).map(|connection| (identity.clone(), connection.clone()))
            })
            .collect()
    }

    async fn all_targets(&self, exclude: Option<&str>) -> Vec<(Identity, Connection)> {
        let guard = self.state.read().await;
        guard
            .registry
            .iter()
            .filter(|(identity, _)| exclude != Some(identity.as_str()))
            .map(|(identity, connection)| (identity.clone(), connection.clone()))
            .collect()
    }

    /// Hand `message` to every target without holding the hub lock. Targets
    /// whose queue is full or closed are dropped from the hub and told to
    /// close; the rest are unaffected.
    async fn deliver(&self, targets: Vec<(Identity, Connection)>, message: Arc<ServerMessage>) -> usize {
        let mut delivered = 0;
        let mut failed = Vec::new();

        for (identity, connection) in targets {
            match connection.push(Arc::clone(&message)) {
                Ok(()) => delivered += 1,
                Err(error) => {
                    warn!(
                        user_id = %identity,
                        connection_id = %connection.id(),
                        message_type = message.kind(),
                        error = %error,
                        "dropping connection that cannot accept pushes"
                    );
                    failed.push((identity, connection));
                }
            }
        }

        for (identity, connection) in failed {
            self.release(&identity, connection.id()).await;
            connection.close(CloseReason::Lagging);
            metrics::increment_dropped_connections(CloseReason::Lagging.as_str());
        }

        delivered
    }
}

fn stats_of(state: &HubState) -> HubStats {
    HubStats { connections: state.registry.len(), topics: state.topics.topic_count() }
}

fn publish_stats(stats: HubStats) {
    metrics::set_hub_gauges(stats.connections, stats.topics);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn image_update(action: &str) -> ServerMessage {
        ServerMessage::ImageUpdate {
            action: action.to_string(),
            sheet_id: "sheet-42".to_string(),
            data: json!({}),
        }
    }

    async fn connect(hub: &Hub, identity: &str) -> ConnectionReceiver {
        let (connection, receiver) = hub.open_connection();
        hub.register(identity, connection).await;
        receiver
    }

    #[tokio::test]
    async fn second_registration_closes_the_first() {
        let hub = Hub::default();
        let mut first = connect(&hub, "u1").await;
        let first_id = hub.connection_id("u1").await.expect("u1 is connected");
        let _second = connect(&hub, "u1").await;

        assert_eq!(hub.stats().await.connections, 1);
        assert_ne!(hub.connection_id("u1").await, Some(first_id));
        first.close.changed().await.expect("close signal should be observable");
        assert_eq!(*first.close.borrow(), Some(CloseReason::Superseded));
    }

    #[tokio::test]
    async fn replacement_starts_with_no_subscriptions() {
        let hub = Hub::default();
        let first = connect(&hub, "u1").await;
        hub.subscribe("u1", first.id, "sheet-1").await.expect("subscribe should succeed");

        let _second = connect(&hub, "u1").await;

        assert!(hub.members("sheet-1").await.is_empty());
        assert!(hub.topics_for("u1").await.is_empty());
    }

    #[tokio::test]
    async fn superseded_connection_cannot_change_replacement_subscriptions() {
        let hub = Hub::default();
        let first = connect(&hub, "u1").await;
        let second = connect(&hub, "u1").await;
        hub.subscribe("u1", second.id, "sheet-kept").await.expect("subscribe should succeed");

        assert_eq!(
            hub.subscribe("u1", first.id, "sheet-stale").await,
            Err(SubscribeError::NotConnected)
        );
        assert_eq!(
            hub.unsubscribe("u1", first.id, "sheet-kept").await,
            Err(SubscribeError::NotConnected)
        );

        assert!(hub.members("sheet-stale").await.is_empty());
        assert_eq!(hub.topics_for("u1").await, vec!["sheet-kept".to_string()]);
    }

    #[tokio::test]
    async fn unsubscribe_reports_previous_membership() {
        let hub = Hub::default();
        let receiver = connect(&hub, "u1").await;
        hub.subscribe("u1", receiver.id, "sheet-1").await.expect("subscribe should succeed");

        assert_eq!(hub.unsubscribe("u1", receiver.id, "sheet-1").await, Ok(true));
        assert_eq!(hub.unsubscribe("u1", receiver.id, "sheet-1").await, Ok(false));
        assert_eq!(hub.unsubscribe("u1", receiver.id, "").await, Err(SubscribeError::EmptyTopic));
        assert_eq!(hub.stats().await.topics, 0);
    }

    #[tokio::test]
    async fn unregister_purges_subscriptions_and_is_idempotent() {
        let hub = Hub::default();
        let receiver = connect(&hub, "u1").await;
        hub.subscribe("u1", receiver.id, "sheet-1").await.expect("subscribe should succeed");
        hub.subscribe("u1", receiver.id, "sheet-2").await.expect("subscribe should succeed");

        assert!(hub.unregister("u1").await);
        assert!(!hub.unregister("u1").await);

        assert!(hub.members("sheet-1").await.is_empty());
        assert!(hub.members("sheet-2").await.is_empty());
        assert_eq!(hub.stats().await, HubStats { connections: 0, topics: 0 });
        assert_eq!(*receiver.close.borrow(), Some(CloseReason::Evicted));
    }

    #[tokio::test]
    async fn stale_release_does_not_evict_replacement() {
        let hub = Hub::default();
        let first = connect(&hub, "u1").await;
        let second = connect(&hub, "u1").await;
        hub.subscribe("u1", second.id, "sheet-1").await.expect("subscribe should succeed");

        assert!(!hub.release("u1", first.id).await);

        assert!(hub.is_connected("u1").await);
        assert_eq!(hub.members("sheet-1").await.len(), 1);
    }

    #[tokio::test]
    async fn subscribe_requires_live_connection() {
        let hub = Hub::default();
        let (unregistered, _unregistered_rx) = hub.open_connection();
        assert_eq!(
            hub.subscribe("u1", unregistered.id(), "sheet-1").await,
            Err(SubscribeError::NotConnected)
        );
        assert!(hub.members("sheet-1").await.is_empty());

        let receiver = connect(&hub, "u1").await;
        assert_eq!(hub.subscribe("u1", receiver.id, "").await, Err(SubscribeError::EmptyTopic));
    }

    #[tokio::test]
    async fn send_to_missing_identity_returns_false() {
        let hub = Hub::default();
        assert!(!hub.send("ghost", ServerMessage::Pong).await);
    }

    #[tokio::test]
    async fn send_delivers_into_outbound_queue() {
        let hub = Hub::default();
        let mut receiver = connect(&hub, "u1").await;

        assert!(hub.send("u1", ServerMessage::Pong).await);
        let message = receiver.outbound.recv().await.expect("message should be queued");
        assert_eq!(*message, ServerMessage::Pong);
    }

    #[tokio::test]
    async fn full_queue_drops_only_the_slow_connection() {
        let hub = Hub::new(1);
        let slow = connect(&hub, "slow").await;
        let mut fast = connect(&hub, "fast").await;
        hub.subscribe("slow", slow.id, "sheet-42").await.expect("subscribe should succeed");
        hub.subscribe("fast", fast.id, "sheet-42").await.expect("subscribe should succeed");

        let first = hub.topic_targets("sheet-42", None).await;
        assert_eq!(hub.deliver(first, Arc::new(image_update("uploaded"))).await, 2);
        fast.outbound.recv().await.expect("fast client drains its queue");

        let second = hub.topic_targets("sheet-42", None).await;
        assert_eq!(hub.deliver(second, Arc::new(image_update("adopted"))).await, 1);

        assert!(!hub.is_connected("slow").await);
        assert!(hub.is_connected("fast").await);
        assert_eq!(hub.members("sheet-42").await, HashSet::from(["fast".to_string()]));
        assert_eq!(*slow.close.borrow(), Some(CloseReason::Lagging));
    }

    #[tokio::test]
    async fn closed_receiver_is_treated_as_disconnect() {
        let hub = Hub::default();
        let receiver = connect(&hub, "u1").await;
        hub.subscribe("u1", receiver.id, "sheet-1").await.expect("subscribe should succeed");
        drop(receiver);

        assert!(hub.send("u1", ServerMessage::Pong).await, "a live connection existed");
        assert!(!hub.is_connected("u1").await);
        assert!(hub.members("sheet-1").await.is_empty());
    }

    #[tokio::test]
    async fn concurrent_registrations_leave_one_live_connection() {
        let hub = Hub::default();
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let hub = hub.clone();
            tasks.push(tokio::spawn(async move {
                let (connection, receiver) = hub.open_connection();
                hub.register("u1", connection).await;
                receiver
            }));
        }

        let mut receivers = Vec::new();
        for task in tasks {
            receivers.push(task.await.expect("registration task should finish"));
        }

        assert_eq!(hub.stats().await.connections, 1);
        let superseded = receivers
            .iter()
            .filter(|receiver| *receiver.close.borrow() == Some(CloseReason::Superseded))
            .count();
        assert_eq!(superseded, 15);
    }
}
