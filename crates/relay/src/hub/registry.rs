// Connection registry: at most one live connection per identity.

use std::collections::HashMap;

use super::{Connection, ConnectionId, Identity};

#[derive(Debug, Default)]
pub(crate) struct ConnectionRegistry {
    connections: HashMap<Identity, Connection>,
}

impl ConnectionRegistry {
    /// Install `connection` for `identity`, handing back the connection it
    /// displaced (if any) so the caller can close it.
    pub(crate) fn insert(&mut self, identity: &str, connection: Connection) -> Option<Connection> {
        self.connections.insert(identity.to_owned(), connection)
    }

    pub(crate) fn remove(&mut self, identity: &str) -> Option<Connection> {
        self.connections.remove(identity)
    }

    /// Remove the entry only while it still points at `connection_id`.
    pub(crate) fn remove_if_current(
        &mut self,
        identity: &str,
        connection_id: ConnectionId,
    ) -> Option<Connection> {
        if self.is_current(identity, connection_id) {
            self.connections.remove(identity)
        } else {
            None
        }
    }

    /// Whether `connection_id` is still the live connection for `identity`.
    pub(crate) fn is_current(&self, identity: &str, connection_id: ConnectionId) -> bool {
        self.connections.get(identity).map(Connection::id) == Some(connection_id)
    }

    pub(crate) fn get(&self, identity: &str) -> Option<&Connection> {
        self.connections.get(identity)
    }

    pub(crate) fn contains(&self, identity: &str) -> bool {
        self.connections.contains_key(identity)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&Identity, &Connection)> {
        self.connections.iter()
    }

    pub(crate) fn len(&self) -> usize {
        self.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::ConnectionRegistry;
    use crate::hub::Connection;

    #[test]
    fn insert_returns_displaced_connection() {
        let mut registry = ConnectionRegistry::default();
        let (first, _first_rx) = Connection::channel(4);
        let (second, _second_rx) = Connection::channel(4);
        let first_id = first.id();
        let second_id = second.id();

        assert!(registry.insert("u1", first).is_none());
        let displaced = registry.insert("u1", second).expect("first connection is displaced");

        assert_eq!(displaced.id(), first_id);
        assert_eq!(registry.get("u1").map(Connection::id), Some(second_id));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn remove_if_current_ignores_stale_connection_ids() {
        let mut registry = ConnectionRegistry::default();
        let (first, _first_rx) = Connection::channel(4);
        let (second, _second_rx) = Connection::channel(4);
        let first_id = first.id();
        let second_id = second.id();
        registry.insert("u1", first);
        registry.insert("u1", second);

        assert!(!registry.is_current("u1", first_id));
        assert!(registry.is_current("u1", second_id));
        assert!(!registry.is_current("u2", second_id));
        assert!(registry.remove_if_current("u1", first_id).is_none());
        assert!(registry.contains("u1"));
        assert!(registry.remove_if_current("u1", second_id).is_some());
        assert!(!registry.contains("u1"));
    }

    #[test]
    fn remove_of_missing_identity_is_a_no_op() {
        let mut registry = ConnectionRegistry::default();
        assert!(registry.remove("ghost").is_none());
        assert_eq!(registry.iter().count(), 0);
    }
}
