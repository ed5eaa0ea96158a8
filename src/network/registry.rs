use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::network::{Connection, ConnectionId};

/// Concurrent set of the live connections owned by a listening endpoint.
///
/// Accept and close paths touch it from arbitrary runtime threads; every
/// operation is atomic per connection identity.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Connection>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if a connection with the same identity is already
    /// registered.
    pub fn add(&self, connection: Connection) -> bool {
        match self.connections.entry(connection.id()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(connection);
                true
            }
        }
    }

    /// Returns whether the connection was registered. Removing an absent
    /// connection is a no-op, and so is removing a different connection that
    /// happens to carry a registered identity.
    pub fn remove(&self, connection: &Connection) -> bool {
        self.connections
            .remove_if(&connection.id(), |_, registered| registered.same_as(connection))
            .is_some()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn clear(&self) {
        self.connections.clear();
    }

    /// Point-in-time copy of the registered connections. Connections closed
    /// while the copy is being taken may or may not appear in it.
    pub fn snapshot(&self) -> Vec<Connection> {
        self.connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
