//! Live connection registry
//!
//! Sharded concurrent map (dashmap) from [`ConnectionId`] to the connection
//! handle. Written concurrently by every io thread; enumerated by shutdown.

use crate::transport::connection::{Connection, ConnectionId};
use dashmap::DashMap;
use std::sync::Arc;

/// Concurrent connection registry
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    /// Insert, replacing any stale entry under the same id (last writer wins).
    ///
    /// Returns the replaced entry, if any.
    pub fn put(&self, id: ConnectionId, connection: Arc<Connection>) -> Option<Arc<Connection>> {
        self.connections.insert(id, connection)
    }

    /// Remove if present
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.remove(&id).map(|(_, connection)| connection)
    }

    /// Remove only if the entry is still this exact handle.
    ///
    /// Used by a connection deregistering itself so it can never evict a
    /// newer entry that took over its id.
    pub fn remove_entry(&self, connection: &Arc<Connection>) -> bool {
        self.connections
            .remove_if(&connection.id(), |_, current| Arc::ptr_eq(current, connection))
            .is_some()
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    #[inline]
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    /// Point-in-time copy of the registered handles.
    ///
    /// Shard locks are held only while copying, never while visiting.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Visit every connection of a snapshot.
    ///
    /// Concurrent put/remove during the visit neither block nor disturb it.
    pub fn for_each<F>(&self, mut visitor: F)
    where
        F: FnMut(&Arc<Connection>),
    {
        for connection in self.snapshot() {
            visitor(&connection);
        }
    }

    /// Close every registered connection.
    ///
    /// Returns how many handles were visited. Each close is independent.
    pub fn close_all(&self) -> usize {
        let mut visited = 0;
        self.for_each(|connection| {
            visited += 1;
            connection.close();
        });
        visited
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::connection::test_connection;
    use proptest::prelude::*;
    use std::collections::{HashMap, HashSet};
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_put_get_remove() {
        let registry = ConnectionRegistry::new();
        let parent = CancellationToken::new();
        let (conn, _rx) = test_connection(&parent);

        assert!(registry.put(conn.id(), Arc::clone(&conn)).is_none());
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(conn.id()));
        assert!(Arc::ptr_eq(&registry.get(conn.id()).unwrap(), &conn));

        assert!(registry.remove(conn.id()).is_some());
        // Removing an absent id is not an error
        assert!(registry.remove(conn.id()).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_put_overwrites_stale_entry() {
        let registry = ConnectionRegistry::new();
        let parent = CancellationToken::new();
        let (old, _rx1) = test_connection(&parent);
        let (new, _rx2) = test_connection(&parent);

        let id = old.id();
        registry.put(id, Arc::clone(&old));
        let replaced = registry.put(id, Arc::clone(&new)).unwrap();

        assert!(Arc::ptr_eq(&replaced, &old));
        assert!(Arc::ptr_eq(&registry.get(id).unwrap(), &new));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_entry_keeps_newer_handle() {
        let registry = ConnectionRegistry::new();
        let parent = CancellationToken::new();
        let (old, _rx1) = test_connection(&parent);
        let (new, _rx2) = test_connection(&parent);

        // `new` took over old's id
        registry.put(old.id(), Arc::clone(&new));
        assert!(!registry.remove_entry(&old));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_close_all_closes_each_once() {
        let registry = ConnectionRegistry::new();
        let parent = CancellationToken::new();
        let connections: Vec<_> = (0..10).map(|_| test_connection(&parent)).collect();
        for (conn, _) in &connections {
            registry.put(conn.id(), Arc::clone(conn));
        }

        assert_eq!(registry.close_all(), 10);
        for (conn, _) in &connections {
            assert!(!conn.is_open());
            // Already closed: a second close is a no-op
            assert!(!conn.close());
        }
    }

    #[test]
    fn test_for_each_tolerates_concurrent_mutation() {
        let registry = Arc::new(ConnectionRegistry::new());
        let parent = CancellationToken::new();
        for _ in 0..100 {
            let (conn, _rx) = test_connection(&parent);
            registry.put(conn.id(), conn);
        }

        let writer = {
            let registry = Arc::clone(&registry);
            let parent = parent.clone();
            std::thread::spawn(move || {
                for _ in 0..1000 {
                    let (conn, _rx) = test_connection(&parent);
                    let id = conn.id();
                    registry.put(id, conn);
                    registry.remove(id);
                }
            })
        };

        let mut visited = 0;
        for _ in 0..10 {
            registry.for_each(|conn| {
                // Visitor may itself mutate the registry
                registry.remove(conn.id());
                visited += 1;
            });
        }
        writer.join().unwrap();

        assert!(visited >= 100);
        assert!(registry.is_empty());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Put(u8),
        Remove(u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..16).prop_map(Op::Put),
            (0u8..16).prop_map(Op::Remove),
        ]
    }

    proptest! {
        #[test]
        fn prop_enumeration_matches_model(ops in proptest::collection::vec(op(), 0..200)) {
            let registry = ConnectionRegistry::new();
            let parent = CancellationToken::new();
            let mut model: HashMap<ConnectionId, Arc<Connection>> = HashMap::new();
            let mut receivers = Vec::new();

            for op in ops {
                match op {
                    Op::Put(key) => {
                        let (conn, rx) = test_connection(&parent);
                        receivers.push(rx);
                        let id = ConnectionId(u64::from(key));
                        registry.put(id, Arc::clone(&conn));
                        model.insert(id, conn);
                    }
                    Op::Remove(key) => {
                        let id = ConnectionId(u64::from(key));
                        registry.remove(id);
                        model.remove(&id);
                    }
                }
            }

            prop_assert_eq!(registry.len(), model.len());
            for (id, expected) in &model {
                let actual = registry.get(*id);
                prop_assert!(actual.is_some());
                prop_assert!(Arc::ptr_eq(&actual.unwrap(), expected));
            }
            let mut visited = HashSet::new();
            let mut visits = 0;
            registry.for_each(|connection| {
                visits += 1;
                visited.insert(connection.id());
            });
            prop_assert_eq!(visits, model.len());
            prop_assert_eq!(visited, model.keys().copied().collect::<HashSet<_>>());
        }
    }
}
