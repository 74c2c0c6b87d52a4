//! Live client connections attached to this node.

use std::sync::Arc;

use dashmap::DashMap;
use roomcast_core::ClientId;

use crate::websocket::client::Client;

/// Registry of every live connection. Pure bookkeeping.
#[derive(Default)]
pub struct ConnectionRegistry {
    clients: DashMap<ClientId, Arc<Client>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a client to the live set.
    pub fn register(&self, client: Arc<Client>) {
        let _ = self.clients.insert(client.id().clone(), client);
    }

    /// Remove a client. Removing an absent client is a no-op.
    pub fn deregister(&self, id: &ClientId) -> Option<Arc<Client>> {
        self.clients.remove(id).map(|(_, client)| client)
    }

    /// Look up a client.
    pub fn get(&self, id: &ClientId) -> Option<Arc<Client>> {
        self.clients.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Point-in-time copy of all live clients.
    pub fn snapshot(&self) -> Vec<Arc<Client>> {
        self.clients
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Number of live clients.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Whether no clients are connected.
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::client::testing::test_client;

    #[test]
    fn register_and_deregister() {
        let registry = ConnectionRegistry::new();
        let (client, _probe) = test_client("alice");
        registry.register(Arc::clone(&client));
        assert_eq!(registry.len(), 1);
        assert!(registry.get(client.id()).is_some());

        assert!(registry.deregister(client.id()).is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn deregister_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let (client, _probe) = test_client("alice");
        registry.register(Arc::clone(&client));
        assert!(registry.deregister(client.id()).is_some());
        assert!(registry.deregister(client.id()).is_none());
        assert!(registry.deregister(&ClientId::new()).is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn snapshot_during_concurrent_churn() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut tasks = Vec::new();
        for i in 0..8 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                for _ in 0..50 {
                    let (client, _probe) = test_client(&format!("user{i}"));
                    registry.register(Arc::clone(&client));
                    let _ = registry.snapshot();
                    let _ = registry.deregister(client.id());
                }
            }));
        }
        for _ in 0..50 {
            let _ = registry.snapshot().len();
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert!(registry.is_empty());
    }
}
