//! Room membership.
//!
//! Membership is a set of (client, room) edges. Creating an edge calls
//! [`SubscriptionManager::acquire`]; removing one calls
//! [`SubscriptionManager::release`]. Joining a room twice does not create a
//! second edge. The rooms lock is always released before the subscription
//! manager is called.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use roomcast_core::ClientId;
use tracing::debug;

use super::subscriptions::SubscriptionManager;
use crate::websocket::client::Client;

type Members = HashMap<ClientId, Arc<Client>>;

/// Room → members map, driving the subscription refcounts.
pub struct RoomMembership {
    rooms: RwLock<HashMap<String, Members>>,
    subscriptions: Arc<SubscriptionManager>,
}

impl RoomMembership {
    /// Create an empty membership map over `subscriptions`.
    pub fn new(subscriptions: Arc<SubscriptionManager>) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            subscriptions,
        }
    }

    /// Add `client` to `room_id`. Returns `false` if it was already a member.
    pub async fn join(&self, client: &Arc<Client>, room_id: &str) -> bool {
        let created = self
            .rooms
            .write()
            .entry(room_id.to_owned())
            .or_default()
            .insert(client.id().clone(), Arc::clone(client))
            .is_none();

        if created {
            self.subscriptions.acquire(room_id).await;
            debug!(client_id = %client.id(), room_id, "joined room");
        } else {
            debug!(client_id = %client.id(), room_id, "already a member, join ignored");
        }
        created
    }

    /// Remove `client_id` from `room_id`. Returns `false` if it was not a member.
    pub async fn leave(&self, client_id: &ClientId, room_id: &str) -> bool {
        let removed = {
            let mut rooms = self.rooms.write();
            let Some(members) = rooms.get_mut(room_id) else {
                return false;
            };
            let removed = members.remove(client_id).is_some();
            if members.is_empty() {
                let _ = rooms.remove(room_id);
            }
            removed
        };

        if removed {
            self.subscriptions.release(room_id).await;
            debug!(client_id = %client_id, room_id, "left room");
        }
        removed
    }

    /// Remove `client_id` from every room. Returns the rooms it left.
    pub async fn leave_all(&self, client_id: &ClientId) -> Vec<String> {
        let left: Vec<String> = {
            let mut rooms = self.rooms.write();
            let mut left = Vec::new();
            rooms.retain(|room_id, members| {
                if members.remove(client_id).is_some() {
                    left.push(room_id.clone());
                }
                !members.is_empty()
            });
            left
        };

        for room_id in &left {
            self.subscriptions.release(room_id).await;
        }
        if !left.is_empty() {
            debug!(client_id = %client_id, rooms = left.len(), "left all rooms");
        }
        left
    }

    /// Point-in-time copy of a room's members.
    pub fn members(&self, room_id: &str) -> Vec<Arc<Client>> {
        self.rooms
            .read()
            .get(room_id)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether `client_id` is a member of `room_id`.
    pub fn is_member(&self, room_id: &str, client_id: &ClientId) -> bool {
        self.rooms
            .read()
            .get(room_id)
            .is_some_and(|members| members.contains_key(client_id))
    }

    /// Number of members in `room_id`.
    pub fn member_count(&self, room_id: &str) -> usize {
        self.rooms.read().get(room_id).map_or(0, HashMap::len)
    }

    /// Number of non-empty rooms.
    pub fn room_count(&self) -> usize {
        self.rooms.read().len()
    }

    /// The subscription manager this map drives.
    pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
        &self.subscriptions
    }
}
