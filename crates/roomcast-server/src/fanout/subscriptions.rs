//! Refcounted room → backbone topic subscriptions.
//!
//! The only component that opens or closes backbone subscriptions. An entry
//! exists for a room exactly while the room has open membership edges; its
//! refcount is the number of those edges. A failed subscribe keeps the
//! entry without a handle, and the next acquire for that room retries.

use std::collections::HashMap;
use std::sync::Arc;

use metrics::{counter, gauge};
use roomcast_backbone::{Backbone, FrameSender, SubscriptionHandle};
use roomcast_core::room_topic;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::metrics::{BACKBONE_SUBSCRIPTION_ERRORS_TOTAL, ROOM_SUBSCRIPTIONS_ACTIVE};

struct RoomSubscription {
    handle: Option<SubscriptionHandle>,
    refcount: usize,
}

/// Refcounted backbone subscriptions, one per locally populated room.
pub struct SubscriptionManager {
    backbone: Arc<dyn Backbone>,
    deliver: FrameSender,
    subs: Mutex<HashMap<String, RoomSubscription>>,
}

impl SubscriptionManager {
    /// Subscriptions deliver inbound frames into `deliver`.
    pub fn new(backbone: Arc<dyn Backbone>, deliver: FrameSender) -> Self {
        Self {
            backbone,
            deliver,
            subs: Mutex::new(HashMap::new()),
        }
    }

    /// Count one more membership edge for `room_id`, subscribing if needed.
    ///
    /// Backbone failures are logged; the refcount is recorded regardless.
    pub async fn acquire(&self, room_id: &str) {
        let mut subs = self.subs.lock().await;
        let entry = subs.entry(room_id.to_owned()).or_insert(RoomSubscription {
            handle: None,
            refcount: 0,
        });
        entry.refcount += 1;

        if entry.handle.is_none() {
            let topic = room_topic(room_id);
            match self.backbone.subscribe(&topic, self.deliver.clone()).await {
                Ok(handle) => {
                    debug!(room_id, topic, "room subscription opened");
                    entry.handle = Some(handle);
                    gauge!(ROOM_SUBSCRIPTIONS_ACTIVE).increment(1.0);
                }
                Err(e) => {
                    warn!(room_id, topic, error = %e, "backbone subscribe failed, room is local-only until next join");
                    counter!(BACKBONE_SUBSCRIPTION_ERRORS_TOTAL, "op" => "subscribe").increment(1);
                }
            }
        }
    }

    /// Count one fewer membership edge; unsubscribe when none remain.
    ///
    /// Releasing a room with no entry is a no-op.
    pub async fn release(&self, room_id: &str) {
        let mut subs = self.subs.lock().await;
        let Some(entry) = subs.get_mut(room_id) else {
            debug!(room_id, "release for room without subscription, ignoring");
            return;
        };
        entry.refcount = entry.refcount.saturating_sub(1);
        if entry.refcount > 0 {
            return;
        }

        let handle = subs.remove(room_id).and_then(|entry| entry.handle);
        if let Some(handle) = handle {
            gauge!(ROOM_SUBSCRIPTIONS_ACTIVE).decrement(1.0);
            if self.backbone.is_closed() {
                debug!(room_id, "backbone already closed, dropping subscription");
                return;
            }
            let topic = handle.topic().to_owned();
            match self.backbone.unsubscribe(handle).await {
                Ok(()) => debug!(room_id, topic, "room subscription closed"),
                Err(e) => {
                    warn!(room_id, topic, error = %e, "backbone unsubscribe failed");
                    counter!(BACKBONE_SUBSCRIPTION_ERRORS_TOTAL, "op" => "unsubscribe").increment(1);
                }
            }
        }
    }

    /// Current refcount for `room_id` (0 when absent).
    pub async fn refcount(&self, room_id: &str) -> usize {
        self.subs
            .lock()
            .await
            .get(room_id)
            .map_or(0, |entry| entry.refcount)
    }

    /// Whether `room_id` has an open backbone subscription.
    pub async fn is_subscribed(&self, room_id: &str) -> bool {
        self.subs
            .lock()
            .await
            .get(room_id)
            .is_some_and(|entry| entry.handle.is_some())
    }

    /// Number of subscription entries.
    pub async fn len(&self) -> usize {
        self.subs.lock().await.len()
    }

    /// Whether there are no entries.
    pub async fn is_empty(&self) -> bool {
        self.subs.lock().await.is_empty()
    }

    /// `(room, refcount)` for every entry.
    pub async fn snapshot(&self) -> Vec<(String, usize)> {
        self.subs
            .lock()
            .await
            .iter()
            .map(|(room, entry)| (room.clone(), entry.refcount))
            .collect()
    }
}
