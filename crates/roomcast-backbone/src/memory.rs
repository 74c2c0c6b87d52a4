//! In-process backbone.
//!
//! A [`MemoryHub`] is the shared bus; each node gets its own
//! [`MemoryBackbone`] from [`MemoryHub::backbone`]. Publishing delivers to
//! every subscriber of the topic, the publishing node included, which is
//! what a real broker does and what loop suppression has to cope with.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use roomcast_core::BackboneError;
use tracing::debug;

use crate::{Backbone, BackboneFrame, FrameSender, SubscriptionHandle};

#[derive(Default)]
struct HubInner {
    topics: DashMap<String, Vec<(u64, FrameSender)>>,
    next_id: AtomicU64,
    published: AtomicU64,
    fail_subscribe: AtomicBool,
    fail_publish: AtomicBool,
    publish_delay: Mutex<Option<Duration>>,
}

/// Shared in-process bus.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl MemoryHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// A new node connection to this hub.
    pub fn backbone(&self) -> MemoryBackbone {
        MemoryBackbone {
            hub: self.clone(),
            owned: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Open subscriptions on `topic`, across all nodes.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner.topics.get(topic).map_or(0, |subs| subs.len())
    }

    /// Successful publishes so far.
    pub fn published_count(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }

    /// Make every subsequent subscribe fail.
    pub fn set_fail_subscribe(&self, fail: bool) {
        self.inner.fail_subscribe.store(fail, Ordering::Relaxed);
    }

    /// Make every subsequent publish fail.
    pub fn set_fail_publish(&self, fail: bool) {
        self.inner.fail_publish.store(fail, Ordering::Relaxed);
    }

    /// Hold every subsequent publish for `delay` before delivering.
    pub fn set_publish_delay(&self, delay: Option<Duration>) {
        *self.inner.publish_delay.lock() = delay;
    }

    fn remove(&self, topic: &str, id: u64) {
        if let Some(mut subs) = self.inner.topics.get_mut(topic) {
            subs.retain(|(sub_id, _)| *sub_id != id);
        }
        let _ = self.inner.topics.remove_if(topic, |_, subs| subs.is_empty());
    }
}

/// One node's connection to a [`MemoryHub`].
pub struct MemoryBackbone {
    hub: MemoryHub,
    owned: Mutex<HashMap<u64, String>>,
    closed: AtomicBool,
}

impl MemoryBackbone {
    fn ensure_open(&self) -> Result<(), BackboneError> {
        if self.closed.load(Ordering::Acquire) {
            Err(BackboneError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Backbone for MemoryBackbone {
    async fn subscribe(
        &self,
        topic: &str,
        deliver: FrameSender,
    ) -> Result<SubscriptionHandle, BackboneError> {
        self.ensure_open()?;
        let inner = &self.hub.inner;
        if inner.fail_subscribe.load(Ordering::Relaxed) {
            return Err(BackboneError::Subscribe {
                topic: topic.to_owned(),
                message: "injected failure".into(),
            });
        }

        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        inner
            .topics
            .entry(topic.to_owned())
            .or_default()
            .push((id, deliver));
        let _ = self.owned.lock().insert(id, topic.to_owned());
        debug!(topic, id, "memory subscribe");
        Ok(SubscriptionHandle::new(id, topic))
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), BackboneError> {
        self.ensure_open()?;
        let _ = self.owned.lock().remove(&handle.id());
        self.hub.remove(handle.topic(), handle.id());
        debug!(topic = handle.topic(), id = handle.id(), "memory unsubscribe");
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BackboneError> {
        self.ensure_open()?;
        let inner = &self.hub.inner;

        let delay = *inner.publish_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if inner.fail_publish.load(Ordering::Relaxed) {
            return Err(BackboneError::Publish {
                topic: topic.to_owned(),
                message: "injected failure".into(),
            });
        }

        let senders: Vec<FrameSender> = inner
            .topics
            .get(topic)
            .map(|subs| subs.iter().map(|(_, tx)| tx.clone()).collect())
            .unwrap_or_default();
        for tx in senders {
            let _ = tx.send(BackboneFrame {
                topic: topic.to_owned(),
                payload: payload.clone(),
            });
        }
        let _ = inner.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn close(&self) -> Result<(), BackboneError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let owned: Vec<(u64, String)> = self.owned.lock().drain().collect();
        for (id, topic) in owned {
            self.hub.remove(&topic, id);
        }
        debug!("memory backbone closed");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_channel;

    #[tokio::test]
    async fn publish_reaches_every_node_including_publisher() {
        let hub = MemoryHub::new();
        let a = hub.backbone();
        let b = hub.backbone();
        let (tx_a, mut rx_a) = frame_channel();
        let (tx_b, mut rx_b) = frame_channel();
        let _ = a.subscribe("room.general", tx_a).await.unwrap();
        let _ = b.subscribe("room.general", tx_b).await.unwrap();

        a.publish("room.general", Bytes::from_static(b"hi")).await.unwrap();

        assert_eq!(rx_a.recv().await.unwrap().payload, Bytes::from_static(b"hi"));
        assert_eq!(rx_b.recv().await.unwrap().topic, "room.general");
        assert_eq!(hub.published_count(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery_and_drops_topic() {
        let hub = MemoryHub::new();
        let node = hub.backbone();
        let (tx, mut rx) = frame_channel();
        let handle = node.subscribe("room.a", tx).await.unwrap();
        assert_eq!(hub.subscriber_count("room.a"), 1);

        node.unsubscribe(handle).await.unwrap();
        assert_eq!(hub.subscriber_count("room.a"), 0);

        node.publish("room.a", Bytes::from_static(b"x")).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn injected_failures() {
        let hub = MemoryHub::new();
        let node = hub.backbone();
        let (tx, _rx) = frame_channel();

        hub.set_fail_subscribe(true);
        let err = node.subscribe("room.a", tx.clone()).await.unwrap_err();
        assert!(matches!(err, BackboneError::Subscribe { .. }));
        assert_eq!(hub.subscriber_count("room.a"), 0);

        hub.set_fail_subscribe(false);
        hub.set_fail_publish(true);
        let _ = node.subscribe("room.a", tx).await.unwrap();
        let err = node.publish("room.a", Bytes::new()).await.unwrap_err();
        assert!(matches!(err, BackboneError::Publish { .. }));
        assert_eq!(hub.published_count(), 0);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_releases_subscriptions() {
        let hub = MemoryHub::new();
        let node = hub.backbone();
        let (tx, _rx) = frame_channel();
        let _ = node.subscribe("room.a", tx.clone()).await.unwrap();
        let _ = node.subscribe("room.b", tx.clone()).await.unwrap();

        node.close().await.unwrap();
        node.close().await.unwrap();
        assert!(node.is_closed());
        assert_eq!(hub.subscriber_count("room.a"), 0);
        assert_eq!(hub.subscriber_count("room.b"), 0);

        assert_eq!(
            node.publish("room.a", Bytes::new()).await.unwrap_err(),
            BackboneError::Closed
        );
        assert_eq!(node.subscribe("room.a", tx).await.unwrap_err(), BackboneError::Closed);
    }

    #[tokio::test]
    async fn closing_one_node_leaves_others_subscribed() {
        let hub = MemoryHub::new();
        let a = hub.backbone();
        let b = hub.backbone();
        let (tx, _rx) = frame_channel();
        let _ = a.subscribe("room.a", tx.clone()).await.unwrap();
        let _ = b.subscribe("room.a", tx).await.unwrap();

        a.close().await.unwrap();
        assert_eq!(hub.subscriber_count("room.a"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn publish_delay_holds_delivery() {
        let hub = MemoryHub::new();
        let node = hub.backbone();
        let (tx, mut rx) = frame_channel();
        let _ = node.subscribe("room.a", tx).await.unwrap();
        hub.set_publish_delay(Some(Duration::from_secs(5)));

        let start = tokio::time::Instant::now();
        node.publish("room.a", Bytes::from_static(b"x")).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert!(rx.recv().await.is_some());
    }
}
