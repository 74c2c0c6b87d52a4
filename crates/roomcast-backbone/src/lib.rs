//! The shared publish/subscribe backbone connecting roomcast nodes.
//!
//! A node talks to the backbone only through the [`Backbone`] trait.
//! Inbound frames are never delivered by callback: every subscription is
//! handed a [`FrameSender`], and the node drains the matching receiver from a
//! single dispatch task.
//!
//! Implementations:
//! - [`MemoryHub`] / [`MemoryBackbone`]: in-process bus; several nodes in one
//!   process share a hub. Used by tests and single-node deployments.
//! - [`RedisBackbone`]: Redis pub/sub.

#![deny(unsafe_code)]

pub mod memory;
pub mod redis_backbone;

use async_trait::async_trait;
use bytes::Bytes;
use roomcast_core::BackboneError;
use tokio::sync::mpsc;

pub use memory::{MemoryBackbone, MemoryHub};
pub use redis_backbone::RedisBackbone;

/// One frame received from a backbone topic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackboneFrame {
    /// Topic the frame arrived on.
    pub topic: String,
    /// Raw payload, exactly as published.
    pub payload: Bytes,
}

/// Sending half of the inbound frame channel.
pub type FrameSender = mpsc::UnboundedSender<BackboneFrame>;
/// Receiving half of the inbound frame channel.
pub type FrameReceiver = mpsc::UnboundedReceiver<BackboneFrame>;

/// Create the inbound frame channel a node hands to its subscriptions.
pub fn frame_channel() -> (FrameSender, FrameReceiver) {
    mpsc::unbounded_channel()
}

/// An open topic subscription. Pass back to [`Backbone::unsubscribe`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionHandle {
    id: u64,
    topic: String,
}

impl SubscriptionHandle {
    pub(crate) fn new(id: u64, topic: impl Into<String>) -> Self {
        Self {
            id,
            topic: topic.into(),
        }
    }

    /// Backend-local subscription id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Subscribed topic.
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

/// Pub/sub backbone shared by all nodes.
#[async_trait]
pub trait Backbone: Send + Sync {
    /// Open a subscription; frames on `topic` are pushed into `deliver`.
    async fn subscribe(
        &self,
        topic: &str,
        deliver: FrameSender,
    ) -> Result<SubscriptionHandle, BackboneError>;

    /// Close a subscription opened by [`Backbone::subscribe`].
    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), BackboneError>;

    /// Publish a payload to every subscriber of `topic`, on every node.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BackboneError>;

    /// Release the backbone connection. Idempotent.
    async fn close(&self) -> Result<(), BackboneError>;

    /// Whether [`Backbone::close`] has run.
    fn is_closed(&self) -> bool;
}
