//! Message routing in both directions.
//!
//! Client frames are parsed into actions. A `message` action is queued on
//! every live local member in order, written to each member on its own
//! tracked task, and only then published to the room topic on another
//! tracked task. Backbone frames come in through one dispatch loop, have their
//! own echoes dropped, and reuse the same queue-then-write path.

use std::sync::Arc;

use bytes::Bytes;
use futures::future::join_all;
use metrics::counter;
use roomcast_backbone::{Backbone, BackboneFrame, FrameReceiver};
use roomcast_core::{
    ChatMessage, ClientAction, ClientFrame, NodeId, ProtocolError, room_from_topic, room_topic,
};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::rooms::RoomMembership;
use crate::metrics::{
    BACKBONE_PUBLISH_ERRORS_TOTAL, FRAMES_DROPPED_TOTAL, LOCAL_DELIVERIES_TOTAL,
    LOCAL_DELIVERY_FAILURES_TOTAL, LOOP_SUPPRESSED_TOTAL, MESSAGES_SENT_TOTAL,
};
use crate::websocket::client::Client;

/// Where a locally delivered message came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Source {
    /// A client attached to this node.
    Local,
    /// Another node, via the backbone.
    Remote,
}

impl Source {
    fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }
}

/// Outcome of one local fan-out.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Members the message was written to.
    pub delivered: usize,
    /// Members whose write failed or timed out.
    pub failed: usize,
}

/// Routes client frames and backbone frames to room members.
pub struct MessageRouter {
    node_id: NodeId,
    rooms: Arc<RoomMembership>,
    backbone: Arc<dyn Backbone>,
    publishes: TaskTracker,
    deliveries: TaskTracker,
}

impl MessageRouter {
    /// Create a router for the node `node_id`.
    pub fn new(node_id: NodeId, rooms: Arc<RoomMembership>, backbone: Arc<dyn Backbone>) -> Self {
        Self {
            node_id,
            rooms,
            backbone,
            publishes: TaskTracker::new(),
            deliveries: TaskTracker::new(),
        }
    }

    /// Identity stamped on every message this node originates.
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Handle one inbound text frame from `client`.
    ///
    /// A malformed frame is logged and counted, then returned as an error; the
    /// connection stays open either way.
    pub async fn handle_client_frame(
        &self,
        client: &Arc<Client>,
        text: &str,
    ) -> Result<(), ProtocolError> {
        let action = match ClientFrame::parse(text) {
            Ok(action) => action,
            Err(e) => {
                warn!(client_id = %client.id(), error = %e, "dropping malformed client frame");
                counter!(FRAMES_DROPPED_TOTAL, "source" => "client").increment(1);
                return Err(e);
            }
        };

        match action {
            ClientAction::Join { room } => {
                let _ = self.rooms.join(client, &room).await;
            }
            ClientAction::Leave { room } => {
                let _ = self.rooms.leave(client.id(), &room).await;
            }
            ClientAction::Message {
                room,
                kind,
                payload,
                client_id,
            } => {
                let message = ChatMessage::new(
                    room,
                    client.user_id(),
                    self.node_id.clone(),
                    kind,
                    payload,
                    client_id,
                );
                let _ = self.send(message);
            }
        }
        Ok(())
    }

    /// Queue a message originated here on every live local member, then
    /// publish it.
    ///
    /// Member writes and the publish run on tracked tasks, so the caller
    /// (a client's read loop) never waits on a slow member or the backbone.
    /// Returns the number of members the message was queued for.
    pub fn send(&self, message: ChatMessage) -> usize {
        let encoded = match message.encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(message_id = %message.message_id, error = %e, "failed to encode message");
                return 0;
            }
        };
        counter!(MESSAGES_SENT_TOTAL).increment(1);
        debug!(
            message_id = %message.message_id,
            room_id = %message.room_id,
            sender_id = %message.sender_id,
            "routing message"
        );

        let text: Arc<str> = Arc::from(encoded.as_str());
        let recipients = self.enqueue_local(&message.room_id, &text);
        for member in &recipients {
            let member = Arc::clone(member);
            let room_id = message.room_id.clone();
            drop(self.deliveries.spawn(async move {
                let _ = flush_member(&member, &room_id, Source::Local).await;
            }));
        }

        let backbone = Arc::clone(&self.backbone);
        let topic = room_topic(&message.room_id);
        let payload = Bytes::from(encoded);
        let message_id = message.message_id;
        drop(self.publishes.spawn(async move {
            if let Err(e) = backbone.publish(&topic, payload).await {
                warn!(topic, message_id, error = %e, "backbone publish failed");
                counter!(BACKBONE_PUBLISH_ERRORS_TOTAL).increment(1);
            }
        }));

        recipients.len()
    }

    /// Handle one frame from the backbone.
    ///
    /// Returns `None` when the frame is dropped: not a room topic, undecodable,
    /// or an echo of a message this node originated.
    pub async fn dispatch_backbone_frame(&self, frame: BackboneFrame) -> Option<DeliveryReport> {
        let Some(room_id) = room_from_topic(&frame.topic) else {
            debug!(topic = %frame.topic, "ignoring frame on non-room topic");
            return None;
        };

        let message = match ChatMessage::decode(&frame.payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(topic = %frame.topic, error = %e, "dropping undecodable backbone frame");
                counter!(FRAMES_DROPPED_TOTAL, "source" => "backbone").increment(1);
                return None;
            }
        };

        if message.originated_on(&self.node_id) {
            debug!(message_id = %message.message_id, room_id, "suppressing own message echo");
            counter!(LOOP_SUPPRESSED_TOTAL).increment(1);
            return None;
        }

        let encoded = match message.encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(message_id = %message.message_id, error = %e, "failed to re-encode message");
                return None;
            }
        };
        Some(
            self.deliver_local(room_id, Arc::from(encoded.as_str()), Source::Remote)
                .await,
        )
    }

    /// Write `text` to every live member of `room_id` concurrently and wait
    /// for the writes.
    ///
    /// Each write is bounded by the member's write timeout. A member whose
    /// write fails has its stop token cancelled, which tears its connection
    /// down; the other members are unaffected.
    pub async fn deliver_local(&self, room_id: &str, text: Arc<str>, source: Source) -> DeliveryReport {
        let recipients = self.enqueue_local(room_id, &text);
        let writes = recipients
            .iter()
            .map(|member| flush_member(member, room_id, source));

        let mut report = DeliveryReport::default();
        for delivered in join_all(writes).await {
            if delivered {
                report.delivered += 1;
            } else {
                report.failed += 1;
            }
        }
        report
    }

    /// Queue `text` on every member of `room_id` that is not already being
    /// torn down, in one pass, and return those members.
    fn enqueue_local(&self, room_id: &str, text: &Arc<str>) -> Vec<Arc<Client>> {
        let mut members = self.rooms.members(room_id);
        members.retain(|member| !member.stop_token().is_cancelled() && !member.is_closed());
        for member in &members {
            member.enqueue_text(Arc::clone(text));
        }
        members
    }

    /// Drain `inbound` until it closes or `shutdown` fires.
    ///
    /// Each frame is handled on its own tracked task.
    pub async fn run_dispatch(self: Arc<Self>, mut inbound: FrameReceiver, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                frame = inbound.recv() => {
                    let Some(frame) = frame else { break };
                    let router = Arc::clone(&self);
                    drop(self.deliveries.spawn(async move {
                        let _ = router.dispatch_backbone_frame(frame).await;
                    }));
                }
            }
        }
        debug!(node_id = %self.node_id, "backbone dispatch loop stopped");
    }

    /// Stop accepting tracked work and wait for in-flight publishes and
    /// deliveries.
    pub async fn drain(&self) {
        let _ = self.publishes.close();
        let _ = self.deliveries.close();
        info!(
            publishes = self.publishes.len(),
            deliveries = self.deliveries.len(),
            "draining in-flight backbone work"
        );
        futures::join!(self.publishes.wait(), self.deliveries.wait());
    }
}

/// Write one queued message to `member`, dropping the member on failure.
async fn flush_member(member: &Client, room_id: &str, source: Source) -> bool {
    match member.flush_text().await {
        Ok(()) => {
            counter!(LOCAL_DELIVERIES_TOTAL, "source" => source.as_str()).increment(1);
            true
        }
        Err(e) => {
            warn!(client_id = %member.id(), room_id, error = %e, "local delivery failed, dropping client");
            counter!(LOCAL_DELIVERY_FAILURES_TOTAL).increment(1);
            member.stop_token().cancel();
            false
        }
    }
}
