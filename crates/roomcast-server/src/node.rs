//! A relay node: the fan-out core wired to one backbone.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use roomcast_backbone::{Backbone, frame_channel};
use roomcast_core::{NodeId, RelayError};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::fanout::{ConnectionRegistry, MessageRouter, RoomMembership, SubscriptionManager};
use crate::health::{HealthCounts, HealthResponse, health_check};
use crate::shutdown::{NodeState, ShutdownCoordinator};
use crate::websocket::client::CLOSE_GOING_AWAY;

/// Close reason sent to every client during shutdown.
pub const SHUTDOWN_REASON: &str = "server shutting down";

/// One relay node and everything it owns.
pub struct RelayNode {
    node_id: NodeId,
    config: ServerConfig,
    started_at: Instant,
    registry: Arc<ConnectionRegistry>,
    subscriptions: Arc<SubscriptionManager>,
    rooms: Arc<RoomMembership>,
    router: Arc<MessageRouter>,
    coordinator: ShutdownCoordinator,
    backbone: Arc<dyn Backbone>,
}

impl RelayNode {
    /// Build the node over `backbone` and start its backbone dispatch loop.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn launch(config: ServerConfig, backbone: Arc<dyn Backbone>) -> Arc<Self> {
        let node_id = NodeId::new();
        let (deliver, inbound) = frame_channel();
        let subscriptions = Arc::new(SubscriptionManager::new(Arc::clone(&backbone), deliver));
        let rooms = Arc::new(RoomMembership::new(Arc::clone(&subscriptions)));
        let router = Arc::new(MessageRouter::new(
            node_id.clone(),
            Arc::clone(&rooms),
            Arc::clone(&backbone),
        ));
        let coordinator = ShutdownCoordinator::new();

        drop(tokio::spawn(
            Arc::clone(&router).run_dispatch(inbound, coordinator.shutdown_token()),
        ));
        info!(node_id = %node_id, "relay node launched");

        Arc::new(Self {
            node_id,
            config,
            started_at: Instant::now(),
            registry: Arc::new(ConnectionRegistry::new()),
            subscriptions,
            rooms,
            router,
            coordinator,
            backbone,
        })
    }

    /// Process-lifetime node identity.
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Runtime configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Live connections.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Room membership.
    pub fn rooms(&self) -> &Arc<RoomMembership> {
        &self.rooms
    }

    /// Backbone subscriptions.
    pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
        &self.subscriptions
    }

    /// Message router.
    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    /// Shutdown state machine.
    pub fn coordinator(&self) -> &ShutdownCoordinator {
        &self.coordinator
    }

    /// Backbone connection.
    pub fn backbone(&self) -> &Arc<dyn Backbone> {
        &self.backbone
    }

    /// Current lifecycle state.
    pub fn state(&self) -> NodeState {
        self.coordinator.state()
    }

    /// Sample a health response.
    pub async fn health(&self) -> HealthResponse {
        let counts = HealthCounts {
            connections: self.registry.len(),
            rooms: self.rooms.room_count(),
            subscriptions: self.subscriptions.len().await,
        };
        health_check(self.node_id.as_str(), self.state(), self.started_at, counts)
    }

    /// Shut the node down within `deadline`.
    ///
    /// Stops accepting and raises the shutdown signal, then concurrently
    /// closes every client with 1001 and drains in-flight backbone work before
    /// closing the backbone. Past the deadline every remaining client is
    /// stopped, the backbone close continues in the background and
    /// [`RelayError::ShutdownTimeout`] is returned. The node ends `Stopped`
    /// either way.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), RelayError> {
        self.coordinator.begin()?;
        let clients = self.registry.snapshot();
        info!(
            node_id = %self.node_id,
            clients = clients.len(),
            deadline_ms = deadline.as_millis(),
            "shutting down node"
        );

        let close_clients = join_all(clients.iter().map(|client| async move {
            if let Err(e) = client.close(CLOSE_GOING_AWAY, SHUTDOWN_REASON).await {
                debug!(client_id = %client.id(), error = %e, "close frame not delivered");
            }
            client.stop_token().cancel();
        }));
        let release_backbone = async {
            self.router.drain().await;
            if let Err(e) = self.backbone.close().await {
                warn!(error = %e, "backbone close failed");
            }
        };

        let outcome = tokio::time::timeout(deadline, async {
            let _ = futures::join!(close_clients, release_backbone);
        })
        .await;

        let result = if outcome.is_ok() {
            Ok(())
        } else {
            warn!(
                deadline_ms = deadline.as_millis(),
                "shutdown deadline exceeded, forcing remaining resources closed"
            );
            for client in self.registry.snapshot() {
                client.stop_token().cancel();
            }
            let backbone = Arc::clone(&self.backbone);
            drop(tokio::spawn(async move {
                if let Err(e) = backbone.close().await {
                    warn!(error = %e, "background backbone close failed");
                }
            }));
            Err(RelayError::ShutdownTimeout { deadline })
        };

        self.coordinator.finish();
        result
    }
}

impl std::fmt::Debug for RelayNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayNode")
            .field("node_id", &self.node_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
