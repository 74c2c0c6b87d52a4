//! `/health` endpoint.

use serde::Serialize;
use tokio::time::Instant;

use crate::shutdown::NodeState;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `"ok"` while running, `"draining"` or `"stopped"` otherwise.
    pub status: String,
    /// Process-lifetime node identity.
    pub node_id: String,
    /// Shutdown state machine position.
    pub state: NodeState,
    /// Seconds since the node started.
    pub uptime_secs: u64,
    /// Live client connections on this node.
    pub connections: usize,
    /// Rooms with at least one local member.
    pub rooms: usize,
    /// Open backbone room subscriptions.
    pub subscriptions: usize,
}

/// Live counters sampled for a health response.
#[derive(Debug, Clone, Copy, Default)]
pub struct HealthCounts {
    /// Live connections.
    pub connections: usize,
    /// Non-empty rooms.
    pub rooms: usize,
    /// Subscription entries.
    pub subscriptions: usize,
}

/// Build a health response.
pub fn health_check(
    node_id: &str,
    state: NodeState,
    started_at: Instant,
    counts: HealthCounts,
) -> HealthResponse {
    let status = match state {
        NodeState::Running => "ok",
        NodeState::Draining => "draining",
        NodeState::Stopped => "stopped",
    };
    HealthResponse {
        status: status.into(),
        node_id: node_id.to_owned(),
        state,
        uptime_secs: started_at.elapsed().as_secs(),
        connections: counts.connections,
        rooms: counts.rooms,
        subscriptions: counts.subscriptions,
    }
}
