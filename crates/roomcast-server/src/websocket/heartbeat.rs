//! Per-connection liveness probing.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::client::Client;

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// The connection's own stop token fired.
    Stopped,
    /// The node-wide shutdown token fired.
    Shutdown,
    /// No inbound activity for longer than the pong timeout.
    TimedOut,
    /// Writing the probe failed or timed out.
    ProbeFailed,
}

/// Probe `client` every `interval` until it stops, the node shuts down, or
/// the client goes quiet for longer than `pong_timeout`.
///
/// Probes go through the client's write lock, so they never interleave with
/// application frames. On `TimedOut` and `ProbeFailed` the client's stop token
/// is cancelled, which ends its read loop.
pub async fn run_heartbeat(
    client: Arc<Client>,
    interval: Duration,
    pong_timeout: Duration,
    shutdown: CancellationToken,
) -> HeartbeatResult {
    let stop = client.stop_token().clone();
    let mut ticker = time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = stop.cancelled() => return HeartbeatResult::Stopped,
            () = shutdown.cancelled() => return HeartbeatResult::Shutdown,
            _ = ticker.tick() => {
                let idle = client.idle_for();
                if idle > pong_timeout {
                    warn!(client_id = %client.id(), idle_ms = idle.as_millis(), "client unresponsive, disconnecting");
                    stop.cancel();
                    return HeartbeatResult::TimedOut;
                }
                if let Err(e) = client.ping().await {
                    warn!(client_id = %client.id(), error = %e, "liveness probe failed");
                    stop.cancel();
                    return HeartbeatResult::ProbeFailed;
                }
                debug!(client_id = %client.id(), "ping sent");
            }
        }
    }
}
