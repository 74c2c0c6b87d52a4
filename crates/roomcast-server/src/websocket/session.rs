//! WebSocket session lifecycle: one connected client from upgrade through
//! disconnect.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{Stream, StreamExt};
use metrics::{counter, gauge};
use roomcast_core::{ProtocolError, TransportError};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::client::{CLOSE_GOING_AWAY, CLOSE_NORMAL, Client};
use super::heartbeat::run_heartbeat;
use crate::metrics::{
    FRAMES_DROPPED_TOTAL, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL,
};
use crate::node::{RelayNode, SHUTDOWN_REASON};

/// Close reason for a connection that ended on its own.
pub const NORMAL_CLOSE_REASON: &str = "bye";

/// Run a session for an upgraded socket owned by `user_id`.
pub async fn run_session(socket: WebSocket, node: Arc<RelayNode>, user_id: String) {
    let (sink, stream) = socket.split();
    let client = Arc::new(Client::new(user_id, sink, node.config().write_timeout));
    serve_client(node, client, stream).await;
}

/// Drive `client` until its read side ends, then tear it down.
///
/// 1. Registers the client and starts its heartbeat
/// 2. Routes inbound text (and UTF-8 binary) frames
/// 3. Stops on close, read error, its own stop token or node shutdown
/// 4. Cancels the heartbeat, leaves every room, deregisters and closes
///    with 1000, or 1001 when the node is shutting down
#[instrument(skip_all, fields(client_id = %client.id(), user_id = client.user_id()))]
pub async fn serve_client<S>(node: Arc<RelayNode>, client: Arc<Client>, mut inbound: S)
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin + Send,
{
    let connected_at = Instant::now();
    node.registry().register(Arc::clone(&client));
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
    info!("client connected");

    let config = node.config();
    let stop = client.stop_token().clone();
    let shutdown = node.coordinator().shutdown_token();
    let heartbeat = tokio::spawn(run_heartbeat(
        Arc::clone(&client),
        config.ping_interval,
        config.pong_timeout,
        shutdown.clone(),
    ));

    let reason = loop {
        tokio::select! {
            biased;
            () = stop.cancelled() => break "stopped",
            () = shutdown.cancelled() => break "shutdown",
            frame = inbound.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    client.mark_alive();
                    let _ = node.router().handle_client_frame(&client, text.as_str()).await;
                }
                Some(Ok(Message::Binary(data))) => {
                    client.mark_alive();
                    if let Ok(text) = std::str::from_utf8(&data) {
                        let _ = node.router().handle_client_frame(&client, text).await;
                    } else {
                        warn!(len = data.len(), error = %ProtocolError::NonUtf8Frame, "dropping binary frame");
                        counter!(FRAMES_DROPPED_TOTAL, "source" => "client").increment(1);
                    }
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => client.mark_alive(),
                Some(Ok(Message::Close(_))) => {
                    debug!("client sent close frame");
                    break "client_close";
                }
                Some(Err(e)) => {
                    debug!(error = %TransportError::Read(e.to_string()), "read failed");
                    break "read_error";
                }
                None => break "eof",
            }
        }
    };

    stop.cancel();
    match heartbeat.await {
        Ok(result) => debug!(?result, "heartbeat finished"),
        Err(e) => warn!(error = %e, "heartbeat task failed"),
    }

    let left = node.rooms().leave_all(client.id()).await;
    let _ = node.registry().deregister(client.id());

    let (code, text) = if shutdown.is_cancelled() {
        (CLOSE_GOING_AWAY, SHUTDOWN_REASON)
    } else {
        (CLOSE_NORMAL, NORMAL_CLOSE_REASON)
    };
    if let Err(e) = client.close(code, text).await {
        debug!(error = %e, "close frame not delivered");
    }

    counter!(WS_DISCONNECTIONS_TOTAL, "reason" => reason).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    info!(
        reason,
        rooms_left = left.len(),
        duration_secs = connected_at.elapsed().as_secs(),
        "client disconnected"
    );
}
