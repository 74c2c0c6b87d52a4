//! Prometheus metrics recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus recorder globally.
///
/// Returns the handle used to render `/metrics`. Call once at startup.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

/// Connections accepted (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "roomcast_ws_connections_total";
/// Connections torn down (counter, labels: reason).
pub const WS_DISCONNECTIONS_TOTAL: &str = "roomcast_ws_disconnections_total";
/// Live connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "roomcast_ws_connections_active";
/// Inbound frames dropped as malformed (counter).
pub const FRAMES_DROPPED_TOTAL: &str = "roomcast_frames_dropped_total";
/// Messages accepted from local clients (counter).
pub const MESSAGES_SENT_TOTAL: &str = "roomcast_messages_sent_total";
/// Successful local deliveries (counter, labels: source).
pub const LOCAL_DELIVERIES_TOTAL: &str = "roomcast_local_deliveries_total";
/// Failed or timed-out local deliveries (counter).
pub const LOCAL_DELIVERY_FAILURES_TOTAL: &str = "roomcast_local_delivery_failures_total";
/// Backbone frames dropped because this node originated them (counter).
pub const LOOP_SUPPRESSED_TOTAL: &str = "roomcast_loop_suppressed_total";
/// Backbone publish failures (counter).
pub const BACKBONE_PUBLISH_ERRORS_TOTAL: &str = "roomcast_backbone_publish_errors_total";
/// Backbone subscribe/unsubscribe failures (counter, labels: op).
pub const BACKBONE_SUBSCRIPTION_ERRORS_TOTAL: &str = "roomcast_backbone_subscription_errors_total";
/// Open room subscriptions (gauge).
pub const ROOM_SUBSCRIPTIONS_ACTIVE: &str = "roomcast_room_subscriptions_active";
