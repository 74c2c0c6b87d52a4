//! axum HTTP surface: WebSocket upgrade, `/health` and `/metrics`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use roomcast_core::RelayError;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::auth::{Authenticator, authenticate};
use crate::metrics::render;
use crate::node::RelayNode;
use crate::shutdown::NodeState;
use crate::websocket::run_session;

/// Shared state passed to axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// The relay node behind this listener.
    pub node: Arc<RelayNode>,
    /// Upgrade credential verifier.
    pub auth: Arc<dyn Authenticator>,
    /// Prometheus handle, when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

/// Query string of the upgrade endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    /// Bearer credential.
    pub token: Option<String>,
}

/// Build the axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let ws_path = state.node.config().ws_path.clone();
    Router::new()
        .route(&ws_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Bind the node's configured address and serve until the node stops
/// accepting.
pub async fn start(
    node: Arc<RelayNode>,
    auth: Arc<dyn Authenticator>,
    metrics: Option<PrometheusHandle>,
) -> Result<ServerHandle, RelayError> {
    let listener = TcpListener::bind(node.config().bind_addr()).await?;
    let addr = listener.local_addr()?;

    let router = build_router(AppState {
        node: Arc::clone(&node),
        auth,
        metrics,
    });
    let accept = node.coordinator().accept_token();
    let server = tokio::spawn(async move {
        let stopped = async move { accept.cancelled().await };
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(stopped)
            .await
        {
            warn!(error = %e, "http server exited with error");
        }
    });

    info!(%addr, node_id = %node.node_id(), "roomcast server listening");
    Ok(ServerHandle { addr, node, server })
}

/// Handle returned by [`start`].
pub struct ServerHandle {
    addr: SocketAddr,
    node: Arc<RelayNode>,
    server: JoinHandle<()>,
}

impl ServerHandle {
    /// Bound address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Bound port.
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// The node being served.
    pub fn node(&self) -> &Arc<RelayNode> {
        &self.node
    }

    /// `ws://` URL of the upgrade endpoint.
    pub fn ws_url(&self) -> String {
        format!("ws://{}{}", self.addr, self.node.config().ws_path)
    }

    /// `http://` URL for `path`.
    pub fn http_url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    /// Shut the node down within `deadline`, then stop the listener task.
    pub async fn shutdown(self, deadline: Duration) -> Result<(), RelayError> {
        let result = self.node.shutdown(deadline).await;
        if !self.server.is_finished() {
            self.server.abort();
        }
        result
    }
}

/// GET `<ws_path>?token=...`: refuse while draining, verify, then upgrade.
async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<ConnectParams>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if state.node.coordinator().is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "server shutting down").into_response();
    }

    let user_id = match authenticate(state.auth.as_ref(), params.token.as_deref()) {
        Ok(user_id) => user_id,
        Err(e) => {
            debug!(error = %e, "rejecting upgrade");
            return (StatusCode::UNAUTHORIZED, e.to_string()).into_response();
        }
    };

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let node = Arc::clone(&state.node);
    ws.max_message_size(node.config().max_message_size)
        .on_upgrade(move |socket| run_session(socket, node, user_id))
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let resp = state.node.health().await;
    let status = if resp.state == NodeState::Running {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(resp))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => render(handle).into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}
