//! WebSocket client connections, liveness probing and session lifecycle.

pub mod client;
pub mod heartbeat;
pub mod session;

pub use client::{CLOSE_GOING_AWAY, CLOSE_NORMAL, Client, FrameSink, Outbound};
pub use heartbeat::{HeartbeatResult, run_heartbeat};
pub use session::{run_session, serve_client};
