//! # roomcast-server
//!
//! The relay node: room fan-out core plus its axum WebSocket surface.
//!
//! - [`fanout`]: connection registry, room membership, refcounted backbone
//!   subscriptions and the message router
//! - [`websocket`]: per-connection write path, heartbeat and session lifecycle
//! - [`node`]: [`RelayNode`] wiring the above to one backbone, with shutdown
//! - [`server`]: HTTP routes (`/ws`, `/health`, `/metrics`) and [`start`]
//! - [`auth`], [`config`], [`health`], [`metrics`], [`shutdown`]: supporting pieces

#![deny(unsafe_code)]

pub mod auth;
pub mod config;
pub mod fanout;
pub mod health;
pub mod metrics;
pub mod node;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use auth::{Authenticator, PrefixTokenAuthenticator};
pub use config::ServerConfig;
pub use node::RelayNode;
pub use server::{AppState, ServerHandle, build_router, start};
pub use shutdown::{NodeState, ShutdownCoordinator};
