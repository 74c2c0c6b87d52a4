//! Room fan-out: connection registry, membership, refcounted backbone
//! subscriptions and message routing.
//!
//! Call order is always membership → subscriptions. No lock is held across
//! that call, and the registry is never locked together with either map.

pub mod registry;
pub mod rooms;
pub mod router;
pub mod subscriptions;

pub use registry::ConnectionRegistry;
pub use rooms::RoomMembership;
pub use router::{DeliveryReport, MessageRouter, Source};
pub use subscriptions::SubscriptionManager;
