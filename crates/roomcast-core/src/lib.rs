//! # roomcast-core
//!
//! Types shared by every roomcast crate.
//!
//! - [`ids`]: branded identifiers for connections and nodes
//! - [`message`]: the canonical [`ChatMessage`] envelope, inbound [`ClientFrame`]
//!   parsing and backbone topic naming
//! - [`errors`]: the error taxonomy (auth, protocol, transport, backbone, shutdown)

#![deny(unsafe_code)]

pub mod errors;
pub mod ids;
pub mod message;

pub use errors::{AuthError, BackboneError, ProtocolError, RelayError, TransportError};
pub use ids::{ClientId, NodeId};
pub use message::{ChatMessage, ClientAction, ClientFrame, room_from_topic, room_topic};
