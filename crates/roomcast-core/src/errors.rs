//! Error taxonomy for the relay.
//!
//! - [`AuthError`]: credential problems, rejected before a client exists
//! - [`ProtocolError`]: a single malformed inbound frame; the connection survives
//! - [`TransportError`]: read/write/probe failures; terminates one connection
//! - [`BackboneError`]: pub/sub failures; logged and never fatal
//! - [`RelayError`]: top-level enum, plus shutdown and bind failures

use std::time::Duration;

use thiserror::Error;

/// Credential verification failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// No bearer token was supplied.
    #[error("missing token")]
    MissingToken,
    /// The bearer token did not verify.
    #[error("invalid token")]
    InvalidToken,
}

/// A malformed or unrecognized inbound client frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The frame is not valid JSON.
    #[error("invalid json: {0}")]
    InvalidJson(String),
    /// The frame is JSON but not an object.
    #[error("frame is not a JSON object")]
    NotAnObject,
    /// The frame carries no `action` field.
    #[error("frame has no action")]
    MissingAction,
    /// The `action` value is not one of `join`, `leave`, `message`.
    #[error("unknown action: {0}")]
    UnknownAction(String),
    /// The action requires a non-empty `room`.
    #[error("{0} requires a room id")]
    MissingRoom(&'static str),
    /// A binary frame was not valid UTF-8.
    #[error("binary frame is not valid utf-8")]
    NonUtf8Frame,
}

/// Failures on one connection's transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The connection is already closed.
    #[error("connection closed")]
    Closed,
    /// A write or probe did not finish within the write timeout.
    #[error("write timed out")]
    WriteTimeout,
    /// The underlying socket rejected a frame.
    #[error("send failed: {0}")]
    Send(String),
    /// The underlying socket failed while reading.
    #[error("read failed: {0}")]
    Read(String),
}

/// Pub/sub backbone failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackboneError {
    /// Could not reach the backbone.
    #[error("backbone connect failed: {0}")]
    Connect(String),
    /// Opening a topic subscription failed.
    #[error("subscribe to {topic} failed: {message}")]
    Subscribe {
        /// Topic being subscribed.
        topic: String,
        /// Underlying error.
        message: String,
    },
    /// Closing a topic subscription failed.
    #[error("unsubscribe from {topic} failed: {message}")]
    Unsubscribe {
        /// Topic being unsubscribed.
        topic: String,
        /// Underlying error.
        message: String,
    },
    /// Publishing to a topic failed.
    #[error("publish to {topic} failed: {message}")]
    Publish {
        /// Topic being published to.
        topic: String,
        /// Underlying error.
        message: String,
    },
    /// The backbone connection has been released.
    #[error("backbone connection closed")]
    Closed,
}

/// Top-level relay error.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Credential failure.
    #[error(transparent)]
    Auth(#[from] AuthError),
    /// Malformed inbound frame.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// Connection transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Backbone failure.
    #[error(transparent)]
    Backbone(#[from] BackboneError),
    /// Serializing an outbound message failed.
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
    /// Binding the accept endpoint failed.
    #[error("failed to bind listener: {0}")]
    Bind(#[from] std::io::Error),
    /// Shutdown did not complete before its deadline.
    #[error("shutdown did not complete within {deadline:?}")]
    ShutdownTimeout {
        /// The deadline that was exceeded.
        deadline: Duration,
    },
    /// Shutdown was requested while one was already running or finished.
    #[error("shutdown already in progress")]
    AlreadyShuttingDown,
}

/// Result alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
