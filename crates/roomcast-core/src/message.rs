//! Wire shapes: inbound client frames, the canonical outbound envelope, and
//! backbone topic naming.
//!
//! Inbound frames are parsed leniently: any JSON object is accepted, fields of
//! the wrong type are treated as absent, and a non-object `payload` is dropped.
//! Only a missing/unknown `action` or a missing room id rejects the frame.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::ProtocolError;
use crate::ids::{NodeId, new_message_id};

/// Prefix of every room topic on the backbone.
pub const ROOM_TOPIC_PREFIX: &str = "room.";

/// Backbone topic for a room: `room.<room_id>`.
pub fn room_topic(room_id: &str) -> String {
    format!("{ROOM_TOPIC_PREFIX}{room_id}")
}

/// Room id carried by a backbone topic, if it is a room topic.
pub fn room_from_topic(topic: &str) -> Option<&str> {
    topic
        .strip_prefix(ROOM_TOPIC_PREFIX)
        .filter(|room| !room.is_empty())
}

/// Inbound client frame as sent over the socket.
///
/// Used by clients and tests to build frames; the server side parses with
/// [`ClientFrame::parse`], which is more forgiving than derived
/// deserialization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientFrame {
    /// `join`, `leave` or `message`.
    pub action: String,
    /// Target room id.
    #[serde(default)]
    pub room: String,
    /// Application-defined message type.
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    /// Application payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Map<String, Value>>,
    /// Optional client-supplied correlation id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

impl ClientFrame {
    /// A `join` frame.
    pub fn join(room: impl Into<String>) -> Self {
        Self {
            action: "join".into(),
            room: room.into(),
            ..Self::default()
        }
    }

    /// A `leave` frame.
    pub fn leave(room: impl Into<String>) -> Self {
        Self {
            action: "leave".into(),
            room: room.into(),
            ..Self::default()
        }
    }

    /// A `message` frame.
    pub fn message(room: impl Into<String>, kind: impl Into<String>, payload: Value) -> Self {
        Self {
            action: "message".into(),
            room: room.into(),
            kind: kind.into(),
            payload: match payload {
                Value::Object(map) => Some(map),
                _ => None,
            },
            client_id: None,
        }
    }

    /// Attach a correlation id.
    #[must_use]
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Serialize to the JSON text sent on the socket.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Parse raw frame text into the action it carries.
    pub fn parse(text: &str) -> Result<ClientAction, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
        let Value::Object(fields) = value else {
            return Err(ProtocolError::NotAnObject);
        };

        let action = str_field(&fields, "action").ok_or(ProtocolError::MissingAction)?;
        let room = str_field(&fields, "room").unwrap_or_default();

        match action {
            "join" => Ok(ClientAction::Join {
                room: require_room(room, "join")?,
            }),
            "leave" => Ok(ClientAction::Leave {
                room: require_room(room, "leave")?,
            }),
            "message" => Ok(ClientAction::Message {
                room: require_room(room, "message")?,
                kind: str_field(&fields, "type").unwrap_or_default().to_owned(),
                payload: match fields.get("payload") {
                    Some(Value::Object(map)) => Some(map.clone()),
                    _ => None,
                },
                client_id: str_field(&fields, "client_id")
                    .filter(|id| !id.is_empty())
                    .map(str::to_owned),
            }),
            other => Err(ProtocolError::UnknownAction(other.to_owned())),
        }
    }
}

fn str_field<'a>(fields: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    fields.get(key).and_then(Value::as_str)
}

fn require_room(room: &str, action: &'static str) -> Result<String, ProtocolError> {
    if room.is_empty() {
        Err(ProtocolError::MissingRoom(action))
    } else {
        Ok(room.to_owned())
    }
}

/// A parsed, validated client action.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientAction {
    /// Join a room.
    Join {
        /// Room id (non-empty).
        room: String,
    },
    /// Leave a room.
    Leave {
        /// Room id (non-empty).
        room: String,
    },
    /// Send a message to a room.
    Message {
        /// Room id (non-empty).
        room: String,
        /// Application-defined type, echoed verbatim.
        kind: String,
        /// Application payload, echoed verbatim.
        payload: Option<Map<String, Value>>,
        /// Correlation id, echoed verbatim.
        client_id: Option<String>,
    },
}

/// Canonical message envelope, sent to local clients and to the backbone in
/// the same serialized form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Unique per send (UUID v4).
    pub message_id: String,
    /// Client-supplied correlation id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Room the message was sent to.
    pub room_id: String,
    /// User identity of the sender.
    pub sender_id: String,
    /// Node that originated the message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_server: Option<NodeId>,
    /// Application-defined type.
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Application payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Map<String, Value>>,
    /// Creation time (UTC, RFC 3339 on the wire).
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    /// Build a new message originated by `origin`, stamped now.
    pub fn new(
        room_id: impl Into<String>,
        sender_id: impl Into<String>,
        origin: NodeId,
        kind: impl Into<String>,
        payload: Option<Map<String, Value>>,
        client_id: Option<String>,
    ) -> Self {
        Self {
            message_id: new_message_id(),
            client_id,
            room_id: room_id.into(),
            sender_id: sender_id.into(),
            origin_server: Some(origin),
            kind: kind.into(),
            payload,
            created_at: Utc::now(),
        }
    }

    /// Whether `node` stamped this message.
    pub fn originated_on(&self, node: &NodeId) -> bool {
        self.origin_server.as_ref() == Some(node)
    }

    /// Serialize to wire JSON.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from wire JSON.
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
