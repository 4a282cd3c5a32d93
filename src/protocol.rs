//! Wire vocabularies for both transports.
//!
//! The WebSocket side is the `graphql-transport-ws` protocol: JSON text
//! frames discriminated by a `type` field. The SSE side is the execution
//! result body carried in each event's `data:` field.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// WebSocket subprotocol name sent during the handshake.
pub const GRAPHQL_WS_PROTOCOL: &str = "graphql-transport-ws";

/// The single correlation id used on the wire. One subscription is active
/// per engine instance, so the id never varies.
pub const SUBSCRIPTION_ID: &str = "1";

/// GraphQL error object as returned by servers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphqlError {
    /// Human-readable error message.
    pub message: String,
}

impl GraphqlError {
    /// Create an error with the given message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Join all error messages with `", "` into one string.
#[must_use]
pub fn join_messages(errors: &[GraphqlError]) -> String {
    errors
        .iter()
        .map(|err| err.message.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Payload of a `subscribe` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribePayload {
    /// Opaque subscription document.
    pub query: String,
    /// Operation variables.
    pub variables: Map<String, Value>,
}

/// Frames sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Opens the protocol-level handshake; `payload` carries headers when
    /// any are configured.
    ConnectionInit {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Map<String, Value>>,
    },
    /// Starts the subscription. Sent only after `connection_ack`.
    Subscribe {
        id: String,
        payload: SubscribePayload,
    },
    /// Keepalive reply; echoes the server ping's payload.
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    /// Graceful unsubscribe before closing the socket.
    Complete { id: String },
}

impl ClientMessage {
    /// Build a `subscribe` frame for the fixed correlation id.
    #[must_use]
    pub fn subscribe(query: String, variables: Map<String, Value>) -> Self {
        Self::Subscribe {
            id: SUBSCRIPTION_ID.to_string(),
            payload: SubscribePayload { query, variables },
        }
    }

    /// Build a `complete` frame for the fixed correlation id.
    #[must_use]
    pub fn complete() -> Self {
        Self::Complete {
            id: SUBSCRIPTION_ID.to_string(),
        }
    }

    /// Serialize into a JSON text frame.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Payload of a `next` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NextPayload {
    /// Execution result data.
    #[serde(default)]
    pub data: Value,
}

/// Frames received from the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Handshake accepted; subscribing is now allowed.
    ConnectionAck {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    /// One pushed execution result.
    Next { id: String, payload: NextPayload },
    /// Subscription-scoped errors on a still-open channel.
    Error {
        id: String,
        payload: Vec<GraphqlError>,
    },
    /// Server-initiated end of the subscription.
    Complete { id: String },
    /// Keepalive probe; must be answered immediately.
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    /// Keepalive answer to a client ping.
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
}

impl ServerMessage {
    /// Parse a JSON text frame.
    pub fn decode(frame: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(frame)
    }
}

/// Body of one SSE event: an execution result pushed by the server.
///
/// `data` and `errors` are mutually informative; a valid server never
/// populates both meaningfully at once. An absent or null `data` key
/// carries no delivery.
#[derive(Debug, Clone, Deserialize)]
pub struct SseMessage {
    /// Pushed data, when the event carries any.
    #[serde(default)]
    pub data: Option<Value>,
    /// GraphQL errors, when the event reports a failure.
    #[serde(default)]
    pub errors: Vec<GraphqlError>,
}
