//! graphql-live - Realtime GraphQL subscription transport engine
//!
//! This crate keeps a single GraphQL subscription alive against a server:
//!
//! - **WebSocket**: the `graphql-transport-ws` protocol with keepalive
//! - **SSE**: Server-Sent Events fallback for WebSocket-less environments
//! - **Reconnection**: bounded exponential backoff with counter reset
//! - **Observation**: a `{data, state, error}` snapshot plus one ordered
//!   event stream
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use graphql_live::{ConnectionConfig, SubscriptionClient, SubscriptionSpec};
//!
//! let config = ConnectionConfig::new("https://api.example.com/graphql")
//!     .with_header("authorization", "Bearer token");
//! let spec = SubscriptionSpec::new("subscription { orderUpdated { id } }");
//!
//! let (handle, mut events) = SubscriptionClient::new(config, spec).start();
//! while let Some(event) = events.next().await {
//!     println!("Event: {event:?}");
//! }
//! handle.dispose();
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod backoff;
mod error;
mod manager;
mod protocol;
mod sse;
mod transport;
mod websocket;

pub use backoff::{
    BackoffPolicy, DEFAULT_RECONNECT_ATTEMPTS, DEFAULT_RECONNECT_BASE_DELAY, MAX_RECONNECT_DELAY,
};
pub use error::SubscriptionError;
pub use manager::{
    ConnectionConfig, SubscriptionClient, SubscriptionEvent, SubscriptionEvents,
    SubscriptionHandle, SubscriptionSnapshot, SubscriptionSpec,
};
pub use protocol::{GraphqlError, GRAPHQL_WS_PROTOCOL};
pub use sse::SseTransport;
pub use transport::{ConnectionState, Transport, TransportEvent, TransportKind};
pub use websocket::WebSocketTransport;
