//! Transport abstraction shared by the WebSocket and SSE adapters.

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};
use url::Url;

use crate::error::SubscriptionError;

/// Connection lifecycle states observable by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// An attempt is being opened.
    Connecting,
    /// Protocol-level acknowledgement (WebSocket) or stream open (SSE).
    Connected,
    /// The connection ended after having been established.
    Disconnected,
    /// The connection failed before or during establishment.
    Error,
}

impl ConnectionState {
    /// Returns `true` for states that end a connection attempt.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Error)
    }

    /// Returns `true` while the channel is live.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }
}

/// Which transport carries the subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    /// WebSocket when the environment supports it, SSE otherwise.
    #[default]
    Auto,
    /// Always `graphql-transport-ws` over WebSocket.
    WebSocket,
    /// Always Server-Sent Events.
    Sse,
}

impl TransportKind {
    /// Resolve `Auto` against the injected capability flag.
    #[must_use]
    pub const fn resolve(self, websocket_supported: bool) -> ResolvedTransport {
        match self {
            Self::WebSocket => ResolvedTransport::WebSocket,
            Self::Sse => ResolvedTransport::Sse,
            Self::Auto => {
                if websocket_supported {
                    ResolvedTransport::WebSocket
                } else {
                    ResolvedTransport::Sse
                }
            }
        }
    }
}

/// A concrete transport choice after `Auto` resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedTransport {
    /// `graphql-transport-ws` over WebSocket.
    WebSocket,
    /// Server-Sent Events.
    Sse,
}

/// Abstract signals an adapter delivers to the connection manager.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Lifecycle transition of the current attempt.
    StateChanged(ConnectionState),
    /// One pushed execution result.
    Data(Value),
    /// An error that does not by itself change the connection state.
    Error(SubscriptionError),
}

/// One connection attempt over a single physical transport.
///
/// `run` drives the attempt to completion, emitting events in the order
/// the transport produced them. Unless `shutdown` fires first, the
/// attempt ends with exactly one terminal
/// [`TransportEvent::StateChanged`]. When `shutdown` fires the adapter
/// closes gracefully and returns without emitting further events.
#[async_trait]
pub trait Transport: Send {
    async fn run(
        &mut self,
        events: mpsc::Sender<TransportEvent>,
        shutdown: watch::Receiver<bool>,
    );
}

/// Derive the WebSocket URL from the HTTP(S) endpoint by scheme
/// substitution. `ws`/`wss` endpoints pass through unchanged.
pub(crate) fn websocket_url(endpoint: &str) -> Result<Url, SubscriptionError> {
    let mut url =
        Url::parse(endpoint).map_err(|err| SubscriptionError::InvalidEndpoint(err.to_string()))?;
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        "ws" | "wss" => return Ok(url),
        other => {
            return Err(SubscriptionError::InvalidEndpoint(format!(
                "unsupported scheme: {other}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|()| SubscriptionError::InvalidEndpoint("scheme substitution failed".into()))?;
    Ok(url)
}

/// Derive the SSE URL: the HTTP(S) endpoint with `query` and, when
/// non-empty, JSON-encoded `variables` appended as query parameters.
pub(crate) fn sse_url(
    endpoint: &str,
    query: &str,
    variables: &Map<String, Value>,
) -> Result<Url, SubscriptionError> {
    let mut url =
        Url::parse(endpoint).map_err(|err| SubscriptionError::InvalidEndpoint(err.to_string()))?;
    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(SubscriptionError::InvalidEndpoint(format!(
                "unsupported scheme: {other}"
            )))
        }
    }
    let encoded_variables = if variables.is_empty() {
        None
    } else {
        Some(
            serde_json::to_string(variables)
                .map_err(|err| SubscriptionError::InvalidEndpoint(err.to_string()))?,
        )
    };
    {
        let mut pairs = url.query_pairs_mut();
        pairs.append_pair("query", query);
        if let Some(json) = &encoded_variables {
            pairs.append_pair("variables", json);
        }
    }
    Ok(url)
}
