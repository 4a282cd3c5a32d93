//! `graphql-transport-ws` transport adapter.
//!
//! Per-attempt progression:
//! `opened -> awaiting-ack -> subscribed -> {receiving | errored | completed} -> closed`.
//! `subscribe` is sent only after `connection_ack`, once per attempt.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

use crate::error::SubscriptionError;
use crate::manager::{ConnectionConfig, SubscriptionSpec};
use crate::protocol::{ClientMessage, ServerMessage, GRAPHQL_WS_PROTOCOL, SUBSCRIPTION_ID};
use crate::transport::{websocket_url, ConnectionState, Transport, TransportEvent};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Message reported when the socket fails before acknowledgement.
const CONNECT_FAILED: &str = "WebSocket connection failed";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum FrameOutcome {
    Continue,
    Ended,
}

/// One WebSocket connection attempt.
pub struct WebSocketTransport {
    url: Url,
    headers: HashMap<String, String>,
    query: String,
    variables: Map<String, Value>,
}

impl WebSocketTransport {
    /// Bind an adapter to the given configuration. Fails when the
    /// endpoint cannot be turned into a WebSocket URL.
    pub fn new(
        config: &ConnectionConfig,
        spec: &SubscriptionSpec,
    ) -> Result<Self, SubscriptionError> {
        Ok(Self {
            url: websocket_url(&config.endpoint)?,
            headers: config.headers.clone(),
            query: spec.query.clone(),
            variables: spec.variables.clone(),
        })
    }

    fn init_message(&self) -> ClientMessage {
        let payload = if self.headers.is_empty() {
            None
        } else {
            Some(
                self.headers
                    .iter()
                    .map(|(name, value)| (name.clone(), Value::String(value.clone())))
                    .collect(),
            )
        };
        ClientMessage::ConnectionInit { payload }
    }

    async fn open(&self) -> Result<WsStream, SubscriptionError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|err| SubscriptionError::Transport(err.to_string()))?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static(GRAPHQL_WS_PROTOCOL),
        );
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) =
                (name.parse::<HeaderName>(), HeaderValue::from_str(value))
            {
                request.headers_mut().insert(name, value);
            }
        }

        let (socket, _response) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(request))
            .await
            .map_err(|_| SubscriptionError::Transport("WebSocket handshake timed out".into()))?
            .map_err(|err| SubscriptionError::Transport(err.to_string()))?;
        Ok(socket)
    }

    async fn handle_frame(
        &self,
        frame: &str,
        socket: &mut WsStream,
        acked: &mut bool,
        events: &mpsc::Sender<TransportEvent>,
    ) -> FrameOutcome {
        let message = match ServerMessage::decode(frame) {
            Ok(message) => message,
            Err(err) => {
                emit(
                    events,
                    TransportEvent::Error(SubscriptionError::Decode(err.to_string())),
                )
                .await;
                return FrameOutcome::Continue;
            }
        };

        match message {
            ServerMessage::ConnectionAck { .. } => {
                if *acked {
                    return FrameOutcome::Continue;
                }
                *acked = true;
                emit(
                    events,
                    TransportEvent::StateChanged(ConnectionState::Connected),
                )
                .await;
                let subscribe =
                    ClientMessage::subscribe(self.query.clone(), self.variables.clone());
                if send_message(socket, &subscribe).await.is_err() {
                    fail(events, *acked).await;
                    return FrameOutcome::Ended;
                }
                FrameOutcome::Continue
            }
            ServerMessage::Next { id, payload } => {
                // null data carries no delivery
                if id == SUBSCRIPTION_ID && !payload.data.is_null() {
                    emit(events, TransportEvent::Data(payload.data)).await;
                }
                FrameOutcome::Continue
            }
            ServerMessage::Error { id, payload } => {
                if id == SUBSCRIPTION_ID {
                    emit(
                        events,
                        TransportEvent::Error(SubscriptionError::graphql(&payload)),
                    )
                    .await;
                }
                FrameOutcome::Continue
            }
            ServerMessage::Complete { .. } => {
                // Orderly server-side end of the subscription.
                debug!("server completed subscription");
                let _ = socket.close(None).await;
                emit(
                    events,
                    TransportEvent::StateChanged(ConnectionState::Disconnected),
                )
                .await;
                FrameOutcome::Ended
            }
            ServerMessage::Ping { payload } => {
                let _ = send_message(socket, &ClientMessage::Pong { payload }).await;
                FrameOutcome::Continue
            }
            ServerMessage::Pong { .. } => FrameOutcome::Continue,
        }
    }

    async fn graceful_close(&self, socket: &mut WsStream) {
        if let Ok(frame) = ClientMessage::complete().encode() {
            let _ = socket.send(Message::Text(frame)).await;
        }
        let _ = socket.close(None).await;
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn run(
        &mut self,
        events: mpsc::Sender<TransportEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut socket = match self.open().await {
            Ok(socket) => socket,
            Err(err) => {
                warn!(error = %err, url = %self.url, "websocket connect failed");
                fail(&events, false).await;
                return;
            }
        };

        if send_message(&mut socket, &self.init_message()).await.is_err() {
            fail(&events, false).await;
            return;
        }

        let mut acked = false;
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    self.graceful_close(&mut socket).await;
                    return;
                }
                frame = socket.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        if let FrameOutcome::Ended =
                            self.handle_frame(&text, &mut socket, &mut acked, &events).await
                        {
                            return;
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        let text = String::from_utf8_lossy(&bytes).into_owned();
                        if let FrameOutcome::Ended =
                            self.handle_frame(&text, &mut socket, &mut acked, &events).await
                        {
                            return;
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = socket.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Pong(_) | Message::Frame(_))) => {}
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                        fail(&events, acked).await;
                        return;
                    }
                }
            }
        }
    }
}

/// Report the end of an attempt with a single failure transition: before
/// acknowledgement the attempt failed to establish, afterwards the
/// established connection was lost.
async fn fail(events: &mpsc::Sender<TransportEvent>, acked: bool) {
    if acked {
        emit(
            events,
            TransportEvent::StateChanged(ConnectionState::Disconnected),
        )
        .await;
    } else {
        emit(
            events,
            TransportEvent::Error(SubscriptionError::Transport(CONNECT_FAILED.into())),
        )
        .await;
        emit(events, TransportEvent::StateChanged(ConnectionState::Error)).await;
    }
}

async fn emit(events: &mpsc::Sender<TransportEvent>, event: TransportEvent) {
    let _ = events.send(event).await;
}

async fn send_message(
    socket: &mut WsStream,
    message: &ClientMessage,
) -> Result<(), SubscriptionError> {
    let frame = message
        .encode()
        .map_err(|err| SubscriptionError::Decode(err.to_string()))?;
    socket
        .send(Message::Text(frame))
        .await
        .map_err(|err| SubscriptionError::Transport(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportKind;

    fn spec() -> SubscriptionSpec {
        SubscriptionSpec::new("subscription { orderUpdated { id } }")
            .with_transport(TransportKind::WebSocket)
    }

    #[test]
    fn init_message_omits_payload_without_headers() {
        let config = ConnectionConfig::new("http://localhost/graphql");
        let adapter = WebSocketTransport::new(&config, &spec()).unwrap();
        assert_eq!(
            adapter.init_message(),
            ClientMessage::ConnectionInit { payload: None }
        );
    }

    #[test]
    fn init_message_carries_headers() {
        let config = ConnectionConfig::new("http://localhost/graphql")
            .with_header("authorization", "Bearer t");
        let adapter = WebSocketTransport::new(&config, &spec()).unwrap();
        match adapter.init_message() {
            ClientMessage::ConnectionInit {
                payload: Some(payload),
            } => {
                assert_eq!(payload["authorization"], Value::String("Bearer t".into()));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn adapter_derives_websocket_scheme() {
        let config = ConnectionConfig::new("https://example.com/graphql");
        let adapter = WebSocketTransport::new(&config, &spec()).unwrap();
        assert_eq!(adapter.url.scheme(), "wss");
    }
}
