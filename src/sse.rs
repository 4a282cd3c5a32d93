//! Server-Sent Events transport adapter.
//!
//! One GET stream per attempt; the subscription document and its
//! variables travel as URL query parameters, and each event's `data:`
//! body is an execution result. SSE has no unsubscribe handshake, so
//! closing simply drops the stream.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use futures_util::StreamExt;
use tokio::sync::{mpsc, watch};
use tracing::warn;
use url::Url;

use crate::error::SubscriptionError;
use crate::manager::{ConnectionConfig, SubscriptionSpec};
use crate::protocol::SseMessage;
use crate::transport::{sse_url, ConnectionState, Transport, TransportEvent};

/// Message reported when the stream fails to open or breaks mid-flight.
const STREAM_FAILED: &str = "SSE connection error";

/// One SSE connection attempt.
pub struct SseTransport {
    url: Url,
    headers: HashMap<String, String>,
    client: reqwest::Client,
}

impl SseTransport {
    /// Bind an adapter to the given configuration. Fails when the
    /// endpoint cannot be turned into a stream URL.
    pub fn new(
        config: &ConnectionConfig,
        spec: &SubscriptionSpec,
    ) -> Result<Self, SubscriptionError> {
        Ok(Self {
            url: sse_url(&config.endpoint, &spec.query, &spec.variables)?,
            headers: config.headers.clone(),
            client: reqwest::Client::new(),
        })
    }

    async fn dispatch(&self, body: &str, events: &mpsc::Sender<TransportEvent>) {
        let message: SseMessage = match serde_json::from_str(body) {
            Ok(message) => message,
            Err(err) => {
                emit(
                    events,
                    TransportEvent::Error(SubscriptionError::Decode(err.to_string())),
                )
                .await;
                return;
            }
        };
        if !message.errors.is_empty() {
            emit(
                events,
                TransportEvent::Error(SubscriptionError::graphql(&message.errors)),
            )
            .await;
        } else if let Some(value) = message.data {
            emit(events, TransportEvent::Data(value)).await;
        }
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn run(
        &mut self,
        events: mpsc::Sender<TransportEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut request = self
            .client
            .get(self.url.clone())
            .header("Accept", "text/event-stream")
            .header("Cache-Control", "no-cache");
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }

        let response = tokio::select! {
            _ = shutdown.changed() => return,
            response = request.send() => response,
        };
        let response = match response {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                warn!(status = %response.status(), url = %self.url, "sse request rejected");
                fail(&events).await;
                return;
            }
            Err(err) => {
                warn!(error = %err, url = %self.url, "sse request failed");
                fail(&events).await;
                return;
            }
        };

        emit(
            &events,
            TransportEvent::StateChanged(ConnectionState::Connected),
        )
        .await;

        let mut stream = response.bytes_stream();
        let mut parser = SseParser::new();
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                chunk = stream.next() => match chunk {
                    Some(Ok(bytes)) => {
                        for body in parser.feed(&bytes) {
                            self.dispatch(&body, &events).await;
                        }
                    }
                    Some(Err(err)) => {
                        warn!(error = %err, "sse stream failed");
                        fail(&events).await;
                        return;
                    }
                    None => {
                        emit(
                            &events,
                            TransportEvent::StateChanged(ConnectionState::Disconnected),
                        )
                        .await;
                        return;
                    }
                }
            }
        }
    }
}

async fn fail(events: &mpsc::Sender<TransportEvent>) {
    emit(
        events,
        TransportEvent::Error(SubscriptionError::Transport(STREAM_FAILED.into())),
    )
    .await;
    emit(events, TransportEvent::StateChanged(ConnectionState::Error)).await;
}

async fn emit(events: &mpsc::Sender<TransportEvent>, event: TransportEvent) {
    let _ = events.send(event).await;
}

/// Incremental parser for `text/event-stream` bodies.
///
/// Buffers bytes across chunk boundaries and yields the joined `data`
/// payload of each dispatched event. Comments and non-`data` fields are
/// ignored; multi-line `data:` fields are joined with newlines.
#[derive(Debug, Default)]
struct SseParser {
    buffer: BytesMut,
    data_lines: Vec<String>,
}

impl SseParser {
    fn new() -> Self {
        Self::default()
    }

    fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut bodies = Vec::new();
        while let Some(line) = self.next_line() {
            if line.is_empty() {
                if !self.data_lines.is_empty() {
                    bodies.push(self.data_lines.join("\n"));
                    self.data_lines.clear();
                }
            } else if let Some(value) = line.strip_prefix("data:") {
                self.data_lines
                    .push(value.strip_prefix(' ').unwrap_or(value).to_string());
            }
        }
        bodies
    }

    fn next_line(&mut self) -> Option<String> {
        let end = self
            .buffer
            .iter()
            .position(|byte| *byte == b'\n' || *byte == b'\r')?;
        let line = self.buffer.split_to(end);
        if self.buffer.starts_with(b"\r\n") {
            self.buffer.advance(2);
        } else {
            self.buffer.advance(1);
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }
}
