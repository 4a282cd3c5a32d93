//! Connection manager: owns the current transport adapter, drives
//! bounded reconnection, and folds adapter signals into the observable
//! snapshot and one ordered caller-facing event stream.
//!
//! All mutable engine state lives inside a single driver task, so every
//! signal is applied strictly in delivery order without locks. The
//! reconnect delay is one cancellable sleep slot: scheduling a new delay
//! can only happen after the previous one resolved or was cancelled.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::backoff::{BackoffPolicy, DEFAULT_RECONNECT_ATTEMPTS, DEFAULT_RECONNECT_BASE_DELAY};
use crate::error::SubscriptionError;
use crate::sse::SseTransport;
use crate::transport::{
    ConnectionState, ResolvedTransport, Transport, TransportEvent, TransportKind,
};
use crate::websocket::WebSocketTransport;

const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Endpoint and ambient connection settings supplied by the application.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// HTTP(S) endpoint. The WebSocket URL is derived from it by scheme
    /// substitution; SSE uses it as-is plus query parameters.
    pub endpoint: String,
    /// Headers for the WebSocket handshake / SSE request.
    pub headers: HashMap<String, String>,
    /// Whether the environment can open WebSocket connections. Injected
    /// rather than probed so the engine stays testable anywhere.
    pub websocket_supported: bool,
}

impl ConnectionConfig {
    /// Create a configuration for the given endpoint.
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            headers: HashMap::new(),
            websocket_supported: true,
        }
    }

    /// Add a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Override the WebSocket capability flag.
    #[must_use]
    pub const fn with_websocket_supported(mut self, supported: bool) -> Self {
        self.websocket_supported = supported;
        self
    }
}

/// What to subscribe to and how persistently to keep the channel alive.
///
/// Immutable per connection attempt; changing any identity-relevant
/// field means disposing the engine and starting a fresh one.
#[derive(Debug, Clone)]
pub struct SubscriptionSpec {
    /// Opaque subscription document.
    pub query: String,
    /// Operation variables.
    pub variables: Map<String, Value>,
    /// Transport selection.
    pub transport: TransportKind,
    /// When false, the engine stays disconnected and takes no network
    /// action.
    pub enabled: bool,
    /// Reconnect budget after the initial attempt.
    pub reconnect_attempts: u32,
    /// Base delay for exponential reconnect backoff.
    pub reconnect_base_delay: Duration,
}

impl SubscriptionSpec {
    /// Create a spec for the given subscription document.
    #[must_use]
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            variables: Map::new(),
            transport: TransportKind::Auto,
            enabled: true,
            reconnect_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            reconnect_base_delay: DEFAULT_RECONNECT_BASE_DELAY,
        }
    }

    /// Add one operation variable.
    #[must_use]
    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    /// Replace all operation variables.
    #[must_use]
    pub fn with_variables(mut self, variables: Map<String, Value>) -> Self {
        self.variables = variables;
        self
    }

    /// Set the transport selection.
    #[must_use]
    pub const fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    /// Enable or disable the subscription.
    #[must_use]
    pub const fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the reconnect budget.
    #[must_use]
    pub const fn with_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.reconnect_attempts = attempts;
        self
    }

    /// Set the backoff base delay.
    #[must_use]
    pub const fn with_reconnect_base_delay(mut self, delay: Duration) -> Self {
        self.reconnect_base_delay = delay;
        self
    }
}

/// The caller-visible `{data, state, error}` triple, replaced wholesale
/// on every update — never partially mutated in view of the caller.
#[derive(Debug, Clone)]
pub struct SubscriptionSnapshot {
    /// Most recently pushed data, if any arrived yet.
    pub data: Option<Value>,
    /// Current connection state.
    pub state: ConnectionState,
    /// Most recent error; cleared when fresh data arrives.
    pub error: Option<SubscriptionError>,
}

impl SubscriptionSnapshot {
    const fn initial(state: ConnectionState) -> Self {
        Self {
            data: None,
            state,
            error: None,
        }
    }

    /// Returns `true` while the channel is live.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.state.is_connected()
    }
}

/// Engine-to-caller notifications, delivered in order on one channel.
#[derive(Debug, Clone)]
pub enum SubscriptionEvent {
    /// Lifecycle transition.
    StateChanged(ConnectionState),
    /// One pushed execution result.
    Data(Value),
    /// An error that did not change the connection state by itself.
    Error(SubscriptionError),
}

/// Ordered stream of [`SubscriptionEvent`]s. Ends when the engine stops,
/// whether by disposal or by exhausting its reconnect budget.
pub type SubscriptionEvents = ReceiverStream<SubscriptionEvent>;

/// Entry point: binds a configuration and a spec, then starts the
/// engine.
#[derive(Debug, Clone)]
pub struct SubscriptionClient {
    config: ConnectionConfig,
    spec: SubscriptionSpec,
}

impl SubscriptionClient {
    /// Bind a configuration and a subscription spec.
    #[must_use]
    pub const fn new(config: ConnectionConfig, spec: SubscriptionSpec) -> Self {
        Self { config, spec }
    }

    /// Start the engine.
    ///
    /// With a disabled spec the snapshot is set to
    /// [`ConnectionState::Disconnected`] and no network action is taken.
    /// Otherwise the transport is resolved against the capability flag
    /// and a driver task begins connecting.
    #[must_use]
    pub fn start(self) -> (SubscriptionHandle, SubscriptionEvents) {
        let resolved = self.spec.transport.resolve(self.config.websocket_supported);
        self.start_with(move |config, spec| build_transport(resolved, config, spec))
    }

    fn start_with<F>(self, factory: F) -> (SubscriptionHandle, SubscriptionEvents)
    where
        F: FnMut(&ConnectionConfig, &SubscriptionSpec) -> Result<Box<dyn Transport>, SubscriptionError>
            + Send
            + 'static,
    {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        if !self.spec.enabled {
            let (_, snapshot_rx) =
                watch::channel(SubscriptionSnapshot::initial(ConnectionState::Disconnected));
            let handle = SubscriptionHandle {
                snapshot: snapshot_rx,
                shutdown: shutdown_tx,
                task: None,
            };
            return (handle, ReceiverStream::new(events_rx));
        }

        let (snapshot_tx, snapshot_rx) =
            watch::channel(SubscriptionSnapshot::initial(ConnectionState::Connecting));
        let task = tokio::spawn(drive(
            self.config,
            self.spec,
            factory,
            snapshot_tx,
            events_tx,
            shutdown_rx,
        ));
        let handle = SubscriptionHandle {
            snapshot: snapshot_rx,
            shutdown: shutdown_tx,
            task: Some(task),
        };
        (handle, ReceiverStream::new(events_rx))
    }
}

fn build_transport(
    resolved: ResolvedTransport,
    config: &ConnectionConfig,
    spec: &SubscriptionSpec,
) -> Result<Box<dyn Transport>, SubscriptionError> {
    Ok(match resolved {
        ResolvedTransport::WebSocket => Box::new(WebSocketTransport::new(config, spec)?),
        ResolvedTransport::Sse => Box::new(SseTransport::new(config, spec)?),
    })
}

/// Owner handle for a running engine.
///
/// Dropping the handle disposes the engine.
#[derive(Debug)]
pub struct SubscriptionHandle {
    snapshot: watch::Receiver<SubscriptionSnapshot>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl SubscriptionHandle {
    /// Current `{data, state, error}` triple, readable synchronously at
    /// any time.
    #[must_use]
    pub fn snapshot(&self) -> SubscriptionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.snapshot.borrow().state
    }

    /// Returns `true` once [`dispose`](Self::dispose) has run.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Tear the engine down: cancel any pending reconnect, close the
    /// active transport gracefully, and discard every signal still in
    /// flight. Idempotent.
    pub fn dispose(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Dispose and wait for the driver task to finish.
    pub async fn stop(mut self) {
        self.dispose();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// Driver task: runs connection attempts until disposed or the
/// reconnect budget is exhausted.
async fn drive<F>(
    config: ConnectionConfig,
    spec: SubscriptionSpec,
    mut factory: F,
    snapshot: watch::Sender<SubscriptionSnapshot>,
    events: mpsc::Sender<SubscriptionEvent>,
    mut shutdown: watch::Receiver<bool>,
) where
    F: FnMut(&ConnectionConfig, &SubscriptionSpec) -> Result<Box<dyn Transport>, SubscriptionError>
        + Send,
{
    let backoff = BackoffPolicy::new(spec.reconnect_base_delay);
    let mut attempts: u32 = 0;
    let mut current = SubscriptionSnapshot::initial(ConnectionState::Connecting);
    let _ = events
        .send(SubscriptionEvent::StateChanged(ConnectionState::Connecting))
        .await;

    loop {
        let failed = run_attempt(
            &config,
            &spec,
            &mut factory,
            &snapshot,
            &events,
            &shutdown,
            &mut current,
            &mut attempts,
        )
        .await;

        if *shutdown.borrow() {
            break;
        }
        if !failed {
            break;
        }
        if attempts >= spec.reconnect_attempts {
            // Budget exhausted: the last state and error stay sticky.
            debug!(attempts, "reconnect budget exhausted");
            break;
        }

        let delay = backoff.delay_for_attempt(attempts);
        attempts += 1;
        debug!(
            attempt = attempts,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "scheduling reconnect"
        );
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
        apply(
            &snapshot,
            &events,
            &mut current,
            SubscriptionEvent::StateChanged(ConnectionState::Connecting),
        )
        .await;
    }
}

/// Run one connection attempt to completion, folding its events in
/// delivery order. Returns `true` when the attempt ended in a terminal
/// failure state and the reconnect policy applies.
#[allow(clippy::too_many_arguments)]
async fn run_attempt<F>(
    config: &ConnectionConfig,
    spec: &SubscriptionSpec,
    factory: &mut F,
    snapshot: &watch::Sender<SubscriptionSnapshot>,
    events: &mpsc::Sender<SubscriptionEvent>,
    shutdown: &watch::Receiver<bool>,
    current: &mut SubscriptionSnapshot,
    attempts: &mut u32,
) -> bool
where
    F: FnMut(&ConnectionConfig, &SubscriptionSpec) -> Result<Box<dyn Transport>, SubscriptionError>
        + Send,
{
    let transport = match factory(config, spec) {
        Ok(transport) => transport,
        Err(err) => {
            warn!(error = %err, "transport setup failed");
            apply(snapshot, events, current, SubscriptionEvent::Error(err)).await;
            apply(
                snapshot,
                events,
                current,
                SubscriptionEvent::StateChanged(ConnectionState::Error),
            )
            .await;
            return true;
        }
    };

    let (tx, mut rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let adapter_shutdown = shutdown.clone();
    let task = tokio::spawn(async move {
        let mut transport = transport;
        transport.run(tx, adapter_shutdown).await;
    });

    let mut failed = false;
    loop {
        let Some(event) = rx.recv().await else { break };
        // Anything delivered after disposal is discarded unconditionally.
        if *shutdown.borrow() {
            break;
        }
        match event {
            TransportEvent::StateChanged(state) => {
                if state == ConnectionState::Connected {
                    *attempts = 0;
                }
                if state.is_terminal() {
                    failed = true;
                }
                apply(
                    snapshot,
                    events,
                    current,
                    SubscriptionEvent::StateChanged(state),
                )
                .await;
            }
            TransportEvent::Data(value) => {
                apply(snapshot, events, current, SubscriptionEvent::Data(value)).await;
            }
            TransportEvent::Error(err) => {
                apply(snapshot, events, current, SubscriptionEvent::Error(err)).await;
            }
        }
    }
    // unblocks an adapter mid-send before the join below
    drop(rx);
    let _ = task.await;
    failed
}

/// Fold one event into the snapshot, publish it wholesale, then forward
/// the event. Snapshot updates always precede the matching event so a
/// caller reading the snapshot from an event handler sees it current.
async fn apply(
    snapshot: &watch::Sender<SubscriptionSnapshot>,
    events: &mpsc::Sender<SubscriptionEvent>,
    current: &mut SubscriptionSnapshot,
    event: SubscriptionEvent,
) {
    match &event {
        SubscriptionEvent::StateChanged(state) => current.state = *state,
        SubscriptionEvent::Data(value) => {
            current.data = Some(value.clone());
            current.error = None;
        }
        SubscriptionEvent::Error(err) => current.error = Some(err.clone()),
    }
    let _ = snapshot.send(current.clone());
    let _ = events.send(event).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Instant;
    use tokio_stream::StreamExt;

    /// Scripted transport: replays a fixed event list, then either ends
    /// or holds the attempt open until shutdown.
    struct ScriptedTransport {
        script: Vec<TransportEvent>,
        hold_open: bool,
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn run(
            &mut self,
            events: mpsc::Sender<TransportEvent>,
            mut shutdown: watch::Receiver<bool>,
        ) {
            for event in self.script.clone() {
                let _ = events.send(event).await;
            }
            if self.hold_open {
                let _ = shutdown.changed().await;
            }
        }
    }

    fn failing_attempt() -> Vec<TransportEvent> {
        vec![
            TransportEvent::Error(SubscriptionError::Transport(
                "WebSocket connection failed".into(),
            )),
            TransportEvent::StateChanged(ConnectionState::Error),
        ]
    }

    /// Start an engine whose attempts replay `scripts` in order; the
    /// last script repeats if more attempts happen. Returns the run
    /// counter alongside the handle and event stream.
    fn scripted_client(
        spec: SubscriptionSpec,
        scripts: Vec<Vec<TransportEvent>>,
        hold_open_last: bool,
    ) -> (SubscriptionHandle, SubscriptionEvents, Arc<AtomicU32>) {
        let runs = Arc::new(AtomicU32::new(0));
        let runs_in_factory = runs.clone();
        let scripts = Arc::new(Mutex::new(scripts));
        let client =
            SubscriptionClient::new(ConnectionConfig::new("http://localhost/graphql"), spec);
        let (handle, events) = client.start_with(move |_config, _spec| {
            let attempt = runs_in_factory.fetch_add(1, Ordering::SeqCst) as usize;
            let scripts = scripts.lock().unwrap();
            let index = attempt.min(scripts.len() - 1);
            let hold_open = hold_open_last && index == scripts.len() - 1;
            Ok(Box::new(ScriptedTransport {
                script: scripts[index].clone(),
                hold_open,
            }) as Box<dyn Transport>)
        });
        (handle, events, runs)
    }

    #[tokio::test]
    async fn disabled_spec_stays_disconnected() {
        let spec = SubscriptionSpec::new("subscription { a }").with_enabled(false);
        let client =
            SubscriptionClient::new(ConnectionConfig::new("http://localhost/graphql"), spec);
        let (handle, mut events) = client.start_with(|_, _| {
            panic!("disabled spec must not build a transport");
        });

        assert_eq!(handle.state(), ConnectionState::Disconnected);
        assert!(events.next().await.is_none());
    }

    #[tokio::test]
    async fn retries_until_budget_exhausted() {
        let spec = SubscriptionSpec::new("subscription { a }")
            .with_reconnect_attempts(3)
            .with_reconnect_base_delay(Duration::from_millis(20));
        let started = Instant::now();
        let (handle, events, runs) = scripted_client(spec, vec![failing_attempt()], false);

        let collected: Vec<_> = events.collect().await;
        let error_states = collected
            .iter()
            .filter(|event| {
                matches!(
                    event,
                    SubscriptionEvent::StateChanged(ConnectionState::Error)
                )
            })
            .count();

        // initial attempt plus the full budget, each ending in Error
        assert_eq!(runs.load(Ordering::SeqCst), 4);
        assert_eq!(error_states, 4);
        // 20 + 40 + 80 ms of backoff at minimum
        assert!(started.elapsed() >= Duration::from_millis(140));
        // the last failure stays sticky
        let snapshot = handle.snapshot();
        assert_eq!(snapshot.state, ConnectionState::Error);
        assert_eq!(
            snapshot.error,
            Some(SubscriptionError::Transport(
                "WebSocket connection failed".into()
            ))
        );
    }

    #[tokio::test]
    async fn connected_resets_attempt_counter() {
        // Budget of two: without the reset, the third run would be the
        // last; with it, the post-success failures earn a fresh budget.
        let spec = SubscriptionSpec::new("subscription { a }")
            .with_reconnect_attempts(2)
            .with_reconnect_base_delay(Duration::from_millis(1));
        let scripts = vec![
            failing_attempt(),
            failing_attempt(),
            vec![
                TransportEvent::StateChanged(ConnectionState::Connected),
                TransportEvent::StateChanged(ConnectionState::Disconnected),
            ],
            failing_attempt(),
            failing_attempt(),
        ];
        let (_handle, events, runs) = scripted_client(spec, scripts, false);

        let _: Vec<_> = events.collect().await;
        assert_eq!(runs.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn graphql_error_leaves_state_connected() {
        let spec = SubscriptionSpec::new("subscription { a }").with_reconnect_attempts(0);
        let script = vec![
            TransportEvent::StateChanged(ConnectionState::Connected),
            TransportEvent::Error(SubscriptionError::Graphql {
                message: "Permission denied".into(),
            }),
            TransportEvent::Data(json!({"orderUpdated": {"id": 42}})),
        ];
        let (handle, mut events, _runs) = scripted_client(spec, vec![script], true);

        loop {
            match events.next().await.expect("stream ended early") {
                SubscriptionEvent::Error(err) => {
                    assert_eq!(err.to_string(), "Permission denied");
                    let snapshot = handle.snapshot();
                    assert_eq!(snapshot.state, ConnectionState::Connected);
                    assert!(snapshot.error.is_some());
                }
                SubscriptionEvent::Data(value) => {
                    assert_eq!(value, json!({"orderUpdated": {"id": 42}}));
                    let snapshot = handle.snapshot();
                    // fresh data clears the stored error
                    assert!(snapshot.error.is_none());
                    assert!(snapshot.is_connected());
                    break;
                }
                SubscriptionEvent::StateChanged(_) => {}
            }
        }
        handle.stop().await;
    }

    #[tokio::test]
    async fn dispose_cancels_pending_reconnect() {
        let spec = SubscriptionSpec::new("subscription { a }")
            .with_reconnect_attempts(5)
            .with_reconnect_base_delay(Duration::from_millis(100));
        let (handle, mut events, runs) = scripted_client(spec, vec![failing_attempt()], false);

        // wait for the first attempt to fail, then dispose mid-backoff
        loop {
            match events.next().await.expect("stream ended early") {
                SubscriptionEvent::StateChanged(ConnectionState::Error) => break,
                _ => {}
            }
        }
        handle.dispose();
        assert!(handle.is_disposed());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dispose_is_idempotent() {
        let spec = SubscriptionSpec::new("subscription { a }").with_reconnect_attempts(0);
        let script = vec![TransportEvent::StateChanged(ConnectionState::Connected)];
        let (handle, events, _runs) = scripted_client(spec, vec![script], true);

        handle.dispose();
        handle.dispose();
        assert!(handle.is_disposed());
        handle.stop().await;

        // the event stream ends once the driver is gone
        let _: Vec<_> = events.collect().await;
    }
}
