//! Connection Gateway
//!
//! Owns the single transport connection shared by every script owner. The
//! gateway is the only writer of the subscription table and of the pending
//! reply table; owners go through its methods.
//!
//! A background reader task drains the transport's event stream, delivers
//! inbound events to the subscribed handler, completes reply correlations and
//! raises a connection-state signal once per transition.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::signal::{Signal, SubscriptionHandle};
use crate::transport::{AckId, Transport, TransportError, TransportEvent};

/// Handler for events arriving under a subscribed name: `(scoped name, payload)`
pub type EventHandler = Arc<dyn Fn(&str, Value) + Send + Sync>;

/// One-shot handler for the reply to an `emit_with_callback` request
pub type ResponseHandler = Box<dyn FnOnce(AckId, Value) + Send>;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration & Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// How long a reply correlation stays open before it is discarded
    pub ack_timeout: Duration,
    /// Disconnect when the last running owner releases the gateway, and
    /// reconnect when the next one acquires it
    pub stop_on_idle: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(30),
            stop_on_idle: false,
        }
    }
}

impl GatewayConfig {
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn stop_on_idle(mut self, stop_on_idle: bool) -> Self {
        self.stop_on_idle = stop_on_idle;
        self
    }
}

/// Errors reported by the gateway
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("Gateway is disconnected, dropped '{0}'")]
    Disconnected(String),

    #[error("Cannot disconnect while {0} owner(s) are running")]
    OwnersRunning(usize),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Result type for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Connection state as observed by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection Gateway
// ─────────────────────────────────────────────────────────────────────────────

struct Subscription {
    namespace: String,
    handler: EventHandler,
}

struct PendingAck {
    name: String,
    deadline: Instant,
    handler: ResponseHandler,
}

/// Shared owner of the transport connection
pub struct ConnectionGateway {
    transport: Arc<dyn Transport>,
    config: GatewayConfig,
    /// Scoped name -> the one handler for it
    subscriptions: Mutex<HashMap<String, Subscription>>,
    /// Outstanding reply correlations
    acks: Mutex<HashMap<AckId, PendingAck>>,
    next_ack: AtomicU64,
    state: Mutex<ConnectionState>,
    state_signal: Mutex<Signal<ConnectionState>>,
    /// Running owner count. Held across any connect or disconnect it decides.
    running_owners: Mutex<usize>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionGateway {
    /// Create a gateway over `transport` and start its reader task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(transport: Arc<dyn Transport>, config: GatewayConfig) -> Arc<Self> {
        let events = transport.take_events();
        let sweep_every = config
            .ack_timeout
            .min(Duration::from_secs(1))
            .max(Duration::from_millis(1));

        let gateway = Arc::new(Self {
            transport,
            config,
            subscriptions: Mutex::new(HashMap::new()),
            acks: Mutex::new(HashMap::new()),
            next_ack: AtomicU64::new(1),
            state: Mutex::new(ConnectionState::Disconnected),
            state_signal: Mutex::new(Signal::new()),
            running_owners: Mutex::new(0),
            reader: Mutex::new(None),
        });

        match events {
            Some(events) => {
                let handle =
                    tokio::spawn(run_reader(Arc::downgrade(&gateway), events, sweep_every));
                *gateway.reader.lock() = Some(handle);
            }
            None => {
                warn!(
                    "Transport event stream already taken, gateway will receive no inbound traffic"
                );
            }
        }

        gateway
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    // ── Connection ──────────────────────────────────────────────────────────

    /// Open the shared connection
    pub fn connect(&self) -> GatewayResult<()> {
        self.transport.connect()?;
        Ok(())
    }

    /// Close the shared connection.
    ///
    /// Refused while any owner still holds the gateway.
    pub fn disconnect(&self) -> GatewayResult<()> {
        let running = self.running_owners.lock();
        if *running > 0 {
            return Err(GatewayError::OwnersRunning(*running));
        }
        self.transport.disconnect();
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Connection state as last reported by the transport
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Register a handler for connection-state transitions.
    ///
    /// Handlers run on the gateway's reader task and must not call back into
    /// the gateway's state-handler methods.
    pub fn on_state_change(
        &self,
        handler: impl FnMut(&ConnectionState) + Send + 'static,
    ) -> SubscriptionHandle {
        self.state_signal.lock().subscribe(handler)
    }

    pub fn remove_state_handler(&self, handle: SubscriptionHandle) -> bool {
        self.state_signal.lock().unsubscribe(handle)
    }

    /// Record a running owner. With `stop_on_idle`, reconnects if needed.
    pub fn acquire(&self) {
        let mut running = self.running_owners.lock();
        *running += 1;
        debug!(running = *running, "Gateway acquired");

        if self.config.stop_on_idle && !self.transport.is_connected() {
            if let Err(e) = self.transport.connect() {
                warn!(error = %e, "Failed to reconnect transport on acquire");
            }
        }
    }

    /// Release a running owner. With `stop_on_idle`, the last release
    /// disconnects the transport.
    pub fn release(&self) {
        let mut running = self.running_owners.lock();
        let previous = *running;
        *running = previous.saturating_sub(1);
        debug!(running = *running, "Gateway released");

        if previous == 1 && self.config.stop_on_idle {
            info!("No running owners left, disconnecting transport");
            self.transport.disconnect();
        }
    }

    pub fn running_owners(&self) -> usize {
        *self.running_owners.lock()
    }

    // ── Emit ────────────────────────────────────────────────────────────────

    /// Fire-and-forget send
    pub fn emit(&self, scoped_name: &str, payload: Value, namespace: &str) -> GatewayResult<()> {
        if !self.transport.is_connected() {
            warn!(event = scoped_name, "Dropping emit while disconnected");
            return Err(GatewayError::Disconnected(scoped_name.to_string()));
        }
        self.transport
            .emit(scoped_name, payload, namespace, None)
            .map_err(|e| self.map_send_error(scoped_name, e))
    }

    /// Send and call `on_response` once when the correlated reply arrives.
    ///
    /// The handler is dropped without being called if no reply arrives before
    /// `ack_timeout`, or if the connection drops first.
    pub fn emit_with_callback(
        &self,
        scoped_name: &str,
        payload: Value,
        namespace: &str,
        on_response: ResponseHandler,
    ) -> GatewayResult<AckId> {
        if !self.transport.is_connected() {
            warn!(event = scoped_name, "Dropping emit while disconnected");
            return Err(GatewayError::Disconnected(scoped_name.to_string()));
        }

        let id = self.next_ack.fetch_add(1, Ordering::SeqCst);
        self.acks.lock().insert(
            id,
            PendingAck {
                name: scoped_name.to_string(),
                deadline: Instant::now() + self.config.ack_timeout,
                handler: on_response,
            },
        );

        if let Err(e) = self.transport.emit(scoped_name, payload, namespace, Some(id)) {
            self.acks.lock().remove(&id);
            return Err(self.map_send_error(scoped_name, e));
        }

        trace!(event = scoped_name, ack = id, "Emitted with callback");
        Ok(id)
    }

    fn map_send_error(&self, scoped_name: &str, error: TransportError) -> GatewayError {
        match error {
            TransportError::NotConnected => {
                warn!(event = scoped_name, "Dropping emit while disconnected");
                GatewayError::Disconnected(scoped_name.to_string())
            }
            other => other.into(),
        }
    }

    /// Number of reply correlations still open
    pub fn pending_acks(&self) -> usize {
        self.acks.lock().len()
    }

    /// Discard reply correlations whose deadline has passed
    pub fn expire_acks(&self) -> usize {
        let now = Instant::now();
        let mut acks = self.acks.lock();
        let before = acks.len();
        acks.retain(|id, ack| {
            let keep = ack.deadline > now;
            if !keep {
                debug!(event = %ack.name, ack = id, "Reply correlation expired");
            }
            keep
        });
        before - acks.len()
    }

    // ── Subscriptions ───────────────────────────────────────────────────────

    /// Register the handler for `scoped_name`, replacing any previous one.
    ///
    /// Returns true if a previous handler was replaced.
    pub fn subscribe(&self, scoped_name: &str, namespace: &str, handler: EventHandler) -> bool {
        let replaced = self
            .subscriptions
            .lock()
            .insert(
                scoped_name.to_string(),
                Subscription {
                    namespace: namespace.to_string(),
                    handler,
                },
            )
            .is_some();

        debug!(event = scoped_name, namespace, replaced, "Subscribed");
        replaced
    }

    /// Remove the handler for `scoped_name`. Returns false if none existed.
    pub fn unsubscribe(&self, scoped_name: &str) -> bool {
        let removed = self.subscriptions.lock().remove(scoped_name).is_some();
        debug!(event = scoped_name, removed, "Unsubscribed");
        removed
    }

    pub fn is_subscribed(&self, scoped_name: &str) -> bool {
        self.subscriptions.lock().contains_key(scoped_name)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    // ── Inbound ─────────────────────────────────────────────────────────────

    fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => self.set_state(ConnectionState::Connected),
            TransportEvent::Disconnected => {
                self.set_state(ConnectionState::Disconnected);
                let dropped = {
                    let mut acks = self.acks.lock();
                    let n = acks.len();
                    acks.clear();
                    n
                };
                if dropped > 0 {
                    debug!(dropped, "Discarded reply correlations on disconnect");
                }
            }
            TransportEvent::Message {
                name,
                namespace,
                payload,
            } => {
                let handler = {
                    let subscriptions = self.subscriptions.lock();
                    match subscriptions.get(&name) {
                        Some(sub) if sub.namespace == namespace => Some(Arc::clone(&sub.handler)),
                        Some(sub) => {
                            trace!(
                                event = %name,
                                expected = %sub.namespace,
                                got = %namespace,
                                "Namespace mismatch, dropping event"
                            );
                            None
                        }
                        None => None,
                    }
                };

                match handler {
                    Some(handler) => handler(&name, payload),
                    None => trace!(event = %name, "No subscriber for event"),
                }
            }
            TransportEvent::Ack { id, payload } => {
                let ack = self.acks.lock().remove(&id);
                match ack {
                    Some(ack) => (ack.handler)(id, payload),
                    None => debug!(ack = id, "Reply for unknown or expired correlation"),
                }
            }
        }
    }

    fn set_state(&self, new_state: ConnectionState) {
        {
            let mut state = self.state.lock();
            if *state == new_state {
                debug!(state = %new_state, "Ignoring repeated connection state");
                return;
            }
            *state = new_state;
        }
        info!(state = %new_state, "Gateway connection state changed");
        self.state_signal.lock().emit(&new_state);
    }

    /// Stop the reader task and drop every subscription and correlation
    pub fn shutdown(&self) {
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
        self.subscriptions.lock().clear();
        self.acks.lock().clear();
    }
}

impl Drop for ConnectionGateway {
    fn drop(&mut self) {
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for ConnectionGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionGateway")
            .field("state", &self.state())
            .field("subscriptions", &self.subscription_count())
            .field("pending_acks", &self.pending_acks())
            .field("running_owners", &self.running_owners())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Reader Task
// ─────────────────────────────────────────────────────────────────────────────

async fn run_reader(
    gateway: Weak<ConnectionGateway>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    sweep_every: Duration,
) {
    let mut sweep = tokio::time::interval(sweep_every);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    debug!("Transport event stream closed");
                    break;
                };
                let Some(gateway) = gateway.upgrade() else { break };
                gateway.handle_transport_event(event);
            }

            _ = sweep.tick() => {
                let Some(gateway) = gateway.upgrade() else { break };
                gateway.expire_acks();
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
