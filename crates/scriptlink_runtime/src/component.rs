//! Script Component
//!
//! A [`ScriptComponent`] is one owner: it holds at most one script process,
//! the event names bound for it and the callback bindings of its pending
//! exchanges. Many components share one [`ConnectionGateway`] and one
//! [`EventRouter`].
//!
//! All of a component's mutations happen on the context that calls its
//! methods. Work arriving from elsewhere (inbound events, connection
//! changes, process output) is queued on the component's inbox and applied
//! by [`ScriptComponent::pump`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::codec::{self, CodecError};
use crate::gateway::{ConnectionGateway, ConnectionState, GatewayError};
use crate::handler::HandlerInvoker;
use crate::pending::PendingBindingQueue;
use crate::process::{
    ProcessError, ProcessEvent, ProcessEventSink, ProcessId, ScriptProcessManager, ScriptRuntime,
};
use crate::router::{CallbackBinding, EventRouter, OwnerBindings, OwnerMessage, RoutedEvent};
use crate::signal::{Signal, SubscriptionHandle};
use crate::transport::AckId;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Per-component configuration
#[derive(Debug, Clone)]
pub struct ComponentConfig {
    /// Base directory for relative script paths
    pub scripts_root: Option<PathBuf>,
    /// How long a callback binding waits for its reply
    pub callback_timeout: Duration,
    /// Script started by [`ScriptComponent::activate`]
    pub default_script: Option<PathBuf>,
    pub run_default_on_start: bool,
}

impl Default for ComponentConfig {
    fn default() -> Self {
        Self {
            scripts_root: None,
            callback_timeout: Duration::from_secs(30),
            default_script: None,
            run_default_on_start: false,
        }
    }
}

impl ComponentConfig {
    pub fn with_scripts_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scripts_root = Some(root.into());
        self
    }

    pub fn with_callback_timeout(mut self, timeout: Duration) -> Self {
        self.callback_timeout = timeout;
        self
    }

    pub fn with_default_script(mut self, path: impl Into<PathBuf>) -> Self {
        self.default_script = Some(path.into());
        self
    }

    pub fn run_default_on_start(mut self, run: bool) -> Self {
        self.run_default_on_start = run;
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Signals & Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Payload of the script-error signal
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScriptFailure {
    pub script_path: PathBuf,
    pub message: String,
}

/// An event a script sent to its owner
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScriptEvent {
    pub event_name: String,
    pub payload: Value,
}

/// Observable lifecycle and traffic of a component
#[derive(Debug, Default)]
pub struct ComponentSignals {
    pub script_begin: Signal<ProcessId>,
    pub script_end: Signal<PathBuf>,
    pub script_error: Signal<ScriptFailure>,
    pub console_log: Signal<String>,
    pub event: Signal<ScriptEvent>,
}

/// Errors returned by component operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ComponentError {
    #[error("No script is running")]
    NotRunning,

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

/// Result type for component operations
pub type ComponentResult<T> = Result<T, ComponentError>;

// ─────────────────────────────────────────────────────────────────────────────
// Script Component
// ─────────────────────────────────────────────────────────────────────────────

/// One owner of a script process
pub struct ScriptComponent {
    id: Uuid,
    config: ComponentConfig,
    gateway: Arc<ConnectionGateway>,
    router: Arc<EventRouter>,
    invoker: Arc<dyn HandlerInvoker>,
    manager: ScriptProcessManager,
    pending: PendingBindingQueue<ScriptComponent>,
    bindings: OwnerBindings,
    signals: ComponentSignals,
    inbox_tx: mpsc::UnboundedSender<OwnerMessage>,
    inbox_rx: mpsc::UnboundedReceiver<OwnerMessage>,
    state_handle: SubscriptionHandle,
    /// Whether this component currently counts as a running gateway owner
    acquired: bool,
}

impl ScriptComponent {
    pub fn new(
        gateway: Arc<ConnectionGateway>,
        router: Arc<EventRouter>,
        runtime: Arc<dyn ScriptRuntime>,
        invoker: Arc<dyn HandlerInvoker>,
        config: ComponentConfig,
    ) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();

        let state_tx = inbox_tx.clone();
        let state_handle = gateway.on_state_change(move |state| {
            let _ = state_tx.send(OwnerMessage::Connection(*state));
        });

        let manager = ScriptProcessManager::new(runtime, config.scripts_root.clone());
        let id = Uuid::new_v4();
        debug!(component = %id, "Script component created");

        Self {
            id,
            config,
            gateway,
            router,
            invoker,
            manager,
            pending: PendingBindingQueue::new(),
            bindings: OwnerBindings::new(),
            signals: ComponentSignals::default(),
            inbox_tx,
            inbox_rx,
            state_handle,
            acquired: false,
        }
    }

    /// Run the configured default script if the config asks for it
    pub fn activate(&mut self) -> ComponentResult<Option<ProcessId>> {
        if !self.config.run_default_on_start {
            return Ok(None);
        }
        let Some(path) = self.config.default_script.clone() else {
            warn!(component = %self.id, "No default script configured");
            return Ok(None);
        };
        self.run_script(path).map(Some)
    }

    // ── Lifecycle ───────────────────────────────────────────────────────────

    /// Start `script_path` unless a script is already running
    pub fn run_script(&mut self, script_path: impl AsRef<Path>) -> ComponentResult<ProcessId> {
        let script_path = script_path.as_ref();
        let sink = self.process_sink();

        let process_id = match self.manager.start(script_path, sink) {
            Ok(id) => id,
            Err(e @ ProcessError::AlreadyRunning(_)) => return Err(e.into()),
            Err(e) => {
                error!(component = %self.id, error = %e, "Failed to start script");
                self.signals.script_error.emit(&ScriptFailure {
                    script_path: script_path.to_path_buf(),
                    message: e.to_string(),
                });
                return Err(e.into());
            }
        };

        self.router.register(process_id, self.inbox_tx.clone());
        self.gateway.acquire();
        self.acquired = true;

        self.signals.script_begin.emit(&process_id);
        self.flush_pending_if_ready();

        Ok(process_id)
    }

    /// Stop the running script. Does nothing when idle.
    pub fn stop_script(&mut self) {
        let Some(process_id) = self.manager.stop() else {
            return;
        };
        self.teardown(process_id);

        if let Some(path) = self.manager.script_path().map(Path::to_path_buf) {
            self.signals.script_end.emit(&path);
        }
    }

    fn teardown(&mut self, process_id: ProcessId) {
        self.router
            .unbind_all(&self.gateway, process_id, &mut self.bindings);
        self.pending.clear();

        if self.acquired {
            self.acquired = false;
            self.gateway.release();
        }
    }

    fn process_sink(&self) -> ProcessEventSink {
        let inbox = self.inbox_tx.clone();
        Arc::new(move |event| {
            let _ = inbox.send(OwnerMessage::Process(event));
        })
    }

    // ── Emit ────────────────────────────────────────────────────────────────

    /// Send `event_name` to this component's script.
    ///
    /// While idle there is no process to address, so the emit is dropped and
    /// reported as [`ComponentError::NotRunning`], the same soft failure as an
    /// emit while disconnected.
    pub fn emit(&self, event_name: &str, payload: Value, namespace: &str) -> ComponentResult<()> {
        let process_id = self.emit_target(event_name)?;
        let scoped = codec::scope(event_name, process_id)?;
        self.gateway.emit(&scoped, payload, namespace)?;
        Ok(())
    }

    /// Send `event_name` and deliver the script's reply to `handler_name` on
    /// `target`.
    ///
    /// An empty `handler_name` sends a plain emit and returns `None`.
    pub fn emit_with_callback(
        &mut self,
        event_name: &str,
        payload: Value,
        handler_name: &str,
        target: &str,
        namespace: &str,
    ) -> ComponentResult<Option<AckId>> {
        if handler_name.is_empty() {
            self.emit(event_name, payload, namespace)?;
            return Ok(None);
        }

        let process_id = self.emit_target(event_name)?;
        let scoped = codec::scope(event_name, process_id)?;
        let on_response = self.router.response_handler(scoped.clone());
        let exchange = self
            .gateway
            .emit_with_callback(&scoped, payload, namespace, on_response)?;

        self.bindings.record_callback(
            exchange,
            CallbackBinding {
                target: target.to_string(),
                handler_name: handler_name.to_string(),
                event_name: event_name.to_string(),
                deadline: Instant::now() + self.config.callback_timeout,
            },
        );
        Ok(Some(exchange))
    }

    fn emit_target(&self, event_name: &str) -> ComponentResult<ProcessId> {
        self.manager.process_id().ok_or_else(|| {
            warn!(component = %self.id, event = event_name, "Dropping emit while no script runs");
            ComponentError::NotRunning
        })
    }

    // ── Bind ────────────────────────────────────────────────────────────────

    /// Listen for `event_name` from this component's script.
    ///
    /// Subscribes at once when running and connected, otherwise the
    /// subscription is deferred until both hold.
    pub fn bind_event(&mut self, event_name: &str, namespace: &str) -> ComponentResult<()> {
        codec::validate_event_name(event_name)?;

        if self.manager.is_running() && self.gateway.is_connected() {
            return self.subscribe_now(event_name, namespace);
        }

        debug!(component = %self.id, event = event_name, "Deferring bind until ready");
        let event_name = event_name.to_string();
        let namespace = namespace.to_string();
        self.pending.defer(move |component: &mut ScriptComponent| {
            if let Err(e) = component.subscribe_now(&event_name, &namespace) {
                warn!(event = %event_name, error = %e, "Deferred bind failed");
            }
        });
        Ok(())
    }

    fn subscribe_now(&mut self, event_name: &str, namespace: &str) -> ComponentResult<()> {
        let process_id = self.manager.process_id().ok_or(ComponentError::NotRunning)?;
        let scoped = codec::scope(event_name, process_id)?;
        self.gateway
            .subscribe(&scoped, namespace, self.router.handler());
        self.bindings.record_bound(event_name);
        Ok(())
    }

    fn flush_pending_if_ready(&mut self) {
        if self.pending.is_empty() || !self.manager.is_running() || !self.gateway.is_connected() {
            return;
        }
        let mut pending = std::mem::take(&mut self.pending);
        let ran = pending.flush_once(self);
        debug!(component = %self.id, ran, "Flushed deferred binds");
    }

    // ── Inbox ───────────────────────────────────────────────────────────────

    /// Apply everything queued on the inbox. Returns the number of messages
    /// handled.
    pub fn pump(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(message) = self.inbox_rx.try_recv() {
            self.handle_message(message);
            handled += 1;
        }

        let expired = self.bindings.expire_callbacks(Instant::now());
        if expired > 0 {
            debug!(component = %self.id, expired, "Dropped expired callback bindings");
        }
        handled
    }

    /// Wait for the next inbox message and apply it
    pub async fn pump_next(&mut self) {
        if let Some(message) = self.inbox_rx.recv().await {
            self.handle_message(message);
        }
    }

    fn handle_message(&mut self, message: OwnerMessage) {
        match message {
            OwnerMessage::Connection(ConnectionState::Connected) => self.flush_pending_if_ready(),
            OwnerMessage::Connection(ConnectionState::Disconnected) => {
                debug!(component = %self.id, "Gateway disconnected");
            }
            OwnerMessage::Event(event) => self.handle_event(event),
            OwnerMessage::Process(event) => self.handle_process_event(event),
        }
    }

    fn handle_event(&mut self, event: RoutedEvent) {
        if self.manager.process_id() != Some(event.process_id) {
            debug!(process_id = %event.process_id, "Event for stale process, dropping");
            return;
        }

        let Some(exchange) = event.exchange else {
            self.signals.event.emit(&ScriptEvent {
                event_name: event.event_name,
                payload: event.payload,
            });
            return;
        };

        let Some(binding) = self.bindings.take_callback(exchange) else {
            debug!(exchange, "Reply without a live callback binding, dropping");
            return;
        };

        let message = match &event.payload {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        if let Err(e) = self
            .invoker
            .invoke(&binding.target, &binding.handler_name, &message, &event.payload)
        {
            warn!(event = %binding.event_name, error = %e, "Callback handler failed");
        }
    }

    fn handle_process_event(&mut self, event: ProcessEvent) {
        match event {
            ProcessEvent::Log { process_id, line } => {
                if self.manager.process_id() != Some(process_id) {
                    return;
                }
                info!(target: "script", process_id = %process_id, "{}", line);
                self.signals.console_log.emit(&line);
            }
            ProcessEvent::Exited {
                process_id,
                code,
                error,
            } => {
                if !self.manager.mark_exited(process_id) {
                    debug!(process_id = %process_id, "Exit of stale process ignored");
                    return;
                }
                info!(process_id = %process_id, code = ?code, "Script exited");
                self.teardown(process_id);

                let path = self
                    .manager
                    .script_path()
                    .map(Path::to_path_buf)
                    .unwrap_or_default();
                if let Some(message) = error {
                    self.signals.script_error.emit(&ScriptFailure {
                        script_path: path.clone(),
                        message,
                    });
                }
                self.signals.script_end.emit(&path);
            }
        }
    }

    // ── Accessors ───────────────────────────────────────────────────────────

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &ComponentConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.manager.is_running()
    }

    pub fn process_id(&self) -> Option<ProcessId> {
        self.manager.process_id()
    }

    /// Process id as an integer, `-1` when no script is running
    pub fn script_id(&self) -> i64 {
        self.manager.process_id().map(i64::from).unwrap_or(-1)
    }

    pub fn script_path(&self) -> Option<&Path> {
        self.manager.script_path()
    }

    pub fn bound_event_names(&self) -> &[String] {
        self.bindings.bound_event_names()
    }

    pub fn pending_bindings(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_callbacks(&self) -> usize {
        self.bindings.pending_callbacks()
    }

    pub fn signals(&mut self) -> &mut ComponentSignals {
        &mut self.signals
    }

    pub fn on_script_begin(
        &mut self,
        handler: impl FnMut(&ProcessId) + Send + 'static,
    ) -> SubscriptionHandle {
        self.signals.script_begin.subscribe(handler)
    }

    pub fn on_script_end(
        &mut self,
        handler: impl FnMut(&PathBuf) + Send + 'static,
    ) -> SubscriptionHandle {
        self.signals.script_end.subscribe(handler)
    }

    pub fn on_script_error(
        &mut self,
        handler: impl FnMut(&ScriptFailure) + Send + 'static,
    ) -> SubscriptionHandle {
        self.signals.script_error.subscribe(handler)
    }

    pub fn on_console_log(
        &mut self,
        handler: impl FnMut(&String) + Send + 'static,
    ) -> SubscriptionHandle {
        self.signals.console_log.subscribe(handler)
    }

    pub fn on_event(
        &mut self,
        handler: impl FnMut(&ScriptEvent) + Send + 'static,
    ) -> SubscriptionHandle {
        self.signals.event.subscribe(handler)
    }
}

impl Drop for ScriptComponent {
    fn drop(&mut self) {
        self.stop_script();
        self.gateway.remove_state_handler(self.state_handle);
    }
}

impl std::fmt::Debug for ScriptComponent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptComponent")
            .field("id", &self.id)
            .field("state", &self.manager.state())
            .field("bound", &self.bindings.bound_event_names())
            .field("pending", &self.pending.len())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::GatewayConfig;
    use crate::handler::HandlerTable;
    use crate::process::RuntimeError;
    use crate::testing::{MockRuntime, ScriptedTransport, settle};
    use crate::transport::{Transport, TransportEvent};
    use parking_lot::Mutex;
    use serde_json::json;

    struct Harness {
        transport: Arc<ScriptedTransport>,
        gateway: Arc<ConnectionGateway>,
        router: Arc<EventRouter>,
        runtime: Arc<MockRuntime>,
        handlers: Arc<HandlerTable>,
    }

    impl Harness {
        fn new(first_pid: u32) -> Self {
            let transport = Arc::new(ScriptedTransport::new());
            let gateway = ConnectionGateway::spawn(transport.clone(), GatewayConfig::default());
            Self {
                transport,
                gateway,
                router: Arc::new(EventRouter::new()),
                runtime: Arc::new(MockRuntime::starting_at(first_pid)),
                handlers: Arc::new(HandlerTable::new()),
            }
        }

        fn component(&self) -> ScriptComponent {
            self.component_with(ComponentConfig::default())
        }

        fn component_with(&self, config: ComponentConfig) -> ScriptComponent {
            ScriptComponent::new(
                self.gateway.clone(),
                self.router.clone(),
                self.runtime.clone(),
                self.handlers.clone(),
                config,
            )
        }
    }

    fn record<T: Clone + Send + 'static>()
    -> (Arc<Mutex<Vec<T>>>, impl FnMut(&T) + Send + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |v: &T| sink.lock().push(v.clone()))
    }

    #[tokio::test]
    async fn test_events_route_to_their_own_owner() {
        let h = Harness::new(7);
        h.gateway.connect().unwrap();
        let mut a = h.component();
        let mut b = h.component();
        let (a_events, a_handler) = record::<ScriptEvent>();
        let (b_events, b_handler) = record::<ScriptEvent>();
        a.on_event(a_handler);
        b.on_event(b_handler);

        assert_eq!(a.run_script("/a.js").unwrap(), ProcessId::new(7));
        assert_eq!(b.run_script("/b.js").unwrap(), ProcessId::new(8));
        a.bind_event("ping", "/").unwrap();
        assert!(h.gateway.is_subscribed("ping@7"));

        h.transport.push_message("ping@7", "/", json!({"x": 1}));
        settle().await;
        a.pump();
        b.pump();

        assert_eq!(
            *a_events.lock(),
            vec![ScriptEvent {
                event_name: "ping".into(),
                payload: json!({"x": 1})
            }]
        );
        assert!(b_events.lock().is_empty());
    }

    #[tokio::test]
    async fn test_second_run_keeps_first_process() {
        let h = Harness::new(3);
        let mut c = h.component();

        let id = c.run_script("/a.js").unwrap();
        let err = c.run_script("/b.js").unwrap_err();

        assert_eq!(err, ComponentError::Process(ProcessError::AlreadyRunning(id)));
        assert_eq!(c.process_id(), Some(id));
        assert_eq!(h.runtime.started().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_start_raises_script_error() {
        let h = Harness::new(1);
        h.runtime.fail_next(RuntimeError::NotFound(PathBuf::from("/missing.js")));
        let mut c = h.component();
        let (errors, on_error) = record::<ScriptFailure>();
        let (begins, on_begin) = record::<ProcessId>();
        c.on_script_error(on_error);
        c.on_script_begin(on_begin);

        assert!(c.run_script("/missing.js").is_err());

        assert!(!c.is_running());
        assert_eq!(c.script_id(), -1);
        assert!(begins.lock().is_empty());
        assert_eq!(errors.lock()[0].script_path, PathBuf::from("/missing.js"));
        assert_eq!(h.gateway.running_owners(), 0);
    }

    #[tokio::test]
    async fn test_deferred_bind_flushes_once_after_connect() {
        let h = Harness::new(5);
        let mut c = h.component();

        c.bind_event("ping", "/").unwrap();
        c.run_script("/a.js").unwrap();
        assert_eq!(c.pending_bindings(), 1);
        assert!(!h.gateway.is_subscribed("ping@5"));

        h.gateway.connect().unwrap();
        settle().await;
        c.pump();

        assert_eq!(c.pending_bindings(), 0);
        assert!(h.gateway.is_subscribed("ping@5"));
        assert_eq!(c.bound_event_names(), ["ping".to_string()]);

        // A second connect cycle has nothing left to run
        h.gateway.unsubscribe("ping@5");
        h.transport.disconnect();
        h.gateway.connect().unwrap();
        settle().await;
        c.pump();
        assert!(!h.gateway.is_subscribed("ping@5"));
    }

    #[tokio::test]
    async fn test_bind_when_connected_before_start_flushes_on_start() {
        let h = Harness::new(2);
        h.gateway.connect().unwrap();
        let mut c = h.component();

        c.bind_event("ping", "/").unwrap();
        c.bind_event("pong", "/").unwrap();
        c.run_script("/a.js").unwrap();

        assert_eq!(c.pending_bindings(), 0);
        assert!(h.gateway.is_subscribed("ping@2"));
        assert!(h.gateway.is_subscribed("pong@2"));
    }

    #[tokio::test]
    async fn test_bind_rejects_invalid_name() {
        let h = Harness::new(1);
        let mut c = h.component();
        assert!(matches!(
            c.bind_event("a@b", "/"),
            Err(ComponentError::Codec(CodecError::InvalidName { .. }))
        ));
        assert_eq!(c.pending_bindings(), 0);
    }

    #[tokio::test]
    async fn test_emit_scopes_name() {
        let h = Harness::new(9);
        h.gateway.connect().unwrap();
        let mut c = h.component();

        assert_eq!(c.emit("hello", json!(1), "/"), Err(ComponentError::NotRunning));
        assert_eq!(
            c.emit_with_callback("hello", json!(1), "onHello", "hud", "/"),
            Err(ComponentError::NotRunning)
        );
        assert!(h.transport.sent().is_empty());
        assert!(!c.is_running());

        c.run_script("/a.js").unwrap();
        c.emit("hello", json!(1), "/").unwrap();

        let sent = h.transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "hello@9");
        assert_eq!(sent[0].1, json!(1));
    }

    #[tokio::test]
    async fn test_reply_invokes_named_handler() {
        let h = Harness::new(4);
        h.gateway.connect().unwrap();
        let replies = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&replies);
        h.handlers.register("hud", "onScore", move |msg, payload| {
            sink.lock().push((msg.to_string(), payload.clone()));
            Ok(())
        });
        let mut c = h.component();
        c.run_script("/a.js").unwrap();

        let exchange = c
            .emit_with_callback("score", json!(null), "onScore", "hud", "/")
            .unwrap()
            .unwrap();
        assert_eq!(c.pending_callbacks(), 1);

        h.transport.push(TransportEvent::Ack {
            id: exchange,
            payload: json!({"points": 3}),
        });
        settle().await;
        c.pump();

        assert_eq!(
            *replies.lock(),
            vec![(r#"{"points":3}"#.to_string(), json!({"points": 3}))]
        );
        assert_eq!(c.pending_callbacks(), 0);
    }

    #[tokio::test]
    async fn test_callback_never_fires_after_stop() {
        let h = Harness::new(4);
        h.gateway.connect().unwrap();
        let fired = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&fired);
        h.handlers.register("hud", "onScore", move |_, _| {
            *flag.lock() = true;
            Ok(())
        });
        let mut c = h.component();
        c.run_script("/a.js").unwrap();

        let exchange = c
            .emit_with_callback("score", Value::Null, "onScore", "hud", "/")
            .unwrap()
            .unwrap();
        c.stop_script();
        assert_eq!(c.pending_callbacks(), 0);

        h.transport.push(TransportEvent::Ack {
            id: exchange,
            payload: json!(1),
        });
        settle().await;
        c.pump();

        assert!(!*fired.lock());
    }

    #[tokio::test]
    async fn test_empty_handler_name_is_plain_emit() {
        let h = Harness::new(1);
        h.gateway.connect().unwrap();
        let mut c = h.component();
        c.run_script("/a.js").unwrap();

        let exchange = c.emit_with_callback("score", json!(2), "", "hud", "/").unwrap();

        assert_eq!(exchange, None);
        assert_eq!(h.transport.sent()[0].3, None);
        assert_eq!(h.gateway.pending_acks(), 0);
    }

    #[tokio::test]
    async fn test_stop_unbinds_and_drops_old_events() {
        let h = Harness::new(7);
        h.gateway.connect().unwrap();
        let mut c = h.component();
        let (events, on_event) = record::<ScriptEvent>();
        let (ends, on_end) = record::<PathBuf>();
        c.on_event(on_event);
        c.on_script_end(on_end);

        c.run_script("/a.js").unwrap();
        c.bind_event("ping", "/").unwrap();
        c.stop_script();
        c.stop_script();

        assert!(!h.gateway.is_subscribed("ping@7"));
        assert!(c.bound_event_names().is_empty());
        assert_eq!(h.runtime.stopped(), vec![ProcessId::new(7)]);
        assert_eq!(*ends.lock(), vec![PathBuf::from("/a.js")]);

        // Reuse the subscription slot to prove the router drops it
        h.gateway.subscribe("ping@7", "/", h.router.handler());
        h.transport.push_message("ping@7", "/", json!(1));
        settle().await;
        c.pump();
        assert!(events.lock().is_empty());
    }

    #[tokio::test]
    async fn test_stop_discards_deferred_binds() {
        let h = Harness::new(1);
        let mut c = h.component();

        c.run_script("/a.js").unwrap();
        c.bind_event("ping", "/").unwrap();
        assert_eq!(c.pending_bindings(), 1);
        c.stop_script();
        assert_eq!(c.pending_bindings(), 0);

        c.run_script("/b.js").unwrap();
        h.gateway.connect().unwrap();
        settle().await;
        c.pump();
        assert_eq!(h.gateway.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_console_output_is_forwarded() {
        let h = Harness::new(6);
        let mut c = h.component();
        let (logs, on_log) = record::<String>();
        c.on_console_log(on_log);

        let id = c.run_script("/a.js").unwrap();
        h.runtime.report(id, ProcessEvent::Log {
            process_id: id,
            line: "hello".into(),
        });
        c.pump();

        assert_eq!(*logs.lock(), vec!["hello".to_string()]);
    }

    #[tokio::test]
    async fn test_abnormal_exit_reports_error_then_end() {
        let h = Harness::new(6);
        h.gateway.connect().unwrap();
        let mut c = h.component();
        let order = Arc::new(Mutex::new(Vec::new()));
        let on_error = Arc::clone(&order);
        c.on_script_error(move |f| on_error.lock().push(format!("error: {}", f.message)));
        let on_end = Arc::clone(&order);
        c.on_script_end(move |p| on_end.lock().push(format!("end: {}", p.display())));

        let id = c.run_script("/a.js").unwrap();
        c.bind_event("ping", "/").unwrap();
        h.runtime.report(id, ProcessEvent::Exited {
            process_id: id,
            code: Some(1),
            error: Some("TypeError: boom".into()),
        });
        c.pump();

        assert_eq!(
            *order.lock(),
            vec!["error: TypeError: boom".to_string(), "end: /a.js".to_string()]
        );
        assert!(!c.is_running());
        assert!(!h.gateway.is_subscribed("ping@6"));
        assert_eq!(h.gateway.running_owners(), 0);
        // Exit is not a stop request
        assert!(h.runtime.stopped().is_empty());
    }

    #[tokio::test]
    async fn test_stale_process_events_are_ignored() {
        let h = Harness::new(1);
        let mut c = h.component();
        let (logs, on_log) = record::<String>();
        c.on_console_log(on_log);

        let first = c.run_script("/a.js").unwrap();
        c.stop_script();
        let second = c.run_script("/a.js").unwrap();

        h.runtime.report(first, ProcessEvent::Log {
            process_id: first,
            line: "old".into(),
        });
        h.runtime.report(first, ProcessEvent::Exited {
            process_id: first,
            code: Some(0),
            error: None,
        });
        c.pump();

        assert!(logs.lock().is_empty());
        assert_eq!(c.process_id(), Some(second));
    }

    #[tokio::test]
    async fn test_drop_stops_running_script() {
        let h = Harness::new(2);
        h.gateway.connect().unwrap();
        {
            let mut c = h.component();
            c.run_script("/a.js").unwrap();
            c.bind_event("ping", "/").unwrap();
            assert_eq!(h.gateway.running_owners(), 1);
        }

        assert_eq!(h.runtime.stopped(), vec![ProcessId::new(2)]);
        assert_eq!(h.gateway.subscription_count(), 0);
        assert_eq!(h.gateway.running_owners(), 0);
        assert_eq!(h.router.route_count(), 0);
    }

    #[tokio::test]
    async fn test_activate_runs_default_script() {
        let h = Harness::new(1);
        let mut idle = h.component_with(ComponentConfig::default().with_default_script("main.js"));
        assert_eq!(idle.activate().unwrap(), None);

        let mut c = h.component_with(
            ComponentConfig::default()
                .with_scripts_root("/srv")
                .with_default_script("main.js")
                .run_default_on_start(true),
        );
        assert_eq!(c.activate().unwrap(), Some(ProcessId::new(1)));
        assert_eq!(h.runtime.started()[0].1, PathBuf::from("/srv/main.js"));
        assert_eq!(c.script_id(), 1);
    }
}
