//! Event Router
//!
//! Resolves inbound scoped events to the owner whose process they belong
//! to. The router never runs owner code itself: it only pushes
//! [`OwnerMessage`]s onto the owner's inbox, which the owner drains on its
//! own context.
//!
//! Each owner keeps its per-process bookkeeping in an [`OwnerBindings`]
//! (bound names plus outstanding callback bindings) that the router tears
//! down in [`EventRouter::unbind_all`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::codec;
use crate::gateway::{ConnectionGateway, ConnectionState, EventHandler, ResponseHandler};
use crate::process::{ProcessEvent, ProcessId};
use crate::transport::AckId;

// ─────────────────────────────────────────────────────────────────────────────
// Owner Messages
// ─────────────────────────────────────────────────────────────────────────────

/// An inbound event already resolved to its owner
#[derive(Debug, Clone, PartialEq)]
pub struct RoutedEvent {
    pub process_id: ProcessId,
    /// Local (unscoped) event name
    pub event_name: String,
    pub payload: Value,
    /// Set when this is the reply to an `emit_with_callback` exchange
    pub exchange: Option<AckId>,
}

/// Everything that can land in an owner's inbox
#[derive(Debug, Clone, PartialEq)]
pub enum OwnerMessage {
    Connection(ConnectionState),
    Event(RoutedEvent),
    Process(ProcessEvent),
}

/// Sending half of an owner's inbox
pub type OwnerInbox = mpsc::UnboundedSender<OwnerMessage>;

/// What [`EventRouter::dispatch`] did with an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered,
    UnknownOwner,
    Malformed,
}

// ─────────────────────────────────────────────────────────────────────────────
// Router
// ─────────────────────────────────────────────────────────────────────────────

/// `ProcessId -> owner inbox` route table
#[derive(Default)]
pub struct EventRouter {
    routes: DashMap<ProcessId, OwnerInbox>,
    /// Malformed names already warned about
    reported: Mutex<HashSet<String>>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route events for `process_id` to `inbox`, replacing any earlier route
    pub fn register(&self, process_id: ProcessId, inbox: OwnerInbox) {
        if self.routes.insert(process_id, inbox).is_some() {
            warn!(process_id = %process_id, "Replaced existing route");
        }
        debug!(process_id = %process_id, "Route registered");
    }

    pub fn unregister(&self, process_id: ProcessId) -> bool {
        self.routes.remove(&process_id).is_some()
    }

    pub fn has_route(&self, process_id: ProcessId) -> bool {
        self.routes.contains_key(&process_id)
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    /// Resolve `scoped_name` and enqueue the event on its owner's inbox
    pub fn dispatch(
        &self,
        scoped_name: &str,
        payload: Value,
        exchange: Option<AckId>,
    ) -> DispatchOutcome {
        let (event_name, raw_id) = match codec::unscope(scoped_name) {
            Ok(parts) => parts,
            Err(e) => {
                if self.reported.lock().insert(scoped_name.to_string()) {
                    warn!(event = scoped_name, error = %e, "Dropping malformed event name");
                } else {
                    trace!(event = scoped_name, "Dropping malformed event name");
                }
                return DispatchOutcome::Malformed;
            }
        };

        let Ok(process_id) = ProcessId::try_from(raw_id) else {
            debug!(event = scoped_name, "Process id out of range, dropping");
            return DispatchOutcome::UnknownOwner;
        };

        let Some(inbox) = self.routes.get(&process_id).map(|r| r.value().clone()) else {
            debug!(event = scoped_name, "No owner for process, dropping");
            return DispatchOutcome::UnknownOwner;
        };

        let message = OwnerMessage::Event(RoutedEvent {
            process_id,
            event_name,
            payload,
            exchange,
        });
        if inbox.send(message).is_err() {
            debug!(process_id = %process_id, "Owner inbox closed, removing route");
            self.routes.remove(&process_id);
            return DispatchOutcome::UnknownOwner;
        }

        DispatchOutcome::Delivered
    }

    /// Gateway subscription handler that dispatches through this router
    pub fn handler(self: &Arc<Self>) -> EventHandler {
        let router = Arc::clone(self);
        Arc::new(move |scoped_name, payload| {
            router.dispatch(scoped_name, payload, None);
        })
    }

    /// One-shot reply handler for an exchange sent under `scoped_name`
    pub fn response_handler(self: &Arc<Self>, scoped_name: String) -> ResponseHandler {
        let router = Arc::clone(self);
        Box::new(move |exchange, payload| {
            router.dispatch(&scoped_name, payload, Some(exchange));
        })
    }

    /// Tear down everything `process_id` had bound.
    ///
    /// Unsubscribes every bound name from the gateway, drops outstanding
    /// callback bindings without invoking them and removes the route.
    /// Returns the number of names unsubscribed.
    pub fn unbind_all(
        &self,
        gateway: &ConnectionGateway,
        process_id: ProcessId,
        bindings: &mut OwnerBindings,
    ) -> usize {
        let mut unsubscribed = 0;
        for name in bindings.bound_event_names.drain(..) {
            match codec::scope(&name, process_id) {
                Ok(scoped) => {
                    if gateway.unsubscribe(&scoped) {
                        unsubscribed += 1;
                    }
                }
                Err(e) => warn!(event = %name, error = %e, "Cannot unbind event"),
            }
        }

        let dropped = bindings.callbacks.len();
        bindings.callbacks.clear();
        self.unregister(process_id);

        debug!(
            process_id = %process_id,
            unsubscribed,
            dropped_callbacks = dropped,
            "Unbound owner"
        );
        unsubscribed
    }
}

impl std::fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRouter")
            .field("routes", &self.routes.len())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Owner Bindings
// ─────────────────────────────────────────────────────────────────────────────

/// Where the reply to one `emit_with_callback` exchange is delivered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackBinding {
    pub target: String,
    pub handler_name: String,
    pub event_name: String,
    pub deadline: Instant,
}

/// Per-process subscriptions and callback bindings of one owner
#[derive(Debug, Default)]
pub struct OwnerBindings {
    bound_event_names: Vec<String>,
    callbacks: HashMap<AckId, CallbackBinding>,
}

impl OwnerBindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember a bound name. Returns false if it was already bound.
    pub fn record_bound(&mut self, event_name: &str) -> bool {
        if self.bound_event_names.iter().any(|n| n == event_name) {
            return false;
        }
        self.bound_event_names.push(event_name.to_string());
        true
    }

    pub fn bound_event_names(&self) -> &[String] {
        &self.bound_event_names
    }

    pub fn record_callback(&mut self, exchange: AckId, binding: CallbackBinding) {
        self.callbacks.insert(exchange, binding);
    }

    /// Release the binding for `exchange` if it is still live
    pub fn take_callback(&mut self, exchange: AckId) -> Option<CallbackBinding> {
        let binding = self.callbacks.remove(&exchange)?;
        if binding.deadline <= Instant::now() {
            debug!(exchange, event = %binding.event_name, "Callback binding expired");
            return None;
        }
        Some(binding)
    }

    /// Drop bindings whose deadline has passed
    pub fn expire_callbacks(&mut self, now: Instant) -> usize {
        let before = self.callbacks.len();
        self.callbacks.retain(|_, b| b.deadline > now);
        before - self.callbacks.len()
    }

    pub fn pending_callbacks(&self) -> usize {
        self.callbacks.len()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::GatewayConfig;
    use crate::testing::ScriptedTransport;
    use serde_json::json;
    use std::time::Duration;

    fn inbox() -> (OwnerInbox, mpsc::UnboundedReceiver<OwnerMessage>) {
        mpsc::unbounded_channel()
    }

    fn binding(deadline: Instant) -> CallbackBinding {
        CallbackBinding {
            target: "hud".into(),
            handler_name: "onReply".into(),
            event_name: "req".into(),
            deadline,
        }
    }

    #[test]
    fn test_dispatch_reaches_only_matching_owner() {
        let router = EventRouter::new();
        let (a_tx, mut a_rx) = inbox();
        let (b_tx, mut b_rx) = inbox();
        router.register(ProcessId::new(7), a_tx);
        router.register(ProcessId::new(8), b_tx);

        let outcome = router.dispatch("ping@7", json!({"x": 1}), None);

        assert_eq!(outcome, DispatchOutcome::Delivered);
        assert_eq!(
            a_rx.try_recv().unwrap(),
            OwnerMessage::Event(RoutedEvent {
                process_id: ProcessId::new(7),
                event_name: "ping".into(),
                payload: json!({"x": 1}),
                exchange: None,
            })
        );
        assert!(b_rx.try_recv().is_err());
    }

    #[test]
    fn test_unknown_owner_is_dropped() {
        let router = EventRouter::new();
        let (tx, mut rx) = inbox();
        router.register(ProcessId::new(7), tx);

        assert_eq!(router.dispatch("ping@9", json!(1), None), DispatchOutcome::UnknownOwner);
        assert_eq!(
            router.dispatch("ping@99999999999", json!(1), None),
            DispatchOutcome::UnknownOwner
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_malformed_names_are_dropped() {
        let router = EventRouter::new();
        assert_eq!(router.dispatch("badname", json!(1), None), DispatchOutcome::Malformed);
        assert_eq!(router.dispatch("badname", json!(1), None), DispatchOutcome::Malformed);
        assert_eq!(router.dispatch("ping@x", json!(1), None), DispatchOutcome::Malformed);
        assert_eq!(router.reported.lock().len(), 2);
    }

    #[test]
    fn test_closed_inbox_removes_route() {
        let router = EventRouter::new();
        let (tx, rx) = inbox();
        router.register(ProcessId::new(3), tx);
        drop(rx);

        assert_eq!(router.dispatch("ping@3", json!(1), None), DispatchOutcome::UnknownOwner);
        assert!(!router.has_route(ProcessId::new(3)));
    }

    #[test]
    fn test_response_handler_tags_exchange() {
        let router = Arc::new(EventRouter::new());
        let (tx, mut rx) = inbox();
        router.register(ProcessId::new(4), tx);

        let on_response = router.response_handler("req@4".to_string());
        on_response(12, json!("pong"));

        let OwnerMessage::Event(event) = rx.try_recv().unwrap() else {
            panic!("expected routed event");
        };
        assert_eq!(event.exchange, Some(12));
        assert_eq!(event.event_name, "req");
    }

    #[tokio::test]
    async fn test_unbind_all_tears_down_owner() {
        let transport = Arc::new(ScriptedTransport::new());
        let gateway = ConnectionGateway::spawn(transport, GatewayConfig::default());
        let router = Arc::new(EventRouter::new());
        let (tx, _rx) = inbox();
        let pid = ProcessId::new(7);
        router.register(pid, tx);

        let mut bindings = OwnerBindings::new();
        for name in ["ping", "pong"] {
            gateway.subscribe(&codec::scope(name, pid).unwrap(), "/", router.handler());
            bindings.record_bound(name);
        }
        gateway.subscribe("ping@8", "/", router.handler());
        bindings.record_callback(1, binding(Instant::now() + Duration::from_secs(30)));

        assert_eq!(router.unbind_all(&gateway, pid, &mut bindings), 2);

        assert!(bindings.bound_event_names().is_empty());
        assert_eq!(bindings.pending_callbacks(), 0);
        assert!(!router.has_route(pid));
        assert!(gateway.is_subscribed("ping@8"));
        assert_eq!(gateway.subscription_count(), 1);
    }

    #[test]
    fn test_record_bound_never_duplicates() {
        let mut bindings = OwnerBindings::new();
        assert!(bindings.record_bound("ping"));
        assert!(!bindings.record_bound("ping"));
        assert_eq!(bindings.bound_event_names(), ["ping".to_string()]);
    }

    #[tokio::test]
    async fn test_callback_bindings_release_once_or_expire() {
        let mut bindings = OwnerBindings::new();
        let now = Instant::now();
        bindings.record_callback(1, binding(now + Duration::from_secs(30)));
        bindings.record_callback(2, binding(now));

        assert!(bindings.take_callback(1).is_some());
        assert!(bindings.take_callback(1).is_none());

        assert_eq!(bindings.expire_callbacks(now + Duration::from_millis(1)), 1);
        assert_eq!(bindings.pending_callbacks(), 0);
    }
}
