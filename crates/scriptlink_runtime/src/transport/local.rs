//! In-process Transport
//!
//! A transport whose two ends live in the same process. The client end
//! ([`LocalTransport`]) is handed to the gateway; the host end
//! ([`HostEndpoint`]) is driven by the script runtime, which publishes
//! routed events and receives everything the owners emit.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use super::{AckId, DEFAULT_NAMESPACE, Transport, TransportError, TransportEvent};

/// Create a connected pair of transport ends. Both start disconnected.
pub fn pair() -> (LocalTransport, HostEndpoint) {
    let (client_tx, client_rx) = mpsc::unbounded_channel();
    let (host_tx, host_rx) = mpsc::unbounded_channel();

    let shared = Arc::new(Shared {
        connected: AtomicBool::new(false),
        client_tx,
        host_tx,
    });

    (
        LocalTransport {
            shared: Arc::clone(&shared),
            events_rx: Mutex::new(Some(client_rx)),
        },
        HostEndpoint {
            publisher: HostPublisher { shared },
            inbox: HostInbox { rx: host_rx },
        },
    )
}

struct Shared {
    connected: AtomicBool,
    client_tx: mpsc::UnboundedSender<TransportEvent>,
    host_tx: mpsc::UnboundedSender<HostMessage>,
}

impl Shared {
    fn set_connected(&self, connected: bool) {
        if self.connected.swap(connected, Ordering::SeqCst) == connected {
            return;
        }
        let (client_event, host_event) = if connected {
            (TransportEvent::Connected, HostMessage::ClientConnected)
        } else {
            (TransportEvent::Disconnected, HostMessage::ClientDisconnected)
        };
        let _ = self.client_tx.send(client_event);
        let _ = self.host_tx.send(host_event);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Client End
// ─────────────────────────────────────────────────────────────────────────────

/// Client end of the in-process transport
pub struct LocalTransport {
    shared: Arc<Shared>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

impl Transport for LocalTransport {
    fn connect(&self) -> Result<(), TransportError> {
        if self.shared.host_tx.is_closed() {
            return Err(TransportError::Closed);
        }
        self.shared.set_connected(true);
        Ok(())
    }

    fn disconnect(&self) {
        self.shared.set_connected(false);
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn emit(
        &self,
        name: &str,
        payload: Value,
        namespace: &str,
        ack: Option<AckId>,
    ) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.shared
            .host_tx
            .send(HostMessage::Event {
                name: name.to_string(),
                namespace: namespace.to_string(),
                payload,
                ack,
            })
            .map_err(|_| TransportError::Closed)
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events_rx.lock().take()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Host End
// ─────────────────────────────────────────────────────────────────────────────

/// Messages seen by the host end
#[derive(Debug, Clone, PartialEq)]
pub enum HostMessage {
    /// The client connected
    ClientConnected,

    /// The client disconnected
    ClientDisconnected,

    /// The client emitted an event, possibly expecting a reply
    Event {
        name: String,
        namespace: String,
        payload: Value,
        ack: Option<AckId>,
    },
}

/// Host end of the in-process transport
pub struct HostEndpoint {
    publisher: HostPublisher,
    inbox: HostInbox,
}

impl HostEndpoint {
    /// Split into the cloneable sending half and the receiving half
    pub fn split(self) -> (HostPublisher, HostInbox) {
        (self.publisher, self.inbox)
    }

    pub fn publisher(&self) -> &HostPublisher {
        &self.publisher
    }

    /// Receive the next message from the client
    pub async fn recv(&mut self) -> Option<HostMessage> {
        self.inbox.recv().await
    }
}

/// Sending half of the host end
#[derive(Clone)]
pub struct HostPublisher {
    shared: Arc<Shared>,
}

impl HostPublisher {
    /// Deliver an event to the client under `name`
    pub fn publish(&self, name: impl Into<String>, payload: Value) -> Result<(), TransportError> {
        self.publish_to(name, DEFAULT_NAMESPACE, payload)
    }

    /// Deliver an event to the client under `name` within `namespace`
    pub fn publish_to(
        &self,
        name: impl Into<String>,
        namespace: impl Into<String>,
        payload: Value,
    ) -> Result<(), TransportError> {
        self.send(TransportEvent::Message {
            name: name.into(),
            namespace: namespace.into(),
            payload,
        })
    }

    /// Answer a request the client sent with an ack id
    pub fn reply(&self, id: AckId, payload: Value) -> Result<(), TransportError> {
        self.send(TransportEvent::Ack { id, payload })
    }

    /// Drop the connection from the host side
    pub fn drop_connection(&self) {
        self.shared.set_connected(false);
    }

    /// Restore the connection from the host side
    pub fn restore_connection(&self) {
        self.shared.set_connected(true);
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn send(&self, event: TransportEvent) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.shared
            .client_tx
            .send(event)
            .map_err(|_| TransportError::Closed)
    }
}

/// Receiving half of the host end
pub struct HostInbox {
    rx: mpsc::UnboundedReceiver<HostMessage>,
}

impl HostInbox {
    pub async fn recv(&mut self) -> Option<HostMessage> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<HostMessage> {
        self.rx.try_recv().ok()
    }
}
