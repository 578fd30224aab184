//! Transport Abstraction
//!
//! The publish/subscribe connection shared by every script owner. The
//! [`ConnectionGateway`](crate::gateway::ConnectionGateway) is the only
//! consumer of a [`Transport`]; owners never talk to one directly.

pub mod local;

use serde_json::Value;
use tokio::sync::mpsc;

pub use local::{HostEndpoint, HostInbox, HostMessage, HostPublisher, LocalTransport};

/// Correlation id for a request that expects a reply
pub type AckId = u64;

/// Namespace used when a caller does not name one
pub const DEFAULT_NAMESPACE: &str = "/";

/// Errors reported by a transport
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Transport is not connected")]
    NotConnected,

    #[error("Transport closed")]
    Closed,
}

/// Events delivered by a transport to its consumer
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The connection came up
    Connected,

    /// The connection dropped
    Disconnected,

    /// An event arrived under a wire-level name
    Message {
        name: String,
        namespace: String,
        payload: Value,
    },

    /// A reply to an earlier request arrived
    Ack { id: AckId, payload: Value },
}

/// A connection providing publish/subscribe semantics
///
/// Sends are non-blocking. Inbound traffic and connection changes are
/// delivered through the stream returned by [`Transport::take_events`].
pub trait Transport: Send + Sync + 'static {
    /// Open the connection. Connecting twice is a no-op.
    fn connect(&self) -> Result<(), TransportError>;

    /// Close the connection. Disconnecting twice is a no-op.
    fn disconnect(&self);

    fn is_connected(&self) -> bool;

    /// Send an event, optionally asking for a reply correlated by `ack`
    fn emit(
        &self,
        name: &str,
        payload: Value,
        namespace: &str,
        ack: Option<AckId>,
    ) -> Result<(), TransportError>;

    /// Take the inbound event stream. Only the first call returns `Some`.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>>;
}
