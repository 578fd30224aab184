//! ScriptLink Runtime - per-owner script processes over one shared transport
//!
//! This crate contains the event-name codec, the connection gateway, the
//! event router and the [`ScriptComponent`] owner that ties them together.

pub mod codec;
pub mod component;
pub mod gateway;
pub mod handler;
pub mod pending;
pub mod process;
pub mod router;
pub mod signal;
pub mod transport;

#[cfg(test)]
mod testing;

pub use codec::{CodecError, CodecResult, scope, unscope};
pub use component::*;
pub use gateway::*;
pub use handler::*;
pub use pending::*;
pub use process::*;
pub use router::*;
pub use signal::*;
pub use transport::{
    AckId, DEFAULT_NAMESPACE, HostEndpoint, HostInbox, HostMessage, HostPublisher,
    LocalTransport, Transport, TransportError, TransportEvent,
};
