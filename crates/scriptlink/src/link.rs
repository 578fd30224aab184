//! Assembled ScriptLink stack
//!
//! Wires one in-process transport, one [`ProcessHost`], one shared
//! [`ConnectionGateway`] and one [`EventRouter`], and hands out
//! [`ScriptComponent`]s that share them.

use std::sync::Arc;

use tracing::info;

use scriptlink_host::ProcessHost;
use scriptlink_runtime::transport::local;
use scriptlink_runtime::{
    ConnectionGateway, EventRouter, GatewayResult, HandlerTable, ScriptComponent,
};

use crate::config::ScriptLinkConfig;

/// Shared infrastructure for any number of script components
pub struct ScriptLink {
    config: ScriptLinkConfig,
    gateway: Arc<ConnectionGateway>,
    router: Arc<EventRouter>,
    host: Arc<ProcessHost>,
    handlers: Arc<HandlerTable>,
}

impl ScriptLink {
    /// Build the stack. Must be called from within a tokio runtime.
    pub fn start(config: ScriptLinkConfig) -> Self {
        let (transport, endpoint) = local::pair();
        let host = ProcessHost::spawn(config.host_config(), endpoint);
        let gateway = ConnectionGateway::spawn(Arc::new(transport), config.gateway_config());

        info!(interpreter = %config.interpreter.display(), "ScriptLink started");

        Self {
            config,
            gateway,
            router: Arc::new(EventRouter::new()),
            host,
            handlers: Arc::new(HandlerTable::new()),
        }
    }

    pub fn connect(&self) -> GatewayResult<()> {
        self.gateway.connect()
    }

    /// A new component sharing this stack
    pub fn component(&self) -> ScriptComponent {
        ScriptComponent::new(
            Arc::clone(&self.gateway),
            Arc::clone(&self.router),
            self.host.clone(),
            self.handlers.clone(),
            self.config.component_config(),
        )
    }

    pub fn config(&self) -> &ScriptLinkConfig {
        &self.config
    }

    pub fn gateway(&self) -> &Arc<ConnectionGateway> {
        &self.gateway
    }

    pub fn host(&self) -> &Arc<ProcessHost> {
        &self.host
    }

    /// Named handlers that callback replies are delivered to
    pub fn handlers(&self) -> &Arc<HandlerTable> {
        &self.handlers
    }

    /// Stop every child and the gateway's reader
    pub fn shutdown(&self) {
        self.host.shutdown();
        self.gateway.shutdown();
    }
}
