//! Shared test doubles for the collaborator traits.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::process::{ProcessEvent, ProcessEventSink, ProcessId, RuntimeError, ScriptRuntime};
use crate::transport::{AckId, Transport, TransportError, TransportEvent};

/// Give spawned tasks time to drain their queues
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(30)).await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Scripted Transport
// ─────────────────────────────────────────────────────────────────────────────

/// Transport that records sends and lets tests inject inbound events
pub struct ScriptedTransport {
    connected: AtomicBool,
    sent: Mutex<Vec<(String, Value, String, Option<AckId>)>>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            connected: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    pub fn push(&self, event: TransportEvent) {
        let _ = self.events_tx.send(event);
    }

    pub fn push_message(&self, name: &str, namespace: &str, payload: Value) {
        self.push(TransportEvent::Message {
            name: name.to_string(),
            namespace: namespace.to_string(),
            payload,
        });
    }

    /// Everything emitted so far: `(name, payload, namespace, ack)`
    pub fn sent(&self) -> Vec<(String, Value, String, Option<AckId>)> {
        self.sent.lock().clone()
    }
}

impl Transport for ScriptedTransport {
    fn connect(&self) -> Result<(), TransportError> {
        if !self.connected.swap(true, Ordering::SeqCst) {
            self.push(TransportEvent::Connected);
        }
        Ok(())
    }

    fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.push(TransportEvent::Disconnected);
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
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
        self.sent
            .lock()
            .push((name.to_string(), payload, namespace.to_string(), ack));
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events_rx.lock().take()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Mock Runtime
// ─────────────────────────────────────────────────────────────────────────────

/// Runtime that hands out sequential ids and records lifecycle calls
pub struct MockRuntime {
    next_id: AtomicU32,
    fail_with: Mutex<Option<RuntimeError>>,
    started: Mutex<Vec<(ProcessId, PathBuf)>>,
    stopped: Mutex<Vec<ProcessId>>,
    sinks: Mutex<Vec<(ProcessId, ProcessEventSink)>>,
}

impl MockRuntime {
    pub fn starting_at(first_id: u32) -> Self {
        Self {
            next_id: AtomicU32::new(first_id),
            fail_with: Mutex::new(None),
            started: Mutex::new(Vec::new()),
            stopped: Mutex::new(Vec::new()),
            sinks: Mutex::new(Vec::new()),
        }
    }

    /// Make the next start fail with `error`
    pub fn fail_next(&self, error: RuntimeError) {
        *self.fail_with.lock() = Some(error);
    }

    pub fn started(&self) -> Vec<(ProcessId, PathBuf)> {
        self.started.lock().clone()
    }

    pub fn stopped(&self) -> Vec<ProcessId> {
        self.stopped.lock().clone()
    }

    /// Push an event as if the process `id` had produced it
    pub fn report(&self, id: ProcessId, event: ProcessEvent) {
        let sink = self
            .sinks
            .lock()
            .iter()
            .find(|(pid, _)| *pid == id)
            .map(|(_, sink)| sink.clone());
        if let Some(sink) = sink {
            sink(event);
        }
    }
}

impl ScriptRuntime for MockRuntime {
    fn start_process(
        &self,
        script_path: &Path,
        events: ProcessEventSink,
    ) -> Result<ProcessId, RuntimeError> {
        if let Some(error) = self.fail_with.lock().take() {
            return Err(error);
        }
        let id = ProcessId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.started.lock().push((id, script_path.to_path_buf()));
        self.sinks.lock().push((id, events));
        Ok(id)
    }

    fn stop_process(&self, process_id: ProcessId) {
        self.stopped.lock().push(process_id);
    }
}
