//! Child-process script runtime
//!
//! Spawns one interpreter child per script and bridges it to the host end
//! of the transport:
//!
//! - events a child emits are published under `<event>@<pid>`;
//! - events owners emit to `<event>@<pid>` are written to that child's stdin;
//! - other stdout lines become [`ProcessEvent::Log`];
//! - stderr is collected and reported when the child exits with code 1.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use scriptlink_runtime::{
    AckId, HostEndpoint, HostInbox, HostMessage, HostPublisher, ProcessEvent, ProcessEventSink,
    ProcessId, RuntimeError, ScriptRuntime, TransportError, codec,
};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::ipc::{ChildLine, IpcMessage, IpcReader, IpcWriter};

/// How long to wait for a child's stdout to drain after it exits
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Configuration for spawned script processes
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Interpreter executable, looked up on `PATH` if relative
    pub interpreter: PathBuf,
    /// Arguments placed before the script path
    pub interpreter_args: Vec<String>,
    /// Time a child gets to exit after the kill message before it is killed
    pub stop_grace: Duration,
    pub env: Vec<(String, String)>,
    pub working_dir: Option<PathBuf>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            interpreter: PathBuf::from("node"),
            interpreter_args: Vec::new(),
            stop_grace: Duration::from_millis(100),
            env: Vec::new(),
            working_dir: None,
        }
    }
}

impl HostConfig {
    pub fn new(interpreter: impl Into<PathBuf>) -> Self {
        Self {
            interpreter: interpreter.into(),
            ..Self::default()
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.interpreter_args = args;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

enum ChildCommand {
    Send(IpcMessage),
    Stop,
}

type ChildTable = DashMap<ProcessId, mpsc::UnboundedSender<ChildCommand>>;

/// Open request exchanges and the child each one was written to
type AckTable = DashMap<AckId, ProcessId>;

/// [`ScriptRuntime`] that runs each script in its own child process
pub struct ProcessHost {
    config: HostConfig,
    publisher: HostPublisher,
    children: Arc<ChildTable>,
    acks: Arc<AckTable>,
    runtime: Handle,
    relay: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl ProcessHost {
    /// Create a host driving `endpoint` and start relaying owner emits.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(config: HostConfig, endpoint: HostEndpoint) -> Arc<Self> {
        let (publisher, inbox) = endpoint.split();
        let children = Arc::new(ChildTable::new());
        let acks = Arc::new(AckTable::new());
        let relay = tokio::spawn(run_relay(Arc::clone(&children), Arc::clone(&acks), inbox));

        Arc::new(Self {
            config,
            publisher,
            children,
            acks,
            runtime: Handle::current(),
            relay: Mutex::new(Some(relay)),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Ids of the children still alive
    pub fn running(&self) -> Vec<ProcessId> {
        let mut ids: Vec<_> = self.children.iter().map(|c| *c.key()).collect();
        ids.sort();
        ids
    }

    /// Stop every child and refuse further starts
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        for child in self.children.iter() {
            let _ = child.value().send(ChildCommand::Stop);
        }
        if let Some(relay) = self.relay.lock().take() {
            relay.abort();
        }
        info!("Process host shut down");
    }

    fn spawn_child(&self, script_path: &Path) -> Result<Child, RuntimeError> {
        let mut cmd = Command::new(&self.config.interpreter);
        cmd.args(&self.config.interpreter_args)
            .arg(script_path)
            .envs(self.config.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }

        cmd.spawn().map_err(|e| {
            RuntimeError::SpawnFailed(format!(
                "{} {}: {}",
                self.config.interpreter.display(),
                script_path.display(),
                e
            ))
        })
    }
}

impl ScriptRuntime for ProcessHost {
    fn start_process(
        &self,
        script_path: &Path,
        events: ProcessEventSink,
    ) -> Result<ProcessId, RuntimeError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(RuntimeError::Shutdown);
        }
        if !script_path.is_file() {
            return Err(RuntimeError::NotFound(script_path.to_path_buf()));
        }

        let _guard = self.runtime.enter();
        let mut child = self.spawn_child(script_path)?;

        let Some(raw_id) = child.id() else {
            return Err(RuntimeError::SpawnFailed(
                "child exited before it was assigned an id".into(),
            ));
        };
        let process_id = ProcessId::new(raw_id);

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(RuntimeError::SpawnFailed("child stdio was not captured".into()));
        };

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        self.children.insert(process_id, commands_tx);

        info!(
            process_id = %process_id,
            "Spawned script process: {} {}",
            self.config.interpreter.display(),
            script_path.display()
        );

        let supervisor = ChildSupervisor {
            process_id,
            events,
            publisher: self.publisher.clone(),
            children: Arc::clone(&self.children),
            acks: Arc::clone(&self.acks),
            stop_grace: self.config.stop_grace,
        };
        self.runtime
            .spawn(supervisor.run(child, stdin, stdout, stderr, commands_rx));

        Ok(process_id)
    }

    fn stop_process(&self, process_id: ProcessId) {
        match self.children.get(&process_id) {
            Some(child) => {
                let _ = child.value().send(ChildCommand::Stop);
                debug!(process_id = %process_id, "Stop requested");
            }
            None => debug!(process_id = %process_id, "Stop for unknown process ignored"),
        }
    }
}

impl Drop for ProcessHost {
    fn drop(&mut self) {
        if let Some(relay) = self.relay.lock().take() {
            relay.abort();
        }
    }
}

impl std::fmt::Debug for ProcessHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHost")
            .field("config", &self.config)
            .field("children", &self.children.len())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Child Supervision
// ─────────────────────────────────────────────────────────────────────────────

struct ChildSupervisor {
    process_id: ProcessId,
    events: ProcessEventSink,
    publisher: HostPublisher,
    children: Arc<ChildTable>,
    acks: Arc<AckTable>,
    stop_grace: Duration,
}

impl ChildSupervisor {
    async fn run(
        self,
        mut child: Child,
        stdin: ChildStdin,
        stdout: ChildStdout,
        stderr: ChildStderr,
        mut commands: mpsc::UnboundedReceiver<ChildCommand>,
    ) {
        let process_id = self.process_id;
        let mut writer = IpcWriter::new(stdin);
        let stdout_task = tokio::spawn(forward_stdout(
            process_id,
            IpcReader::new(stdout),
            self.publisher.clone(),
            Arc::clone(&self.acks),
            Arc::clone(&self.events),
        ));
        let stderr_task = tokio::spawn(collect_stderr(process_id, stderr));

        let mut kill_at: Option<Instant> = None;
        let mut stopping = false;

        let status = loop {
            tokio::select! {
                status = child.wait() => break status,

                command = commands.recv(), if !stopping => match command {
                    Some(ChildCommand::Send(message)) => {
                        if let Err(e) = writer.send(&message).await {
                            debug!(process_id = %process_id, "Failed to write to child: {}", e);
                        }
                    }
                    Some(ChildCommand::Stop) | None => {
                        stopping = true;
                        if let Err(e) = writer.send(&IpcMessage::kill()).await {
                            trace!(process_id = %process_id, "Kill message not delivered: {}", e);
                        }
                        kill_at = Some(Instant::now() + self.stop_grace);
                    }
                },

                _ = tokio::time::sleep_until(kill_at.unwrap_or_else(Instant::now)),
                    if kill_at.is_some() =>
                {
                    kill_at = None;
                    if let Err(e) = child.start_kill() {
                        warn!(process_id = %process_id, "Failed to kill child: {}", e);
                    }
                }
            }
        };

        self.children.remove(&process_id);
        self.acks.retain(|_, owner| *owner != process_id);

        if tokio::time::timeout(DRAIN_TIMEOUT, stdout_task).await.is_err() {
            debug!(process_id = %process_id, "Child stdout still open after exit");
        }
        let stderr_text = match tokio::time::timeout(DRAIN_TIMEOUT, stderr_task).await {
            Ok(Ok(text)) => text,
            _ => String::new(),
        };

        let code = match status {
            Ok(status) => status.code(),
            Err(e) => {
                error!(process_id = %process_id, "Failed to wait for child: {}", e);
                None
            }
        };

        let error = (code == Some(1)).then(|| {
            if stderr_text.is_empty() {
                "script exited with code 1".to_string()
            } else {
                stderr_text
            }
        });

        info!(process_id = %process_id, code = ?code, stopped = stopping, "Script process exited");
        (self.events)(ProcessEvent::Exited {
            process_id,
            code,
            error,
        });
    }
}

async fn forward_stdout(
    process_id: ProcessId,
    mut reader: IpcReader<ChildStdout>,
    publisher: HostPublisher,
    acks: Arc<AckTable>,
    events: ProcessEventSink,
) {
    loop {
        let line = match reader.recv().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                debug!(process_id = %process_id, "Error reading child stdout: {}", e);
                break;
            }
        };

        match line {
            ChildLine::Emit { name, payload } => {
                let scoped = match codec::scope(&name, process_id) {
                    Ok(scoped) => scoped,
                    Err(e) => {
                        warn!(process_id = %process_id, "Child emitted unusable event: {}", e);
                        continue;
                    }
                };
                trace!(event = %scoped, "Child emit");
                publish_result(&scoped, publisher.publish(scoped.as_str(), payload));
            }
            ChildLine::Reply { ack, payload } => {
                // Only the child a request was written to may answer it
                if acks.remove_if(&ack, |_, owner| *owner == process_id).is_none() {
                    debug!(
                        process_id = %process_id,
                        ack,
                        "Reply for an exchange this child does not own, dropping"
                    );
                    continue;
                }
                publish_result("reply", publisher.reply(ack, payload));
            }
            ChildLine::Console(text) => {
                debug!(target: "script", "[{}] {}", process_id, text);
                events(ProcessEvent::Log {
                    process_id,
                    line: text,
                });
            }
        }
    }
}

fn publish_result(what: &str, result: Result<(), TransportError>) {
    if let Err(e) = result {
        debug!(event = what, "Dropped child message: {}", e);
    }
}

async fn collect_stderr(process_id: ProcessId, stderr: ChildStderr) -> String {
    let mut lines = BufReader::new(stderr).lines();
    let mut collected = Vec::new();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        debug!(target: "script", "[{}] stderr: {}", process_id, line);
        collected.push(line.to_string());
    }
    collected.join("\n")
}

// ─────────────────────────────────────────────────────────────────────────────
// Owner -> Child Relay
// ─────────────────────────────────────────────────────────────────────────────

async fn run_relay(children: Arc<ChildTable>, acks: Arc<AckTable>, mut inbox: HostInbox) {
    while let Some(message) = inbox.recv().await {
        let (name, payload, ack) = match message {
            HostMessage::Event {
                name, payload, ack, ..
            } => (name, payload, ack),
            other => {
                trace!("Client connection changed: {:?}", other);
                continue;
            }
        };

        let (event_name, raw_id) = match codec::unscope(&name) {
            Ok(parts) => parts,
            Err(e) => {
                warn!("Cannot route owner emit: {}", e);
                continue;
            }
        };
        let Ok(process_id) = ProcessId::try_from(raw_id) else {
            debug!(event = %name, "Process id out of range, dropping");
            continue;
        };
        let Some(child) = children.get(&process_id).map(|c| c.value().clone()) else {
            debug!(event = %name, "No child for emit, dropping");
            continue;
        };

        let args: Vec<Value> = vec![payload];
        let message = match ack {
            Some(ack) => {
                acks.insert(ack, process_id);
                IpcMessage::request(event_name, args, ack)
            }
            None => IpcMessage::emit(event_name, args),
        };
        if child.send(ChildCommand::Send(message)).is_err() {
            debug!(event = %name, "Child already exited");
            if let Some(ack) = ack {
                acks.remove(&ack);
            }
        }
    }
    debug!("Host inbox closed, relay stopped");
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
