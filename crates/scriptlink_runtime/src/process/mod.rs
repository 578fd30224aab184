//! Script Process Lifecycle
//!
//! This module defines the seam to the script runtime (the thing that
//! actually executes script files) and the per-owner state machine that
//! drives it.
//!
//! # Lifecycle
//!
//! - `Idle --start(ok)--> Running`
//! - `Idle --start(err)--> Idle`
//! - `Running --stop--> Idle`
//!
//! A process that exits by itself is reported through its
//! [`ProcessEventSink`] and also returns the owner to `Idle`.

mod manager;

pub use manager::*;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Process Identity
// ─────────────────────────────────────────────────────────────────────────────

/// Identity assigned to a running script process by the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(u32);

impl ProcessId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl From<ProcessId> for i64 {
    fn from(id: ProcessId) -> Self {
        i64::from(id.0)
    }
}

impl TryFrom<i64> for ProcessId {
    type Error = std::num::TryFromIntError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        u32::try_from(value).map(ProcessId)
    }
}

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Process Events
// ─────────────────────────────────────────────────────────────────────────────

/// Something a running process reported
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// A line of console output
    Log { process_id: ProcessId, line: String },

    /// The process ended. `error` carries captured diagnostics when the exit
    /// was abnormal.
    Exited {
        process_id: ProcessId,
        code: Option<i32>,
        error: Option<String>,
    },
}

impl ProcessEvent {
    pub fn process_id(&self) -> ProcessId {
        match self {
            ProcessEvent::Log { process_id, .. } | ProcessEvent::Exited { process_id, .. } => {
                *process_id
            }
        }
    }
}

/// Callback through which a runtime reports a process's events.
///
/// May be called from any thread.
pub type ProcessEventSink = Arc<dyn Fn(ProcessEvent) + Send + Sync>;

// ─────────────────────────────────────────────────────────────────────────────
// Script Runtime
// ─────────────────────────────────────────────────────────────────────────────

/// Errors reported by a script runtime
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    #[error("Script not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Failed to spawn script process: {0}")]
    SpawnFailed(String),

    #[error("Script runtime is shut down")]
    Shutdown,
}

/// The collaborator that executes script files
///
/// Both calls return without waiting on the process: `start_process` returns
/// as soon as an identity is assigned and `stop_process` only requests
/// termination.
pub trait ScriptRuntime: Send + Sync + 'static {
    /// Start a process for the script at `script_path` (already absolute)
    fn start_process(
        &self,
        script_path: &Path,
        events: ProcessEventSink,
    ) -> Result<ProcessId, RuntimeError>;

    /// Request termination of a process. Unknown ids are ignored.
    fn stop_process(&self, process_id: ProcessId);
}

// ─────────────────────────────────────────────────────────────────────────────
// Process Errors & State
// ─────────────────────────────────────────────────────────────────────────────

/// Errors from the per-owner lifecycle
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessError {
    #[error("Script already running as process {0}")]
    AlreadyRunning(ProcessId),

    #[error("Failed to start {}: {source}", .path.display())]
    Startup {
        path: PathBuf,
        #[source]
        source: RuntimeError,
    },
}

/// Result type for lifecycle operations
pub type ProcessResult<T> = Result<T, ProcessError>;

/// Current lifecycle state of an owner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// No process assigned
    Idle,
    /// A process is live under this id
    Running(ProcessId),
}

impl ProcessState {
    pub fn process_id(&self) -> Option<ProcessId> {
        match self {
            ProcessState::Idle => None,
            ProcessState::Running(id) => Some(*id),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, ProcessState::Running(_))
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessState::Idle => write!(f, "idle"),
            ProcessState::Running(id) => write!(f, "running ({id})"),
        }
    }
}
