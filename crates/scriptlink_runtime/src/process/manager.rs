//! Script Process Manager
//!
//! Tracks the one process an owner may have and guards the single-instance
//! rule.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{
    ProcessError, ProcessEventSink, ProcessId, ProcessResult, ProcessState, ScriptRuntime,
};

/// Per-owner process state machine
pub struct ScriptProcessManager {
    runtime: Arc<dyn ScriptRuntime>,
    /// Relative script paths are resolved against this directory
    scripts_root: Option<PathBuf>,
    state: ProcessState,
    /// Path as the caller gave it, kept for lifecycle signals
    script_path: Option<PathBuf>,
}

impl ScriptProcessManager {
    pub fn new(runtime: Arc<dyn ScriptRuntime>, scripts_root: Option<PathBuf>) -> Self {
        Self {
            runtime,
            scripts_root,
            state: ProcessState::Idle,
            script_path: None,
        }
    }

    /// Resolve a script path to the absolute path handed to the runtime
    pub fn resolve_path(&self, script_path: &Path) -> PathBuf {
        let joined = match &self.scripts_root {
            Some(root) if script_path.is_relative() => root.join(script_path),
            _ => script_path.to_path_buf(),
        };
        std::path::absolute(&joined).unwrap_or(joined)
    }

    /// Start a process for `script_path`.
    ///
    /// Fails with [`ProcessError::AlreadyRunning`] without touching the
    /// current process if one is live.
    pub fn start(
        &mut self,
        script_path: &Path,
        events: ProcessEventSink,
    ) -> ProcessResult<ProcessId> {
        if let ProcessState::Running(current) = self.state {
            warn!(process_id = %current, "Script already running, ignoring start");
            return Err(ProcessError::AlreadyRunning(current));
        }

        let resolved = self.resolve_path(script_path);
        debug!(path = %resolved.display(), "Requesting script process");

        let process_id = self
            .runtime
            .start_process(&resolved, events)
            .map_err(|source| ProcessError::Startup {
                path: script_path.to_path_buf(),
                source,
            })?;

        self.state = ProcessState::Running(process_id);
        self.script_path = Some(script_path.to_path_buf());
        info!(process_id = %process_id, path = %resolved.display(), "Script started");

        Ok(process_id)
    }

    /// Request termination of the live process and return to `Idle`.
    ///
    /// Returns the id that was stopped, or `None` if nothing was running.
    pub fn stop(&mut self) -> Option<ProcessId> {
        let ProcessState::Running(process_id) = self.state else {
            return None;
        };

        self.runtime.stop_process(process_id);
        self.state = ProcessState::Idle;
        info!(process_id = %process_id, "Script stop requested");

        Some(process_id)
    }

    /// Record that `process_id` ended by itself.
    ///
    /// Returns false if it is not the live process.
    pub fn mark_exited(&mut self, process_id: ProcessId) -> bool {
        if self.state != ProcessState::Running(process_id) {
            return false;
        }
        self.state = ProcessState::Idle;
        true
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn process_id(&self) -> Option<ProcessId> {
        self.state.process_id()
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    /// Path of the most recently started script
    pub fn script_path(&self) -> Option<&Path> {
        self.script_path.as_deref()
    }
}

impl std::fmt::Debug for ScriptProcessManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptProcessManager")
            .field("state", &self.state)
            .field("script_path", &self.script_path)
            .finish()
    }
}
