//! ScriptLink Host - runs scripts as interpreter child processes
//!
//! [`ProcessHost`] implements the runtime's `ScriptRuntime` seam and sits on
//! the host end of the in-process transport.

pub mod ipc;
mod process;

pub use process::*;
