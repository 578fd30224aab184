//! ScriptLink - supervised script processes behind one shared transport
//!
//! This crate provides the assembled application:
//! - Configuration loading (`scriptlink.toml`)
//! - The [`ScriptLink`] stack that script components share

// Re-export core crates
pub use scriptlink_host;
pub use scriptlink_runtime;

pub mod config;
pub mod link;

pub use config::{CONFIG_FILE, ConfigError, ConfigResult, ScriptLinkConfig};
pub use link::ScriptLink;
