//! Engine crate – device location simulation shared by the CLI and daemon.
//!
//! Drives `pymobiledevice3` (iOS) and `adb` (Android) as child processes.
//! Everything that touches the OS sits behind the capability traits in
//! [`traits`], so workflows and strategy chains run against a scripted
//! fake in tests.

pub mod android;
pub mod chain;
pub mod classifier;
pub mod commands;
pub mod config;
pub mod context;
pub mod devices;
pub mod doctor;
pub mod ios;
pub mod location;
pub mod platform;
pub mod runner;
pub mod scenario;
pub mod traits;
pub mod tunnel;
pub mod types;
pub mod workflow;

#[cfg(test)]
pub mod testing;

pub use commands::{CommandRegistry, OpError};
pub use config::{load_config, EngineConfig};
pub use context::SimContext;
pub use types::{CommandResult, Coordinates, ErrorCode, ErrorInfo, OperationResult, Platform, Status};
