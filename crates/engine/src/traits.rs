use crate::types::{CommandResult, ToolCommand, TunnelDescriptor};
use std::path::Path;
use std::time::Duration;

/// Result type for capability operations.
pub type CapResult<T> = Result<T, CapError>;

#[derive(Debug, thiserror::Error)]
pub enum CapError {
    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timeout")]
    Timeout,

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("{0}")]
    Other(String),
}

// ---------------------------------------------------------------------------
// External process operations
// ---------------------------------------------------------------------------

/// Everything the engine needs from the operating system to drive the
/// wrapped device tools. Tool failures are reported inside the returned
/// [`CommandResult`], never as `Err`.
#[async_trait::async_trait]
pub trait ProcessOps: Send + Sync {
    /// Run to completion, killing the process group after `timeout`.
    async fn execute(&self, cmd: &ToolCommand, timeout: Duration) -> CommandResult;

    /// Run a command that never exits on its own: wait for its readiness
    /// marker (or the tunnel timeout), then terminate it.
    async fn run_tunnel(&self, cmd: &ToolCommand) -> CommandResult;

    /// Launch a long-running process in its own process group with combined
    /// output written to `log` (truncated first). The process outlives the caller.
    fn spawn_detached(&self, cmd: &ToolCommand, log: &Path) -> CapResult<u32>;

    /// Kill every process whose command line contains `pattern`. Succeeds
    /// when nothing matches.
    async fn kill_matching(&self, pattern: &str) -> CapResult<()>;
}

// ---------------------------------------------------------------------------
// Connection state store
// ---------------------------------------------------------------------------

/// Single-slot store for the active tunnel descriptor. Last writer wins.
pub trait TunnelStore: Send + Sync {
    /// Missing or malformed state reads as `None`.
    fn load(&self) -> Option<TunnelDescriptor>;
    /// Replace the stored descriptor entirely.
    fn save(&self, descriptor: &TunnelDescriptor) -> CapResult<()>;
    /// Remove stored state. Idempotent.
    fn clear(&self) -> CapResult<()>;
}
