//! Platform implementations of the engine's capability traits.
//!
//! - [`SystemProcess`]: real child processes via the runner and tunnel monitor
//! - [`FileTunnelStore`]: tunnel descriptor persisted as a one-line scratch file
//! - [`MemoryTunnelStore`]: in-process store for embedding and tests

use crate::classifier::ClassifierTable;
use crate::config::EngineConfig;
use crate::runner;
use crate::traits::*;
use crate::tunnel::{self, TunnelTimings};
use crate::types::{CommandResult, ToolCommand, TunnelDescriptor};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

// ===========================================================================
// Processes – wraps tokio::process
// ===========================================================================

pub struct SystemProcess {
    classifier: ClassifierTable,
    ready_markers: Vec<String>,
    timings: TunnelTimings,
    kill_timeout: Duration,
}

impl SystemProcess {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            classifier: config.classifier.clone(),
            ready_markers: config.tunnel.ready_markers.clone(),
            timings: TunnelTimings {
                ready: config.timeouts.tunnel_ready(),
                monitor: config.timeouts.monitor(),
                grace: config.timeouts.kill_grace(),
            },
            kill_timeout: config.timeouts.probe(),
        }
    }
}

#[async_trait::async_trait]
impl ProcessOps for SystemProcess {
    async fn execute(&self, cmd: &ToolCommand, timeout: Duration) -> CommandResult {
        let profile = self.classifier.profile(cmd.tool);
        runner::execute(cmd, timeout, self.timings.grace, &profile).await
    }

    async fn run_tunnel(&self, cmd: &ToolCommand) -> CommandResult {
        tunnel::run_tunnel_command(cmd, &self.ready_markers, self.timings).await
    }

    fn spawn_detached(&self, cmd: &ToolCommand, log: &Path) -> CapResult<u32> {
        runner::spawn_detached(cmd, log)
    }

    async fn kill_matching(&self, pattern: &str) -> CapResult<()> {
        runner::kill_matching(pattern, self.kill_timeout).await
    }
}

// ===========================================================================
// Tunnel descriptor – scratch file
// ===========================================================================

pub struct FileTunnelStore {
    path: PathBuf,
}

impl FileTunnelStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TunnelStore for FileTunnelStore {
    fn load(&self) -> Option<TunnelDescriptor> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => {
                let parsed = TunnelDescriptor::parse_line(&content);
                if parsed.is_none() {
                    debug!(path = %self.path.display(), "tunnel info incomplete - no active connection");
                }
                parsed
            }
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "no tunnel info");
                None
            }
        }
    }

    fn save(&self, descriptor: &TunnelDescriptor) -> CapResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        // Write-then-rename so readers never see a torn line.
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, format!("{}\n", descriptor.to_line()))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| {
            let _ = std::fs::remove_file(&tmp);
            CapError::Io(e)
        })?;
        debug!(path = %self.path.display(), line = %descriptor.to_line(), "tunnel info written");
        Ok(())
    }

    fn clear(&self) -> CapResult<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to remove tunnel info");
                Err(CapError::Io(e))
            }
        }
    }
}

// ===========================================================================
// Tunnel descriptor – in memory
// ===========================================================================

#[derive(Default)]
pub struct MemoryTunnelStore {
    slot: Mutex<Option<TunnelDescriptor>>,
}

impl TunnelStore for MemoryTunnelStore {
    fn load(&self) -> Option<TunnelDescriptor> {
        self.slot.lock().ok().and_then(|s| s.clone())
    }

    fn save(&self, descriptor: &TunnelDescriptor) -> CapResult<()> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| CapError::Other("tunnel store lock poisoned".into()))?;
        *slot = Some(descriptor.clone());
        Ok(())
    }

    fn clear(&self) -> CapResult<()> {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::tests::scratch;
    use crate::types::TunnelState;

    #[test]
    fn test_file_store_roundtrip() {
        let store = FileTunnelStore::new(scratch("tunnel_info.txt"));
        let d = TunnelDescriptor::established("10.0.0.1", "1234", "ABC");
        store.save(&d).unwrap();

        let back = store.load().unwrap();
        assert_eq!(back.address.as_deref(), Some("10.0.0.1"));
        assert_eq!(back.port.as_deref(), Some("1234"));
        assert_eq!(back.device_id, "ABC");
        assert_eq!(
            std::fs::read_to_string(store.path()).unwrap().trim(),
            "10.0.0.1 1234 ABC"
        );
        store.clear().unwrap();
    }

    #[test]
    fn test_file_store_overwrites_not_merges() {
        let store = FileTunnelStore::new(scratch("tunnel_info.txt"));
        store
            .save(&TunnelDescriptor::established("10.0.0.1", "1234", "ABC"))
            .unwrap();
        store.save(&TunnelDescriptor::pending("XYZ")).unwrap();

        let back = store.load().unwrap();
        assert_eq!(back.state, TunnelState::Pending);
        assert_eq!(back.device_id, "XYZ");
        assert!(back.address.is_none());
        store.clear().unwrap();
    }

    #[test]
    fn test_file_store_missing_or_partial_is_none() {
        let path = scratch("tunnel_info.txt");
        let store = FileTunnelStore::new(&path);
        assert!(store.load().is_none());

        std::fs::write(&path, "10.0.0.1 12").unwrap();
        assert!(store.load().is_none());
        store.clear().unwrap();
    }

    #[test]
    fn test_file_store_clear_is_idempotent() {
        let store = FileTunnelStore::new(scratch("tunnel_info.txt"));
        store.clear().unwrap();
        store.clear().unwrap();
    }

    #[test]
    fn test_memory_store_last_writer_wins() {
        let store = MemoryTunnelStore::default();
        assert!(store.load().is_none());
        store
            .save(&TunnelDescriptor::established("a", "1", "D1"))
            .unwrap();
        store
            .save(&TunnelDescriptor::established("b", "2", "D2"))
            .unwrap();
        assert_eq!(store.load().unwrap().device_id, "D2");
        store.clear().unwrap();
        assert!(store.load().is_none());
    }
}
