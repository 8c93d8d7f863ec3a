//! Session context – holds the capability trait objects and config.

use crate::config::EngineConfig;
use crate::platform::{FileTunnelStore, SystemProcess};
use crate::traits::*;

/// Central context passed to all engine operations.
///
/// Owns the process driver and the tunnel store so callers (CLI, daemon,
/// tests) can swap implementations. There is no other shared state.
pub struct SimContext {
    process: Box<dyn ProcessOps>,
    store: Box<dyn TunnelStore>,
    pub config: EngineConfig,
}

impl SimContext {
    pub fn new(
        process: Box<dyn ProcessOps>,
        store: Box<dyn TunnelStore>,
        config: EngineConfig,
    ) -> Self {
        Self {
            process,
            store,
            config,
        }
    }

    /// Real processes and the scratch-file tunnel store from `config`.
    pub fn system(config: EngineConfig) -> Self {
        Self {
            process: Box::new(SystemProcess::new(&config)),
            store: Box::new(FileTunnelStore::new(config.tunnel.info_path())),
            config,
        }
    }

    pub fn process(&self) -> &dyn ProcessOps {
        self.process.as_ref()
    }

    pub fn store(&self) -> &dyn TunnelStore {
        self.store.as_ref()
    }
}
