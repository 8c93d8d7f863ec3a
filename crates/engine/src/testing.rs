//! Scripted process double for workflow and strategy tests.
//!
//! Rules are matched by substring against the rendered command line, in
//! insertion order; the first match wins. Unmatched commands fail with
//! `"no scripted result"`. Every call is recorded.

use crate::config::EngineConfig;
use crate::context::SimContext;
use crate::platform::MemoryTunnelStore;
use crate::traits::*;
use crate::types::{CommandResult, ToolCommand};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Execute(String),
    Tunnel(String),
    Detached(String),
    Kill(String),
}

impl Call {
    pub fn line(&self) -> &str {
        match self {
            Call::Execute(s) | Call::Tunnel(s) | Call::Detached(s) | Call::Kill(s) => s,
        }
    }
}

#[derive(Default)]
struct Script {
    rules: Vec<(String, CommandResult)>,
    detached_log: Option<String>,
    detached_fails: bool,
    calls: Vec<Call>,
}

/// Cloneable handle; clones share the script and the call log.
#[derive(Clone, Default)]
pub struct FakeProcess {
    inner: Arc<Mutex<Script>>,
}

impl FakeProcess {
    pub fn new() -> Self {
        Self::default()
    }

    /// Respond to any command line containing `needle`.
    pub fn on(&self, needle: &str, result: CommandResult) -> &Self {
        self.inner
            .lock()
            .unwrap()
            .rules
            .push((needle.to_string(), result));
        self
    }

    pub fn ok(&self, needle: &str, output: &str) -> &Self {
        self.on(needle, CommandResult::ok(output))
    }

    pub fn fail(&self, needle: &str, error: &str) -> &Self {
        self.on(needle, CommandResult::failure(error))
    }

    /// Content written to the log file of the next detached launch.
    pub fn detached_log(&self, content: &str) -> &Self {
        self.inner.lock().unwrap().detached_log = Some(content.to_string());
        self
    }

    pub fn detached_fails(&self) -> &Self {
        self.inner.lock().unwrap().detached_fails = true;
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.inner.lock().unwrap().calls.clone()
    }

    /// Recorded calls whose command line contains `needle`.
    pub fn calls_matching(&self, needle: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.line().contains(needle))
            .collect()
    }

    fn respond(&self, line: &str) -> CommandResult {
        let script = self.inner.lock().unwrap();
        script
            .rules
            .iter()
            .find(|(needle, _)| line.contains(needle.as_str()))
            .map(|(_, r)| r.clone())
            .unwrap_or_else(|| CommandResult::failure("no scripted result"))
    }

    fn record(&self, call: Call) {
        self.inner.lock().unwrap().calls.push(call);
    }
}

#[async_trait::async_trait]
impl ProcessOps for FakeProcess {
    async fn execute(&self, cmd: &ToolCommand, _timeout: Duration) -> CommandResult {
        let line = cmd.to_string();
        self.record(Call::Execute(line.clone()));
        self.respond(&line)
    }

    async fn run_tunnel(&self, cmd: &ToolCommand) -> CommandResult {
        let line = cmd.to_string();
        self.record(Call::Tunnel(line.clone()));
        self.respond(&line)
    }

    fn spawn_detached(&self, cmd: &ToolCommand, log: &Path) -> CapResult<u32> {
        self.record(Call::Detached(cmd.to_string()));
        let (content, fails) = {
            let script = self.inner.lock().unwrap();
            (script.detached_log.clone(), script.detached_fails)
        };
        if fails {
            return Err(CapError::Spawn {
                command: cmd.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
            });
        }
        std::fs::write(log, content.unwrap_or_default())?;
        Ok(4242)
    }

    async fn kill_matching(&self, pattern: &str) -> CapResult<()> {
        self.record(Call::Kill(pattern.to_string()));
        Ok(())
    }
}

/// Config with zero settle times and a private scratch directory.
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    let dir: PathBuf =
        std::env::temp_dir().join(format!("locsim_test_{}", crate::types::new_run_id()));
    let _ = std::fs::create_dir_all(&dir);
    config.tunnel.scratch_dir = dir;
    config.tunnel.settle_ms = 0;
    config.tunnel.cleanup_settle_ms = 0;
    config
}

/// Context over a [`FakeProcess`] and an in-memory store.
pub fn fake_context(fake: &FakeProcess) -> SimContext {
    SimContext::new(
        Box::new(fake.clone()),
        Box::new(MemoryTunnelStore::default()),
        test_config(),
    )
}
