//! Tunnel monitor – runs commands that hold a connection open and never
//! exit on their own.
//!
//! A watcher task reads both output streams line by line and fires a
//! one-shot readiness signal on the first line containing a readiness
//! marker. The caller waits for that signal (bounded by the ready timeout)
//! and then always terminates the process group, ready or not.

use crate::runner::{grouped_command, terminate};
use crate::types::{CommandResult, ToolCommand};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::process::{ChildStderr, ChildStdout};
use tokio::sync::oneshot;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
pub struct TunnelTimings {
    /// Caller's wait for the readiness signal.
    pub ready: Duration,
    /// Upper bound on the watcher's lifetime.
    pub monitor: Duration,
    /// SIGTERM to SIGKILL window.
    pub grace: Duration,
}

pub const TUNNEL_SUCCESS: &str = "Command executed successfully";

pub async fn run_tunnel_command(
    cmd: &ToolCommand,
    markers: &[String],
    timings: TunnelTimings,
) -> CommandResult {
    debug!(command = %cmd, "executing tunnel command");

    let mut child = match grouped_command(cmd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(c) => c,
        Err(e) => {
            warn!(command = %cmd, error = %e, "failed to spawn tunnel command");
            return CommandResult::failure(e.to_string());
        }
    };

    let (ready_tx, ready_rx) = oneshot::channel();
    let watcher = tokio::spawn(watch_for_readiness(
        child.stdout.take(),
        child.stderr.take(),
        markers.to_vec(),
        timings.monitor,
        ready_tx,
    ));

    match tokio::time::timeout(timings.ready, ready_rx).await {
        Ok(Ok(line)) => debug!(line = %line, "process ready - terminating"),
        Ok(Err(_)) => debug!("monitor stopped without readiness - terminating anyway"),
        Err(_) => debug!("timeout waiting for readiness marker - terminating anyway"),
    }

    let terminated = terminate(&mut child, timings.grace).await;
    watcher.abort();

    match terminated {
        Ok(()) => CommandResult::ok(TUNNEL_SUCCESS),
        Err(e) => {
            warn!(command = %cmd, error = %e, "error terminating tunnel command");
            CommandResult::failure(format!("Process termination error: {}", e))
        }
    }
}

enum WatchEvent {
    Line(&'static str, String),
    Closed(&'static str),
    Deadline,
}

async fn next_line<R>(lines: &mut Option<Lines<R>>) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    match lines {
        Some(l) => l.next_line().await,
        None => std::future::pending().await,
    }
}

/// Stops on the first marker match, when both streams reach end-of-file,
/// or when `limit` elapses.
async fn watch_for_readiness(
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    markers: Vec<String>,
    limit: Duration,
    ready: oneshot::Sender<String>,
) {
    let mut out = stdout.map(|s| BufReader::new(s).lines());
    let mut err = stderr.map(|s| BufReader::new(s).lines());
    let deadline = tokio::time::sleep(limit);
    tokio::pin!(deadline);

    loop {
        if out.is_none() && err.is_none() {
            debug!("output streams closed - stopping monitor");
            return;
        }

        let event = tokio::select! {
            _ = &mut deadline => WatchEvent::Deadline,
            res = next_line(&mut out) => match res {
                Ok(Some(line)) => WatchEvent::Line("stdout", line),
                _ => WatchEvent::Closed("stdout"),
            },
            res = next_line(&mut err) => match res {
                Ok(Some(line)) => WatchEvent::Line("stderr", line),
                _ => WatchEvent::Closed("stderr"),
            },
        };

        match event {
            WatchEvent::Deadline => {
                debug!("monitor timeout reached");
                return;
            }
            WatchEvent::Closed(stream) => {
                debug!(stream, "EOF reached");
                if stream == "stdout" {
                    out = None;
                } else {
                    err = None;
                }
            }
            WatchEvent::Line(stream, line) => {
                let line = line.trim().to_string();
                debug!(stream, line = %line, "process output");
                if markers.iter().any(|m| line.contains(m.as_str())) {
                    let _ = ready.send(line);
                    return;
                }
            }
        }
    }
}
