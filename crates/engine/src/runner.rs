//! Process runner – spawns tool commands in their own process group,
//! enforces a hard timeout and escalates termination (SIGTERM, then
//! SIGKILL) across the whole group.

use crate::classifier::OutputProfile;
use crate::traits::{CapError, CapResult};
use crate::types::{CommandResult, ToolCommand};
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const TIMEOUT_MESSAGE: &str = "Command timeout";

/// How long to keep reading pipes after the process is gone.
const DRAIN_WINDOW: Duration = Duration::from_millis(1000);

/// A command configured to start in a fresh process group so signals can
/// reach everything it forks.
pub(crate) fn grouped_command(cmd: &ToolCommand) -> Command {
    let mut c = Command::new(&cmd.program);
    c.args(&cmd.args).stdin(Stdio::null()).kill_on_drop(true);
    #[cfg(unix)]
    c.process_group(0);
    c
}

// ---------------------------------------------------------------------------
// Output capture
// ---------------------------------------------------------------------------

/// Bytes read so far from one pipe. Shared with the reader task so partial
/// output survives a kill.
#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    fn push(&self, bytes: &[u8]) {
        if let Ok(mut buf) = self.0.lock() {
            buf.extend_from_slice(bytes);
        }
    }

    fn take(&self) -> String {
        match self.0.lock() {
            Ok(mut buf) => String::from_utf8_lossy(&std::mem::take(&mut *buf)).into_owned(),
            Err(_) => String::new(),
        }
    }
}

fn capture<R>(stream: Option<R>, sink: Captured) -> Option<JoinHandle<()>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut stream = stream?;
    Some(tokio::spawn(async move {
        let mut chunk = [0u8; 4096];
        loop {
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => sink.push(&chunk[..n]),
            }
        }
    }))
}

/// Wait for the readers to hit EOF, giving up after [`DRAIN_WINDOW`]. A
/// stray grandchild holding the pipe open must not hang the caller.
async fn drain(readers: [Option<JoinHandle<()>>; 2]) {
    let deadline = tokio::time::Instant::now() + DRAIN_WINDOW;
    for mut handle in readers.into_iter().flatten() {
        if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
            handle.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Run `cmd` to completion or until `timeout` elapses.
///
/// Spawn failures and timeouts are reported in the result, never as `Err`.
/// On normal exit the raw exit code and output go through `profile`.
pub async fn execute(
    cmd: &ToolCommand,
    timeout: Duration,
    grace: Duration,
    profile: &OutputProfile,
) -> CommandResult {
    debug!(command = %cmd, timeout_s = timeout.as_secs(), "executing command");

    let mut child = match grouped_command(cmd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(c) => c,
        Err(e) => {
            warn!(command = %cmd, error = %e, "failed to spawn command");
            return CommandResult::failure(e.to_string());
        }
    };

    let stdout = Captured::default();
    let stderr = Captured::default();
    let readers = [
        capture(child.stdout.take(), stdout.clone()),
        capture(child.stderr.take(), stderr.clone()),
    ];

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => {
            drain(readers).await;
            let result = profile.to_result(status.code(), stdout.take(), stderr.take());
            debug!(command = %cmd, code = ?status.code(), success = result.success, "command finished");
            result
        }
        Ok(Err(e)) => {
            warn!(command = %cmd, error = %e, "failed waiting on command");
            if let Err(e) = terminate(&mut child, grace).await {
                warn!(command = %cmd, error = %e, "failed to terminate command after wait error");
            }
            drain(readers).await;
            CommandResult {
                success: false,
                output: stdout.take(),
                error: e.to_string(),
            }
        }
        Err(_) => {
            warn!(command = %cmd, timeout_s = timeout.as_secs(), "command timed out, killing process group");
            if let Err(e) = terminate(&mut child, grace).await {
                warn!(command = %cmd, error = %e, "failed to terminate timed-out command");
            }
            drain(readers).await;
            let partial_err = stderr.take();
            if !partial_err.trim().is_empty() {
                debug!(command = %cmd, stderr = %tail(&partial_err, STDERR_TAIL), "stderr before timeout");
            }
            CommandResult {
                success: false,
                output: stdout.take(),
                error: TIMEOUT_MESSAGE.to_string(),
            }
        }
    }
}

/// Bytes of stderr kept in the timeout log line.
const STDERR_TAIL: usize = 512;

/// Last `max` bytes of `text`, cut on a char boundary.
fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

/// Terminate the child's whole process group: SIGTERM, wait up to `grace`,
/// then SIGKILL whatever is left. Reaps the child.
pub(crate) async fn terminate(child: &mut Child, grace: Duration) -> std::io::Result<()> {
    let Some(pid) = child.id() else {
        // Already reaped.
        return Ok(());
    };

    #[cfg(unix)]
    {
        use nix::sys::signal::Signal;

        signal_group(pid, Signal::SIGTERM)?;
        if tokio::time::timeout(grace, child.wait()).await.is_err() {
            debug!(pid, "process group still alive after grace window, sending SIGKILL");
        }
        // Also sweeps children that outlived the group leader.
        signal_group(pid, Signal::SIGKILL)?;
    }

    #[cfg(not(unix))]
    {
        let _ = (pid, grace);
        child.start_kill()?;
    }

    child.wait().await?;
    debug!(pid, "process terminated");
    Ok(())
}

#[cfg(unix)]
fn signal_group(pgid: u32, signal: nix::sys::signal::Signal) -> std::io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(pgid as i32), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(std::io::Error::from(e)),
    }
}

// ---------------------------------------------------------------------------
// Detached launch and pattern kill
// ---------------------------------------------------------------------------

/// Start `cmd` in its own process group with stdout and stderr written to
/// `log`. Nothing here waits for it; a reaper thread collects its exit
/// status whenever it ends.
pub fn spawn_detached(cmd: &ToolCommand, log: &Path) -> CapResult<u32> {
    if let Some(parent) = log.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let out = std::fs::File::create(log)?;
    let err = out.try_clone()?;

    let mut c = std::process::Command::new(&cmd.program);
    c.args(&cmd.args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(out))
        .stderr(Stdio::from(err));
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        c.process_group(0);
    }

    let mut child = c.spawn().map_err(|source| CapError::Spawn {
        command: cmd.to_string(),
        source,
    })?;
    let pid = child.id();
    std::thread::spawn(move || {
        let _ = child.wait();
    });
    debug!(command = %cmd, pid, log = %log.display(), "detached process started");
    Ok(pid)
}

/// Kill every process whose full command line contains `pattern`.
/// "Nothing matched" is success.
pub async fn kill_matching(pattern: &str, timeout: Duration) -> CapResult<()> {
    let output = tokio::time::timeout(
        timeout,
        Command::new("pkill")
            .arg("-f")
            .arg(pattern)
            .stdin(Stdio::null())
            .output(),
    )
    .await
    .map_err(|_| CapError::Timeout)?
    .map_err(|source| CapError::Spawn {
        command: format!("pkill -f {}", pattern),
        source,
    })?;

    match output.status.code() {
        Some(0) => {
            debug!(pattern, "killed matching processes");
            Ok(())
        }
        Some(1) => {
            debug!(pattern, "no matching processes");
            Ok(())
        }
        code => Err(CapError::Other(format!(
            "pkill -f {} failed ({:?}): {}",
            pattern,
            code,
            String::from_utf8_lossy(&output.stderr).trim()
        ))),
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::Tool;
    use std::time::Instant;

    pub(crate) fn sh(script: &str) -> ToolCommand {
        ToolCommand::new(Tool::System, "sh").args(["-c", script])
    }

    pub(crate) fn scratch(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("locsim_{}_{}", name, crate::types::new_run_id()))
    }

    /// Alive and not a zombie.
    #[cfg(target_os = "linux")]
    pub(crate) fn is_running(pid: i32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .and_then(|rest| rest.split_whitespace().next())
                .map(|state| state != "Z" && state != "X")
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    pub(crate) async fn wait_until_gone(pid: i32) -> bool {
        for _ in 0..40 {
            if !is_running(pid) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_execute_success_captures_output() {
        let r = execute(
            &sh("echo hello; echo warn 1>&2"),
            Duration::from_secs(5),
            Duration::from_millis(200),
            &OutputProfile::plain(),
        )
        .await;
        assert!(r.success);
        assert_eq!(r.output.trim(), "hello");
        assert_eq!(r.error.trim(), "warn");
    }

    #[tokio::test]
    async fn test_execute_nonzero_exit() {
        let r = execute(
            &sh("exit 4"),
            Duration::from_secs(5),
            Duration::from_millis(200),
            &OutputProfile::plain(),
        )
        .await;
        assert!(!r.success);
        assert!(!r.error.is_empty());
    }

    #[tokio::test]
    async fn test_execute_applies_profile() {
        let r = execute(
            &sh("echo 'error: device offline'"),
            Duration::from_secs(5),
            Duration::from_millis(200),
            &OutputProfile::adb(),
        )
        .await;
        assert!(!r.success);
        assert!(r.error.contains("device offline"));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let cmd = ToolCommand::new(Tool::System, "locsim-definitely-not-a-binary");
        let r = execute(
            &cmd,
            Duration::from_secs(5),
            Duration::from_millis(200),
            &OutputProfile::plain(),
        )
        .await;
        assert!(!r.success);
        assert!(r.output.is_empty());
        assert!(!r.error.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_keeps_partial_output() {
        let start = Instant::now();
        let r = execute(
            &sh("echo partial; sleep 30"),
            Duration::from_millis(500),
            Duration::from_millis(200),
            &OutputProfile::plain(),
        )
        .await;
        assert!(!r.success);
        assert_eq!(r.error, TIMEOUT_MESSAGE);
        assert!(r.output.contains("partial"));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_timeout_with_stderr_keeps_error_stable() {
        let r = execute(
            &sh("echo out; echo stuck-on-handshake >&2; sleep 30"),
            Duration::from_millis(500),
            Duration::from_millis(200),
            &OutputProfile::plain(),
        )
        .await;
        assert_eq!(r.error, TIMEOUT_MESSAGE);
        assert!(r.output.contains("out"));
        assert!(!r.output.contains("stuck-on-handshake"));
    }

    #[test]
    fn test_tail_cuts_on_char_boundary() {
        assert_eq!(tail("short", 512), "short");
        assert_eq!(tail("abcdef", 3), "def");
        // 'é' is two bytes; a cut inside it moves forward.
        assert_eq!(tail("aéb", 2), "b");
        assert_eq!(tail("aéb", 3), "éb");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_timeout_kills_children() {
        let pidfile = scratch("child_pid");
        let script = format!(
            "sleep 30 & echo $! > {}; wait",
            pidfile.display()
        );
        let r = execute(
            &sh(&script),
            Duration::from_millis(500),
            Duration::from_millis(200),
            &OutputProfile::plain(),
        )
        .await;
        assert!(!r.success);
        assert_eq!(r.error, TIMEOUT_MESSAGE);

        let pid: i32 = std::fs::read_to_string(&pidfile)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert!(wait_until_gone(pid).await, "child {} still running", pid);
        let _ = std::fs::remove_file(&pidfile);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_timeout_escalates_past_ignored_sigterm() {
        let pidfile = scratch("stubborn_pid");
        let script = format!("trap '' TERM; echo $$ > {}; sleep 30", pidfile.display());
        let r = execute(
            &sh(&script),
            Duration::from_millis(500),
            Duration::from_millis(200),
            &OutputProfile::plain(),
        )
        .await;
        assert_eq!(r.error, TIMEOUT_MESSAGE);
        let pid: i32 = std::fs::read_to_string(&pidfile)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert!(wait_until_gone(pid).await);
        let _ = std::fs::remove_file(&pidfile);
    }

    #[tokio::test]
    async fn test_spawn_detached_writes_log() {
        let log = scratch("detached.log");
        spawn_detached(&sh("echo 'RSD Address: fd00::1'; echo oops 1>&2"), &log).unwrap();

        let mut content = String::new();
        for _ in 0..40 {
            content = std::fs::read_to_string(&log).unwrap_or_default();
            if content.contains("oops") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(content.contains("RSD Address: fd00::1"));
        assert!(content.contains("oops"));
        let _ = std::fs::remove_file(&log);
    }

    #[test]
    fn test_spawn_detached_missing_binary() {
        let log = scratch("missing.log");
        let cmd = ToolCommand::new(Tool::System, "locsim-definitely-not-a-binary");
        let err = spawn_detached(&cmd, &log).unwrap_err();
        assert!(matches!(err, CapError::Spawn { .. }));
        let _ = std::fs::remove_file(&log);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_kill_matching_nothing_running_is_ok() {
        if std::process::Command::new("pkill").arg("-V").output().is_err() {
            return;
        }
        let pattern = format!("locsim-no-such-process-{}", crate::types::new_run_id());
        kill_matching(&pattern, Duration::from_secs(5)).await.unwrap();
        kill_matching(&pattern, Duration::from_secs(5)).await.unwrap();
    }
}
