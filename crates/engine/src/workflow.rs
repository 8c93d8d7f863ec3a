//! Device setup workflow – prepares an iOS device for location simulation.
//!
//! Strict linear sequence, no skipping:
//!
//! ```text
//! Idle -> PasscodeCheck -> DevModeCheck -> DiskMount -> TunnelStart -> Ready
//!              \________________\______________\____________\--> Failed(step, reason)
//! ```
//!
//! `Failed` is absorbing. Nothing after the failing step runs.

use crate::commands::OpError;
use crate::context::SimContext;
use crate::ios::{DeviceInfo, Pmd};
use crate::types::{Platform, TunnelDescriptor};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use tracing::{debug, error, info, warn};

pub const PASSCODE_ENABLED: &str = "iPhone passcode must be disabled for location simulation. Go to Settings > Face ID & Passcode > Turn Passcode Off, then restart your iPhone.";
pub const DEV_MODE_BLOCKED: &str = "Cannot enable developer mode with passcode set. Please either: 1) Disable iPhone passcode first, or 2) Manually enable Developer Mode in Settings > Privacy & Security > Developer Mode.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SetupStep {
    PasscodeCheck,
    DevModeCheck,
    DiskMount,
    TunnelStart,
}

impl SetupStep {
    pub const ORDER: [SetupStep; 4] = [
        SetupStep::PasscodeCheck,
        SetupStep::DevModeCheck,
        SetupStep::DiskMount,
        SetupStep::TunnelStart,
    ];

    /// Passcode problems are user preconditions, the rest are tool failures.
    pub fn into_error(self, reason: String) -> OpError {
        match self {
            SetupStep::PasscodeCheck | SetupStep::DevModeCheck => OpError::Precondition(reason),
            SetupStep::DiskMount | SetupStep::TunnelStart => OpError::ToolError(reason),
        }
    }
}

impl fmt::Display for SetupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SetupStep::PasscodeCheck => "passcode check",
            SetupStep::DevModeCheck => "developer mode check",
            SetupStep::DiskMount => "disk image mount",
            SetupStep::TunnelStart => "tunnel start",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupState {
    Idle,
    Running(SetupStep),
    Ready(SetupReport),
    Failed { step: SetupStep, reason: String },
}

/// Success payload of a completed setup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SetupReport {
    pub message: String,
    pub developer_mode: String,
    pub disk_image: String,
    pub tunnel_service: String,
    pub device_id: String,
    pub platform: Platform,
    pub ios_version: String,
    pub build_version: String,
    pub model: String,
}

/// Diagnostics gathered while the steps run.
#[derive(Debug, Default)]
struct Progress {
    info: DeviceInfo,
    developer_mode: String,
    disk_image: String,
    tunnel_service: String,
}

pub struct SetupWorkflow<'a> {
    ctx: &'a SimContext,
    device_id: String,
    state: SetupState,
    progress: Progress,
}

impl<'a> SetupWorkflow<'a> {
    pub fn new(ctx: &'a SimContext, device_id: &str) -> Self {
        Self {
            ctx,
            device_id: device_id.to_string(),
            state: SetupState::Idle,
            progress: Progress::default(),
        }
    }

    pub fn state(&self) -> &SetupState {
        &self.state
    }

    /// Drive the workflow to `Ready` or `Failed` and return the final state.
    pub async fn run(mut self) -> SetupState {
        for step in SetupStep::ORDER {
            self.state = SetupState::Running(step);
            debug!(device_id = %self.device_id, %step, "setup step");

            let outcome = match step {
                SetupStep::PasscodeCheck => self.check_passcode().await,
                SetupStep::DevModeCheck => self.check_developer_mode().await,
                SetupStep::DiskMount => self.mount_disk_image().await,
                SetupStep::TunnelStart => self.start_tunnel().await,
            };

            if let Err(reason) = outcome {
                error!(device_id = %self.device_id, %step, reason = %reason, "setup failed");
                self.state = SetupState::Failed { step, reason };
                return self.state;
            }
        }

        info!(device_id = %self.device_id, "iOS device setup completed");
        let p = self.progress;
        self.state = SetupState::Ready(SetupReport {
            message: format!(
                "iOS device successfully prepared for location testing. Tunnel service {}.",
                p.tunnel_service
            ),
            developer_mode: p.developer_mode,
            disk_image: p.disk_image,
            tunnel_service: p.tunnel_service,
            device_id: self.device_id,
            platform: Platform::Ios,
            ios_version: p.info.ios_version,
            build_version: p.info.build_version,
            model: p.info.model,
        });
        self.state
    }

    /// Hard stop when the device reports passcode protection. An info
    /// query that fails or returns non-JSON does not block setup.
    async fn check_passcode(&mut self) -> Result<(), String> {
        let ctx = self.ctx;
        let result = ctx
            .process()
            .execute(
                &Pmd::new(ctx).lockdown_info(&self.device_id),
                ctx.config.timeouts.command(),
            )
            .await;
        if !result.success {
            warn!(error = %result.error, "lockdown info failed - passcode state unknown");
            return Ok(());
        }

        let info = match serde_json::from_str::<Value>(&result.output) {
            Ok(v @ Value::Object(_)) => v,
            _ => {
                warn!("lockdown info is not a JSON object - passcode state unknown");
                return Ok(());
            }
        };
        self.progress.info = DeviceInfo::from_lockdown(&info);

        // A missing flag is treated as protected.
        let protected = info
            .get("PasswordProtected")
            .map(truthy)
            .unwrap_or(true);
        if protected {
            return Err(PASSCODE_ENABLED.to_string());
        }
        Ok(())
    }

    /// Enable developer mode if needed. Only a passcode refusal blocks; any
    /// other enable failure is logged and setup continues.
    async fn check_developer_mode(&mut self) -> Result<(), String> {
        let ctx = self.ctx;
        let pmd = Pmd::new(ctx);
        let timeout = ctx.config.timeouts.command();

        let status = ctx
            .process()
            .execute(&pmd.developer_mode_status(&self.device_id), timeout)
            .await;
        debug!(success = status.success, output = %status.output.trim(), "developer mode status");

        let lowered = status.output.to_lowercase();
        if status.success && (lowered.contains("enabled") || lowered.contains("true")) {
            info!("developer mode already enabled");
            self.progress.developer_mode = "already enabled".into();
            return Ok(());
        }

        info!("developer mode not enabled - attempting to enable");
        let enable = ctx
            .process()
            .execute(&pmd.enable_developer_mode(&self.device_id), timeout)
            .await;
        if enable.success {
            self.progress.developer_mode = "enabled".into();
        } else if enable.error.contains("passcode is set") {
            return Err(DEV_MODE_BLOCKED.to_string());
        } else {
            warn!(error = %enable.error_or_unknown(), "developer mode enable failed - continuing");
            self.progress.developer_mode = "enable failed".into();
        }
        Ok(())
    }

    async fn mount_disk_image(&mut self) -> Result<(), String> {
        let ctx = self.ctx;
        let mount = ctx
            .process()
            .execute(
                &Pmd::new(ctx).auto_mount(&self.device_id),
                ctx.config.timeouts.command(),
            )
            .await;

        if !mount.success && !mount.error.contains("already mounted") {
            return Err(format!(
                "Failed to mount DeveloperDiskImage: {}",
                mount.error_or_unknown()
            ));
        }
        self.progress.disk_image = if mount.output.contains("successfully") {
            "mounted successfully".into()
        } else {
            "already mounted".into()
        };
        info!(disk_image = %self.progress.disk_image, "DeveloperDiskImage ready");
        Ok(())
    }

    /// Launch the detached tunnel, let it settle, then read the RSD
    /// endpoint from its log. The descriptor is always written so later
    /// calls know which device is active.
    async fn start_tunnel(&mut self) -> Result<(), String> {
        let ctx = self.ctx;
        let tunnel = &ctx.config.tunnel;
        let log = tunnel.log_path();

        let pid = ctx
            .process()
            .spawn_detached(&Pmd::new(ctx).start_tunnel(Some(&self.device_id)), &log)
            .map_err(|e| format!("Failed to start tunnel service: {}", e))?;
        info!(pid, log = %log.display(), "tunnel service started in background");

        tokio::time::sleep(tunnel.settle()).await;

        let content = tokio::fs::read_to_string(&log).await.unwrap_or_default();
        let descriptor = match extract_endpoint(&content, &tunnel.address_label, &tunnel.port_label) {
            Some((address, port)) => {
                info!(%address, %port, "tunnel established");
                self.progress.tunnel_service = format!("established at {}:{}", address, port);
                TunnelDescriptor::established(address, port, self.device_id.as_str())
            }
            None => {
                warn!("tunnel started but connection details not yet available");
                self.progress.tunnel_service = "started (may take a moment to establish)".into();
                TunnelDescriptor::pending(self.device_id.as_str())
            }
        };

        ctx.store()
            .save(&descriptor)
            .map_err(|e| format!("Failed to store tunnel info: {}", e))
    }
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Find `<label> value` lines in the tunnel log. Later lines win.
pub fn extract_endpoint(log: &str, address_label: &str, port_label: &str) -> Option<(String, String)> {
    let mut address = None;
    let mut port = None;
    for line in log.lines() {
        if let Some((_, rest)) = line.split_once(address_label) {
            address = Some(rest.trim().to_string());
        } else if let Some((_, rest)) = line.split_once(port_label) {
            port = Some(rest.trim().to_string());
        }
    }
    match (address, port) {
        (Some(a), Some(p)) if !a.is_empty() && !p.is_empty() => Some((a, p)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fake_context, Call, FakeProcess};
    use crate::types::TunnelState;

    const UNLOCKED: &str = r#"{"PasswordProtected": false, "ProductType": "iPhone15,2", "ProductVersion": "17.4", "BuildVersion": "21E219"}"#;
    const TUNNEL_LOG: &str = "INFO tunnel created\nIdentifier: ABC\nRSD Address: fd7b:e5b:6f53::1\nRSD Port: 58783\nUse the follow connection option:\n--rsd fd7b:e5b:6f53::1 58783\n";

    fn happy_fake() -> FakeProcess {
        let fake = FakeProcess::new();
        fake.ok("lockdown info", UNLOCKED)
            .ok("amfi developer-mode-status", "true")
            .ok("mounter auto-mount", "DeveloperDiskImage mounted successfully")
            .detached_log(TUNNEL_LOG);
        fake
    }

    #[tokio::test]
    async fn test_happy_path_reaches_ready() {
        let fake = happy_fake();
        let ctx = fake_context(&fake);

        let state = SetupWorkflow::new(&ctx, "ABC").run().await;
        let SetupState::Ready(report) = state else {
            panic!("expected Ready, got {:?}", state);
        };
        assert_eq!(report.developer_mode, "already enabled");
        assert_eq!(report.disk_image, "mounted successfully");
        assert_eq!(report.tunnel_service, "established at fd7b:e5b:6f53::1:58783");
        assert_eq!(report.model, "iPhone 14 Pro");
        assert_eq!(report.ios_version, "17.4");
        assert_eq!(report.build_version, "21E219");

        let stored = ctx.store().load().unwrap();
        assert_eq!(stored.state, TunnelState::Established);
        assert_eq!(stored.endpoint(), Some(("fd7b:e5b:6f53::1", "58783")));
        assert_eq!(stored.device_id, "ABC");

        assert!(fake.calls_matching("enable-developer-mode").is_empty());
        assert_eq!(
            fake.calls_matching("start-tunnel"),
            vec![Call::Detached(
                "python3 -m pymobiledevice3 lockdown start-tunnel --udid ABC".into()
            )]
        );
    }

    #[tokio::test]
    async fn test_passcode_halts_before_anything_else() {
        let fake = FakeProcess::new();
        fake.ok("lockdown info", r#"{"PasswordProtected": true}"#);
        let ctx = fake_context(&fake);

        let state = SetupWorkflow::new(&ctx, "ABC").run().await;
        assert_eq!(
            state,
            SetupState::Failed {
                step: SetupStep::PasscodeCheck,
                reason: PASSCODE_ENABLED.to_string()
            }
        );
        assert!(fake.calls_matching("amfi").is_empty());
        assert!(fake.calls_matching("mounter").is_empty());
        assert!(fake.calls_matching("start-tunnel").is_empty());
        assert_eq!(fake.calls().len(), 1);
        assert!(ctx.store().load().is_none());
    }

    #[tokio::test]
    async fn test_missing_passcode_flag_counts_as_protected() {
        let fake = FakeProcess::new();
        fake.ok("lockdown info", r#"{"ProductVersion": "17.4"}"#);
        let ctx = fake_context(&fake);

        let state = SetupWorkflow::new(&ctx, "ABC").run().await;
        assert!(matches!(
            state,
            SetupState::Failed {
                step: SetupStep::PasscodeCheck,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_unreadable_info_does_not_block() {
        let fake = FakeProcess::new();
        // Non-JSON info output: passcode state unknown, carry on.
        fake.ok("lockdown info", "not json")
            .ok("amfi developer-mode-status", "true")
            .ok("mounter auto-mount", "ok")
            .detached_log(TUNNEL_LOG);
        let ctx = fake_context(&fake);

        let state = SetupWorkflow::new(&ctx, "ABC").run().await;
        let SetupState::Ready(report) = state else {
            panic!("expected Ready, got {:?}", state);
        };
        assert_eq!(report.model, "iPhone");
        assert_eq!(report.disk_image, "already mounted");
    }

    #[tokio::test]
    async fn test_dev_mode_passcode_race_fails() {
        let fake = FakeProcess::new();
        fake.ok("lockdown info", UNLOCKED)
            .ok("amfi developer-mode-status", "false")
            .fail(
                "amfi enable-developer-mode",
                "Cannot enable developer-mode when passcode is set",
            );
        let ctx = fake_context(&fake);

        let state = SetupWorkflow::new(&ctx, "ABC").run().await;
        assert_eq!(
            state,
            SetupState::Failed {
                step: SetupStep::DevModeCheck,
                reason: DEV_MODE_BLOCKED.to_string()
            }
        );
        assert!(fake.calls_matching("mounter").is_empty());
    }

    #[tokio::test]
    async fn test_dev_mode_other_failure_is_best_effort() {
        let fake = FakeProcess::new();
        fake.ok("lockdown info", UNLOCKED)
            .ok("amfi developer-mode-status", "false")
            .fail("amfi enable-developer-mode", "some transient error")
            .fail("mounter auto-mount", "DeveloperDiskImage already mounted")
            .detached_log("");
        let ctx = fake_context(&fake);

        let state = SetupWorkflow::new(&ctx, "ABC").run().await;
        let SetupState::Ready(report) = state else {
            panic!("expected Ready, got {:?}", state);
        };
        assert_eq!(report.developer_mode, "enable failed");
        assert_eq!(report.disk_image, "already mounted");
        assert_eq!(report.tunnel_service, "started (may take a moment to establish)");

        let stored = ctx.store().load().unwrap();
        assert_eq!(stored.state, TunnelState::Pending);
        assert_eq!(stored.device_id, "ABC");
    }

    #[tokio::test]
    async fn test_mount_failure_stops_before_tunnel() {
        let fake = FakeProcess::new();
        fake.ok("lockdown info", UNLOCKED)
            .ok("amfi developer-mode-status", "enabled")
            .fail("mounter auto-mount", "image not found");
        let ctx = fake_context(&fake);

        let state = SetupWorkflow::new(&ctx, "ABC").run().await;
        assert_eq!(
            state,
            SetupState::Failed {
                step: SetupStep::DiskMount,
                reason: "Failed to mount DeveloperDiskImage: image not found".into()
            }
        );
        assert!(fake.calls_matching("start-tunnel").is_empty());
    }

    #[tokio::test]
    async fn test_tunnel_spawn_failure_fails_step() {
        let fake = happy_fake();
        fake.detached_fails();
        let ctx = fake_context(&fake);

        let state = SetupWorkflow::new(&ctx, "ABC").run().await;
        assert!(matches!(
            state,
            SetupState::Failed {
                step: SetupStep::TunnelStart,
                ..
            }
        ));
        assert!(ctx.store().load().is_none());
    }

    #[test]
    fn test_extract_endpoint() {
        assert_eq!(
            extract_endpoint(TUNNEL_LOG, "RSD Address:", "RSD Port:"),
            Some(("fd7b:e5b:6f53::1".to_string(), "58783".to_string()))
        );
        assert_eq!(extract_endpoint("RSD Address: 1.2.3.4\n", "RSD Address:", "RSD Port:"), None);
        assert_eq!(extract_endpoint("", "RSD Address:", "RSD Port:"), None);
    }

    #[test]
    fn test_step_errors() {
        assert!(matches!(
            SetupStep::PasscodeCheck.into_error("x".into()),
            OpError::Precondition(_)
        ));
        assert!(matches!(
            SetupStep::DiskMount.into_error("x".into()),
            OpError::ToolError(_)
        ));
    }
}
