//! Doctor – environment facts relevant to driving devices.

use crate::context::SimContext;
use crate::devices::{self, Requirements};
use crate::types::{current_os, Tool, ToolCommand};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize)]
pub struct DoctorReport {
    pub os_name: String,
    pub os_version: String,
    pub kernel: String,
    pub arch: String,
    pub scratch_dir: String,
    pub scratch_writable: bool,
    pub tools: Requirements,
    pub ios_tool: String,
    pub android_tool: String,
}

pub async fn gather_report(ctx: &SimContext) -> DoctorReport {
    let scratch = &ctx.config.tunnel.scratch_dir;
    let tools = devices::check_requirements(ctx).await;
    DoctorReport {
        os_name: current_os().to_string(),
        os_version: os_version(ctx).await,
        kernel: system_query(ctx, "uname", &["-r"]).await,
        arch: std::env::consts::ARCH.to_string(),
        scratch_dir: scratch.display().to_string(),
        scratch_writable: is_writable(scratch).await,
        tools,
        ios_tool: ctx.config.ios.tool.join(" "),
        android_tool: ctx.config.android.adb.clone(),
    }
}

async fn os_version(ctx: &SimContext) -> String {
    if cfg!(target_os = "macos") {
        return system_query(ctx, "sw_vers", &["-productVersion"]).await;
    }
    match tokio::fs::read_to_string("/etc/os-release").await {
        Ok(content) => content
            .lines()
            .find_map(|l| l.strip_prefix("PRETTY_NAME="))
            .map(|v| v.trim_matches('"').to_string())
            .unwrap_or_else(|| "unknown".into()),
        Err(_) => "unknown".into(),
    }
}

async fn system_query(ctx: &SimContext, program: &str, args: &[&str]) -> String {
    let cmd = ToolCommand::new(Tool::System, program).args(args.iter().copied());
    let result = ctx.process().execute(&cmd, Duration::from_secs(5)).await;
    if result.success {
        result.output.trim().to_string()
    } else {
        "unknown".into()
    }
}

/// Create the directory if needed and round-trip a probe file.
async fn is_writable(dir: &Path) -> bool {
    if tokio::fs::create_dir_all(dir).await.is_err() {
        return false;
    }
    let probe = dir.join(".locsim_doctor_probe");
    let ok = tokio::fs::write(&probe, b"ok").await.is_ok();
    let _ = tokio::fs::remove_file(&probe).await;
    ok
}
