//! iOS integration through pymobiledevice3.

use crate::chain::{self, run_chain, Attempt, LocationRequest, Strategy};
use crate::commands::OpError;
use crate::context::SimContext;
use crate::location::{CurrentLocation, LocationReport};
use crate::traits::CapError;
use crate::types::{CommandResult, Coordinates, Device, Platform, Tool, ToolCommand};
use crate::workflow::{SetupReport, SetupState, SetupWorkflow};
use serde_json::Value;
use tracing::{debug, info, warn};

pub const NO_DEVICE: &str = "No device connected. Please connect a device first.";
pub const DEVICE_REQUIRED: &str = "Device ID is required. Please select a device first.";

const SERVICE_UNAVAILABLE: &str = "Location service unavailable. Try: 1) Click \"Connect & Setup\" again, 2) Ensure iPhone passcode is disabled, 3) Restart your iPhone if needed.";
const DISK_IMAGE_MISSING: &str = "DeveloperDiskImage not mounted. Click \"Connect & Setup\" first.";

// ---------------------------------------------------------------------------
// Command templates
// ---------------------------------------------------------------------------

/// Builds pymobiledevice3 invocations from the configured prefix.
pub struct Pmd<'a> {
    prefix: &'a [String],
}

impl<'a> Pmd<'a> {
    pub fn new(ctx: &'a SimContext) -> Self {
        Self {
            prefix: &ctx.config.ios.tool,
        }
    }

    fn base(&self) -> ToolCommand {
        ToolCommand::from_prefix(Tool::Mobiledevice, self.prefix)
    }

    pub fn help(&self) -> ToolCommand {
        self.base().arg("--help")
    }

    pub fn usbmux_list(&self) -> ToolCommand {
        self.base().args(["usbmux", "list"])
    }

    pub fn lockdown_info(&self, udid: &str) -> ToolCommand {
        self.base().args(["lockdown", "info", "--udid", udid])
    }

    pub fn developer_mode_status(&self, udid: &str) -> ToolCommand {
        self.base()
            .args(["amfi", "developer-mode-status", "--udid", udid])
    }

    pub fn enable_developer_mode(&self, udid: &str) -> ToolCommand {
        self.base()
            .args(["amfi", "enable-developer-mode", "--udid", udid])
    }

    pub fn auto_mount(&self, udid: &str) -> ToolCommand {
        self.base().args(["mounter", "auto-mount", "--udid", udid])
    }

    pub fn mounter_list(&self) -> ToolCommand {
        self.base().args(["mounter", "list"])
    }

    pub fn start_tunnel(&self, udid: Option<&str>) -> ToolCommand {
        let cmd = self.base().args(["lockdown", "start-tunnel"]);
        match udid {
            Some(id) => cmd.args(["--udid", id]),
            None => cmd,
        }
    }

    /// `developer dvt simulate-location <action>` with optional RSD endpoint.
    pub fn dvt_location(
        &self,
        udid: Option<&str>,
        rsd: Option<(&str, &str)>,
        coordinates: Option<&Coordinates>,
    ) -> ToolCommand {
        let cmd = self
            .base()
            .args(["developer", "dvt", "simulate-location"]);
        location_args(cmd, udid, rsd, coordinates)
    }

    /// Pre-DVT `developer simulate-location <action>`.
    pub fn legacy_location(&self, udid: &str, coordinates: Option<&Coordinates>) -> ToolCommand {
        let cmd = self.base().args(["developer", "simulate-location"]);
        location_args(cmd, Some(udid), None, coordinates)
    }
}

fn location_args(
    cmd: ToolCommand,
    udid: Option<&str>,
    rsd: Option<(&str, &str)>,
    coordinates: Option<&Coordinates>,
) -> ToolCommand {
    let mut cmd = cmd.arg(if coordinates.is_some() { "set" } else { "clear" });
    if let Some((address, port)) = rsd {
        cmd = cmd.args(["--rsd", address, port]);
    }
    if let Some(id) = udid {
        cmd = cmd.args(["--udid", id]);
    }
    // `--` keeps negative coordinates from parsing as flags.
    if let Some(c) = coordinates {
        cmd = cmd.arg("--").arg(c.lat_arg()).arg(c.lng_arg());
    }
    cmd
}

// ---------------------------------------------------------------------------
// Location strategies
// ---------------------------------------------------------------------------

/// Issue a set command `repeats` times; the last result counts. Clear
/// commands go out once.
async fn send_repeated(ctx: &SimContext, cmd: &ToolCommand, is_set: bool) -> CommandResult {
    let repeats = if is_set {
        ctx.config.location.set_repeats.max(1)
    } else {
        1
    };
    let timeout = ctx.config.timeouts.command();
    let mut result = CommandResult::failure("command not sent");
    for _ in 0..repeats {
        result = ctx.process().execute(cmd, timeout).await;
    }
    result
}

/// Through the RSD endpoint of an established tunnel. These invocations
/// hold the connection open, so they go through the tunnel monitor.
pub struct TunnelStrategy;

#[async_trait::async_trait]
impl Strategy for TunnelStrategy {
    fn name(&self) -> &'static str {
        "Tunnel"
    }

    async fn attempt(&self, ctx: &SimContext, req: &LocationRequest) -> Result<Attempt, CapError> {
        let Some((address, port)) = req.tunnel.as_ref().and_then(|t| t.endpoint()) else {
            return Ok(Attempt::NotApplicable);
        };
        info!(device_id = %req.device_id, address, port, "using tunnel connection");
        let cmd = Pmd::new(ctx).dvt_location(
            Some(&req.device_id),
            Some((address, port)),
            req.coordinates.as_ref(),
        );
        let repeats = if req.coordinates.is_some() {
            ctx.config.location.set_repeats.max(1)
        } else {
            1
        };
        let mut result = CommandResult::failure("command not sent");
        for _ in 0..repeats {
            result = ctx.process().run_tunnel(&cmd).await;
        }
        Ok(Attempt::Ran(result))
    }
}

/// DVT instrument service without a tunnel.
pub struct DvtStrategy;

#[async_trait::async_trait]
impl Strategy for DvtStrategy {
    fn name(&self) -> &'static str {
        "DVT"
    }

    async fn attempt(&self, ctx: &SimContext, req: &LocationRequest) -> Result<Attempt, CapError> {
        let cmd = Pmd::new(ctx).dvt_location(Some(&req.device_id), None, req.coordinates.as_ref());
        Ok(Attempt::Ran(
            send_repeated(ctx, &cmd, req.coordinates.is_some()).await,
        ))
    }
}

pub struct LegacyStrategy;

#[async_trait::async_trait]
impl Strategy for LegacyStrategy {
    fn name(&self) -> &'static str {
        "Legacy"
    }

    async fn attempt(&self, ctx: &SimContext, req: &LocationRequest) -> Result<Attempt, CapError> {
        let cmd = Pmd::new(ctx).legacy_location(&req.device_id, req.coordinates.as_ref());
        Ok(Attempt::Ran(
            send_repeated(ctx, &cmd, req.coordinates.is_some()).await,
        ))
    }
}

/// Preference order for both set and clear.
pub fn location_chain() -> Vec<Box<dyn Strategy>> {
    vec![
        Box::new(TunnelStrategy),
        Box::new(DvtStrategy),
        Box::new(LegacyStrategy),
    ]
}

/// Rewrite known tool errors into remediation text.
pub fn remediate(error: &str) -> String {
    if error.contains("InvalidServiceError") {
        SERVICE_UNAVAILABLE.to_string()
    } else if error.contains("DeveloperDiskImage") {
        DISK_IMAGE_MISSING.to_string()
    } else {
        error.to_string()
    }
}

/// The stored tunnel wins over a mismatching requested device.
fn bind_request(ctx: &SimContext, device_id: &str, coordinates: Option<Coordinates>) -> LocationRequest {
    let tunnel = ctx.store().load();
    let mut device_id = device_id.to_string();
    if let Some(t) = &tunnel {
        if t.device_id != device_id {
            warn!(requested = %device_id, stored = %t.device_id, "device id mismatch - using stored id");
            device_id = t.device_id.clone();
        }
    }
    let req = match coordinates {
        Some(c) => LocationRequest::set(device_id, c),
        None => LocationRequest::clear(device_id),
    };
    req.with_tunnel(tunnel)
}

pub async fn set_location(
    ctx: &SimContext,
    device_id: &str,
    coordinates: Coordinates,
) -> Result<LocationReport, OpError> {
    if device_id.is_empty() {
        return Err(OpError::Precondition(NO_DEVICE.into()));
    }
    let req = bind_request(ctx, device_id, Some(coordinates));
    let chain = location_chain();
    let out = run_chain(&chain, ctx, &req, |attempts| {
        let error = chain::last_failure(attempts)
            .map(|r| r.error_or_unknown().to_string())
            .unwrap_or_else(|| "Unknown error".to_string());
        CommandResult::failure(format!("Failed to set location: {}", remediate(&error)))
    })
    .await;

    if !out.result.success {
        return Err(OpError::ChainExhausted(out.result.error));
    }
    let via = if out.method == Some("Tunnel") {
        " via tunnel"
    } else {
        ""
    };
    info!(device_id = %req.device_id, %coordinates, method = ?out.method, "location set");
    Ok(LocationReport {
        message: format!("Location set to {}{}", coordinates, via),
        device_id: req.device_id,
        platform: Platform::Ios,
        coordinates: Some(coordinates),
        method: out.method.map(String::from),
        attempts: out.attempts,
    })
}

pub async fn clear_location(ctx: &SimContext, device_id: &str) -> Result<LocationReport, OpError> {
    if device_id.is_empty() {
        return Err(OpError::Precondition(NO_DEVICE.into()));
    }
    let req = bind_request(ctx, device_id, None);
    let chain = location_chain();
    let out = run_chain(&chain, ctx, &req, |attempts| {
        let error = chain::last_failure(attempts)
            .map(|r| r.error_or_unknown().to_string())
            .unwrap_or_else(|| "Unknown error".to_string());
        CommandResult::failure(format!("Failed to clear location: {}", remediate(&error)))
    })
    .await;

    if !out.result.success {
        return Err(OpError::ChainExhausted(out.result.error));
    }
    let via = if out.method == Some("Tunnel") {
        " via tunnel"
    } else {
        ""
    };
    Ok(LocationReport {
        message: format!("Location simulation cleared{}", via),
        device_id: req.device_id,
        platform: Platform::Ios,
        coordinates: None,
        method: out.method.map(String::from),
        attempts: out.attempts,
    })
}

// ---------------------------------------------------------------------------
// Connection lifecycle
// ---------------------------------------------------------------------------

/// Kill detached tunnels and drop their scratch files. Safe to call when
/// nothing is running. Every step is attempted; the first error is returned.
pub async fn cleanup(ctx: &SimContext) -> Result<(), OpError> {
    info!("cleaning up existing iOS connections");
    let mut first_err: Option<OpError> = None;

    if let Err(e) = ctx
        .process()
        .kill_matching(&ctx.config.tunnel.process_pattern)
        .await
    {
        warn!(error = %e, "failed to kill tunnel processes");
        first_err.get_or_insert(e.into());
    }

    if let Err(e) = ctx.store().clear() {
        warn!(error = %e, "failed to clear tunnel info");
        first_err.get_or_insert(e.into());
    }

    let log = ctx.config.tunnel.log_path();
    match tokio::fs::remove_file(&log).await {
        Ok(()) => debug!(path = %log.display(), "tunnel log removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            warn!(path = %log.display(), error = %e, "failed to remove tunnel log");
            first_err.get_or_insert(e.into());
        }
    }

    tokio::time::sleep(ctx.config.tunnel.cleanup_settle()).await;

    match first_err {
        Some(e) => Err(e),
        None => {
            info!("iOS cleanup completed");
            Ok(())
        }
    }
}

pub async fn connect(ctx: &SimContext, device_id: &str) -> Result<SetupReport, OpError> {
    if device_id.is_empty() {
        return Err(OpError::Precondition(DEVICE_REQUIRED.into()));
    }
    info!(device_id, "connecting to iOS device");

    // A new connect always supersedes the previous tunnel.
    if let Err(e) = cleanup(ctx).await {
        warn!(error = %e, "cleanup before connect failed - continuing");
    }

    match SetupWorkflow::new(ctx, device_id).run().await {
        SetupState::Ready(report) => Ok(report),
        SetupState::Failed { step, reason } => Err(step.into_error(reason)),
        other => Err(OpError::Internal(format!(
            "setup stopped in unexpected state {:?}",
            other
        ))),
    }
}

pub async fn check_status(ctx: &SimContext, device_id: &str) -> bool {
    ctx.process()
        .execute(&Pmd::new(ctx).lockdown_info(device_id), ctx.config.timeouts.command())
        .await
        .success
}

pub async fn tool_available(ctx: &SimContext) -> bool {
    ctx.process()
        .execute(&Pmd::new(ctx).help(), ctx.config.timeouts.probe())
        .await
        .success
}

/// Debug helper: run `lockdown start-tunnel` briefly to surface its output.
pub async fn start_tunnel(ctx: &SimContext) -> CommandResult {
    ctx.process()
        .execute(&Pmd::new(ctx).start_tunnel(None), ctx.config.timeouts.start_tunnel())
        .await
}

/// pymobiledevice3 has no query for the simulated or real position.
pub fn current_location(device_id: &str) -> Result<CurrentLocation, OpError> {
    debug!(device_id, "current location requested on iOS");
    Err(OpError::Unsupported(
        "Getting current location not implemented for iOS".into(),
    ))
}

// ---------------------------------------------------------------------------
// Device listing and metadata
// ---------------------------------------------------------------------------

pub async fn list_devices(ctx: &SimContext) -> Vec<Device> {
    let result = ctx
        .process()
        .execute(&Pmd::new(ctx).usbmux_list(), ctx.config.timeouts.probe())
        .await;
    if !result.success || result.output.trim().is_empty() {
        debug!(error = %result.error, "iOS detection found nothing");
        return Vec::new();
    }
    parse_usbmux(&result.output)
}

/// `usbmux list` prints a JSON object or array. Older releases print
/// `key: value` blocks separated by blank lines.
pub fn parse_usbmux(output: &str) -> Vec<Device> {
    match serde_json::from_str::<Value>(output) {
        Ok(Value::Array(items)) => items.iter().filter_map(device_from_json).collect(),
        Ok(obj @ Value::Object(_)) => device_from_json(&obj).into_iter().collect(),
        _ => {
            debug!("usbmux output is not JSON - falling back to text parsing");
            parse_usbmux_text(output)
        }
    }
}

fn device_from_json(v: &Value) -> Option<Device> {
    let obj = v.as_object()?;
    let text = |k: &str| obj.get(k).and_then(Value::as_str).map(str::to_string);
    Some(ios_device(
        text("Identifier")
            .or_else(|| text("UniqueDeviceID"))
            .unwrap_or_else(|| "unknown".into()),
        text("DeviceName"),
        text("ConnectionType"),
    ))
}

fn parse_usbmux_text(output: &str) -> Vec<Device> {
    let mut devices = Vec::new();
    let mut fields: Vec<(String, String)> = Vec::new();

    let mut flush = |fields: &mut Vec<(String, String)>| {
        let get = |k: &str| {
            fields
                .iter()
                .find(|(key, _)| key == k)
                .map(|(_, v)| v.clone())
        };
        if let Some(id) = get("Identifier") {
            devices.push(ios_device(id, get("DeviceName"), get("ConnectionType")));
        }
        fields.clear();
    };

    for line in output.lines().map(str::trim) {
        if line.is_empty() {
            flush(&mut fields);
        } else if let Some((k, v)) = line.split_once(':') {
            fields.push((k.trim().to_string(), v.trim().to_string()));
        }
    }
    flush(&mut fields);
    devices
}

fn ios_device(id: String, name: Option<String>, connection: Option<String>) -> Device {
    Device {
        id,
        name: name.unwrap_or_else(|| "iOS Device".into()),
        platform: Platform::Ios,
        connection_type: connection.unwrap_or_else(|| "usb".into()).to_lowercase(),
        status: "available".into(),
    }
}

const MODEL_NAMES: &[(&str, &str)] = &[
    ("iPhone12,1", "iPhone 11"),
    ("iPhone12,3", "iPhone 11 Pro"),
    ("iPhone12,5", "iPhone 11 Pro Max"),
    ("iPhone12,8", "iPhone SE (2nd gen)"),
    ("iPhone13,1", "iPhone 12 mini"),
    ("iPhone13,2", "iPhone 12"),
    ("iPhone13,3", "iPhone 12 Pro"),
    ("iPhone13,4", "iPhone 12 Pro Max"),
    ("iPhone14,2", "iPhone 13 mini"),
    ("iPhone14,3", "iPhone 13"),
    ("iPhone14,4", "iPhone 13 Pro"),
    ("iPhone14,5", "iPhone 13 Pro Max"),
    ("iPhone14,6", "iPhone SE (3rd gen)"),
    ("iPhone14,7", "iPhone 14"),
    ("iPhone14,8", "iPhone 14 Plus"),
    ("iPhone15,2", "iPhone 14 Pro"),
    ("iPhone15,3", "iPhone 14 Pro Max"),
    ("iPhone15,4", "iPhone 15"),
    ("iPhone15,5", "iPhone 15 Plus"),
    ("iPhone16,1", "iPhone 15 Pro"),
    ("iPhone16,2", "iPhone 15 Pro Max"),
];

pub fn model_name(product_type: &str) -> &'static str {
    MODEL_NAMES
        .iter()
        .find(|(p, _)| *p == product_type)
        .map(|(_, name)| *name)
        .unwrap_or("iPhone")
}

/// Metadata pulled from `lockdown info` JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub ios_version: String,
    pub build_version: String,
    pub model: String,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            ios_version: "Unknown".into(),
            build_version: "Unknown".into(),
            model: "iPhone".into(),
        }
    }
}

impl DeviceInfo {
    pub fn from_lockdown(info: &Value) -> Self {
        let text = |k: &str| {
            info.get(k)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
        };
        let model = text("DeviceName")
            .map(str::to_string)
            .unwrap_or_else(|| model_name(text("ProductType").unwrap_or_default()).to_string());
        Self {
            ios_version: text("ProductVersion").unwrap_or("Unknown").to_string(),
            build_version: text("BuildVersion").unwrap_or("Unknown").to_string(),
            model,
        }
    }
}
