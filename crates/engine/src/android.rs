//! Android integration through adb.

use crate::chain::{run_chain, Attempt, LocationRequest, Strategy};
use crate::commands::OpError;
use crate::context::SimContext;
use crate::ios::{DEVICE_REQUIRED, NO_DEVICE};
use crate::location::{CurrentLocation, LocationReport};
use crate::runner::TIMEOUT_MESSAGE;
use crate::traits::CapError;
use crate::types::{CommandResult, Coordinates, Device, Platform, Tool, ToolCommand};
use serde::Serialize;
use tracing::{debug, info, warn};

const SET_EXHAUSTED: &str = "Failed to set location on Android device. Ensure mock location is enabled in Developer Options and a mock location app is selected.";
const CLEAR_ATTEMPTED: &str = "Location clear attempted. You may need to manually disable mock location or restart location services.";
const LOCATION_UNAVAILABLE: &str = "Unable to retrieve current location from Android device";
const ADB_MISSING: &str = "ADB not available. Please install Android SDK platform-tools and ensure ADB is in your PATH.";

// ---------------------------------------------------------------------------
// Command templates
// ---------------------------------------------------------------------------

pub struct Adb<'a> {
    program: &'a str,
}

impl<'a> Adb<'a> {
    pub fn new(ctx: &'a SimContext) -> Self {
        Self {
            program: &ctx.config.android.adb,
        }
    }

    pub fn bare(&self) -> ToolCommand {
        ToolCommand::new(Tool::Adb, self.program)
    }

    pub fn version(&self) -> ToolCommand {
        self.bare().arg("version")
    }

    pub fn devices(&self) -> ToolCommand {
        self.bare().args(["devices", "-l"])
    }

    pub fn get_state(&self, serial: &str) -> ToolCommand {
        self.bare().args(["-s", serial, "get-state"])
    }

    /// `adb -s <serial> shell <args...>`
    pub fn shell<I, S>(&self, serial: &str, args: I) -> ToolCommand
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.bare().args(["-s", serial, "shell"]).args(args)
    }

    pub fn getprop(&self, serial: &str, property: &str) -> ToolCommand {
        self.shell(serial, ["getprop", property])
    }

    pub fn settings_get(&self, serial: &str, namespace: &str, key: &str) -> ToolCommand {
        self.shell(serial, ["settings", "get", namespace, key])
    }

    pub fn broadcast<I, S>(&self, serial: &str, action: &str, extras: I) -> ToolCommand
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.shell(serial, ["am", "broadcast", "-a", action]).args(extras)
    }
}

async fn run(ctx: &SimContext, cmd: &ToolCommand) -> CommandResult {
    ctx.process()
        .execute(cmd, ctx.config.timeouts.command())
        .await
}

/// Trimmed property value. Failed or empty lookups are `None`.
async fn property(ctx: &SimContext, serial: &str, name: &str) -> Option<String> {
    let r = run(ctx, &Adb::new(ctx).getprop(serial, name)).await;
    let value = r.output.trim();
    (r.success && !value.is_empty()).then(|| value.to_string())
}

// ---------------------------------------------------------------------------
// Location strategies
// ---------------------------------------------------------------------------

fn coordinates(req: &LocationRequest) -> Result<&Coordinates, CapError> {
    req.coordinates
        .as_ref()
        .ok_or_else(|| CapError::Other("set strategy invoked without coordinates".into()))
}

/// GPS fix broadcast, then a providers-changed broadcast. Either counts.
pub struct AmBroadcast;

#[async_trait::async_trait]
impl Strategy for AmBroadcast {
    fn name(&self) -> &'static str {
        "AM Broadcast"
    }

    async fn attempt(&self, ctx: &SimContext, req: &LocationRequest) -> Result<Attempt, CapError> {
        let c = coordinates(req)?;
        let (lat, lng) = (c.lat_arg(), c.lng_arg());
        let adb = Adb::new(ctx);
        let fix = run(
            ctx,
            &adb.broadcast(
                &req.device_id,
                "android.location.GPS_FIX_CHANGE",
                ["--ef", "latitude", lat.as_str(), "--ef", "longitude", lng.as_str()],
            ),
        )
        .await;
        let providers = run(
            ctx,
            &adb.broadcast(
                &req.device_id,
                "android.location.PROVIDERS_CHANGED",
                ["--es", "latitude", lat.as_str(), "--es", "longitude", lng.as_str()],
            ),
        )
        .await;
        Ok(Attempt::Ran(any_success(
            [fix, providers],
            "Location broadcast sent",
        )))
    }
}

pub struct MockProvider;

#[async_trait::async_trait]
impl Strategy for MockProvider {
    fn name(&self) -> &'static str {
        "Mock Provider"
    }

    async fn attempt(&self, ctx: &SimContext, req: &LocationRequest) -> Result<Attempt, CapError> {
        let c = coordinates(req)?;
        let (lat, lng) = (c.lat_arg(), c.lng_arg());
        let cmd = Adb::new(ctx).shell(
            &req.device_id,
            [
                "am",
                "instrument",
                "-w",
                "-e",
                "debug",
                "false",
                "-e",
                "latitude",
                lat.as_str(),
                "-e",
                "longitude",
                lng.as_str(),
                "com.android.cts.verifier/com.android.cts.location.MockLocationTestCase",
            ],
        );
        Ok(Attempt::Ran(run(ctx, &cmd).await))
    }
}

/// `service call location` needs system permissions. Exit status alone is
/// not trusted; the reply must contain a parcel.
pub struct ServiceCall;

#[async_trait::async_trait]
impl Strategy for ServiceCall {
    fn name(&self) -> &'static str {
        "Service Call"
    }

    async fn attempt(&self, ctx: &SimContext, req: &LocationRequest) -> Result<Attempt, CapError> {
        let c = coordinates(req)?;
        let now_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default()
            .to_string();
        let (lat, lng) = (c.lat_arg(), c.lng_arg());
        let cmd = Adb::new(ctx).shell(
            &req.device_id,
            [
                "service",
                "call",
                "location",
                "20",
                "s16",
                "gps",
                "i32",
                "1",
                "f",
                lat.as_str(),
                "f",
                lng.as_str(),
                "f",
                "0.0",
                "i64",
                now_ms.as_str(),
            ],
        );
        let mut result = run(ctx, &cmd).await;
        if result.success && !result.output.contains("Result: Parcel") {
            result.success = false;
            result.error = "service call returned no parcel".into();
        }
        Ok(Attempt::Ran(result))
    }
}

/// Store coordinates in system settings and nudge the providers. Both
/// writes must succeed.
pub struct SettingsWrite;

#[async_trait::async_trait]
impl Strategy for SettingsWrite {
    fn name(&self) -> &'static str {
        "Settings"
    }

    async fn attempt(&self, ctx: &SimContext, req: &LocationRequest) -> Result<Attempt, CapError> {
        let c = coordinates(req)?;
        let (lat_arg, lng_arg) = (c.lat_arg(), c.lng_arg());
        let adb = Adb::new(ctx);
        let id = &req.device_id;
        let lat = run(
            ctx,
            &adb.shell(id, ["settings", "put", "system", "mock_location_latitude", lat_arg.as_str()]),
        )
        .await;
        let lng = run(
            ctx,
            &adb.shell(id, ["settings", "put", "system", "mock_location_longitude", lng_arg.as_str()]),
        )
        .await;
        let nudge = run(
            ctx,
            &adb.broadcast(id, "android.location.PROVIDERS_CHANGED", Vec::<String>::new()),
        )
        .await;
        debug!(success = nudge.success, "providers-changed broadcast");

        let result = if !lat.success {
            lat
        } else if !lng.success {
            lng
        } else {
            CommandResult::ok("Location coordinates stored in settings")
        };
        Ok(Attempt::Ran(result))
    }
}

/// Toggle GPS off and on, then notify providers. Any success counts.
pub struct ClearBroadcast;

#[async_trait::async_trait]
impl Strategy for ClearBroadcast {
    fn name(&self) -> &'static str {
        "Broadcast"
    }

    async fn attempt(&self, ctx: &SimContext, req: &LocationRequest) -> Result<Attempt, CapError> {
        let adb = Adb::new(ctx);
        let id = &req.device_id;
        let off = run(
            ctx,
            &adb.broadcast(id, "android.location.GPS_ENABLED_CHANGE", ["--ez", "enabled", "false"]),
        )
        .await;
        let on = run(
            ctx,
            &adb.broadcast(id, "android.location.GPS_ENABLED_CHANGE", ["--ez", "enabled", "true"]),
        )
        .await;
        let providers = run(
            ctx,
            &adb.broadcast(id, "android.location.PROVIDERS_CHANGED", Vec::<String>::new()),
        )
        .await;
        Ok(Attempt::Ran(any_success(
            [off, on, providers],
            "Location simulation cleared via broadcast",
        )))
    }
}

pub struct ClearSettings;

#[async_trait::async_trait]
impl Strategy for ClearSettings {
    fn name(&self) -> &'static str {
        "Settings"
    }

    async fn attempt(&self, ctx: &SimContext, req: &LocationRequest) -> Result<Attempt, CapError> {
        let adb = Adb::new(ctx);
        let id = &req.device_id;
        let lat = run(
            ctx,
            &adb.shell(id, ["settings", "delete", "system", "mock_location_latitude"]),
        )
        .await;
        let lng = run(
            ctx,
            &adb.shell(id, ["settings", "delete", "system", "mock_location_longitude"]),
        )
        .await;
        let app = run(
            ctx,
            &adb.shell(id, ["settings", "delete", "secure", "mock_location_app"]),
        )
        .await;
        debug!(success = app.success, "mock location app reset");
        Ok(Attempt::Ran(any_success(
            [lat, lng],
            "Location simulation settings cleared",
        )))
    }
}

/// Success if any result succeeded, else the last failure.
fn any_success<const N: usize>(results: [CommandResult; N], message: &str) -> CommandResult {
    if results.iter().any(|r| r.success) {
        return CommandResult::ok(message);
    }
    results
        .into_iter()
        .last()
        .unwrap_or_else(|| CommandResult::failure("no command issued"))
}

pub fn set_chain() -> Vec<Box<dyn Strategy>> {
    vec![
        Box::new(AmBroadcast),
        Box::new(MockProvider),
        Box::new(ServiceCall),
        Box::new(SettingsWrite),
    ]
}

pub fn clear_chain() -> Vec<Box<dyn Strategy>> {
    vec![Box::new(ClearBroadcast), Box::new(ClearSettings)]
}

fn method_suffix(method: Option<&str>) -> &'static str {
    match method {
        Some("AM Broadcast") => " via broadcast",
        Some("Mock Provider") => " via mock provider",
        Some("Service Call") => " via service call",
        Some("Settings") => " via settings",
        _ => "",
    }
}

pub async fn set_location(
    ctx: &SimContext,
    device_id: &str,
    coordinates: Coordinates,
) -> Result<LocationReport, OpError> {
    if device_id.is_empty() {
        return Err(OpError::Precondition(NO_DEVICE.into()));
    }
    info!(device_id, %coordinates, "setting Android location");
    let req = LocationRequest::set(device_id, coordinates);
    let chain = set_chain();
    let out = run_chain(&chain, ctx, &req, |_| CommandResult::failure(SET_EXHAUSTED)).await;
    if !out.result.success {
        return Err(OpError::ChainExhausted(out.result.error));
    }
    Ok(LocationReport {
        message: format!(
            "Location set to {}{}",
            coordinates,
            method_suffix(out.method)
        ),
        device_id: req.device_id,
        platform: Platform::Android,
        coordinates: Some(coordinates),
        method: out.method.map(String::from),
        attempts: out.attempts,
    })
}

/// Clearing is best effort: an exhausted chain still succeeds, with a
/// hint that manual action may be needed.
pub async fn clear_location(ctx: &SimContext, device_id: &str) -> Result<LocationReport, OpError> {
    if device_id.is_empty() {
        return Err(OpError::Precondition(NO_DEVICE.into()));
    }
    info!(device_id, "clearing Android location simulation");
    let req = LocationRequest::clear(device_id);
    let chain = clear_chain();
    let out = run_chain(&chain, ctx, &req, |_| {
        warn!("all clear methods failed - often normal on Android");
        CommandResult::ok(CLEAR_ATTEMPTED)
    })
    .await;
    Ok(LocationReport {
        message: out.result.output,
        device_id: req.device_id,
        platform: Platform::Android,
        coordinates: None,
        method: out.method.map(String::from),
        attempts: out.attempts,
    })
}

// ---------------------------------------------------------------------------
// Current location
// ---------------------------------------------------------------------------

/// Read what the location service reports through `dumpsys location`.
///
/// Succeeds when the dump mentions a last location or the GPS provider.
/// Coordinates are filled only when a `Location[...]` fix can be parsed.
pub async fn current_location(ctx: &SimContext, device_id: &str) -> Result<CurrentLocation, OpError> {
    if device_id.is_empty() {
        return Err(OpError::Precondition(NO_DEVICE.into()));
    }
    let dumpsys = run(ctx, &Adb::new(ctx).shell(device_id, ["dumpsys", "location"])).await;
    if !dumpsys.success {
        warn!(device_id, error = %dumpsys.error_or_unknown(), "dumpsys location failed");
        if dumpsys.error == TIMEOUT_MESSAGE {
            return Err(OpError::from_tool(&dumpsys));
        }
        return Err(OpError::ToolError(LOCATION_UNAVAILABLE.into()));
    }

    let lowered = dumpsys.output.to_lowercase();
    if !(lowered.contains("last location") || lowered.contains("gps")) {
        return Err(OpError::ToolError(LOCATION_UNAVAILABLE.into()));
    }

    let fix = parse_last_fix(&dumpsys.output);
    debug!(device_id, fix = ?fix, "location service dump read");
    let (message, details, provider, coordinates) = match fix {
        Some((provider, c)) => (
            format!("Last known location {} via {}", c, provider),
            "Reported by the Android location service".to_string(),
            Some(provider),
            Some(c),
        ),
        None => (
            "Location services active".to_string(),
            "Check device location settings for current coordinates".to_string(),
            None,
            None,
        ),
    };
    Ok(CurrentLocation {
        message,
        device_id: device_id.to_string(),
        platform: Platform::Android,
        coordinates,
        provider,
        details,
    })
}

/// First `Location[<provider> <lat>,<lng> ...]` entry with valid coordinates.
fn parse_last_fix(dump: &str) -> Option<(String, Coordinates)> {
    dump.split("Location[").skip(1).find_map(|entry| {
        let mut fields = entry.split_whitespace();
        let provider = fields.next()?;
        let (lat, lng) = fields.next()?.trim_end_matches(']').split_once(',')?;
        let c = Coordinates::parse(lat, lng).ok()?;
        Some((provider.to_string(), c))
    })
}

// ---------------------------------------------------------------------------
// Connect
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AndroidReport {
    pub message: String,
    /// Best-effort readiness of the device for mock locations.
    pub ready: bool,
    pub model: String,
    pub android_version: String,
    pub developer_options: String,
    pub mock_location: String,
    pub location_services: String,
    pub device_id: String,
    pub platform: Platform,
}

pub async fn tool_available(ctx: &SimContext) -> bool {
    ctx.process()
        .execute(&Adb::new(ctx).version(), ctx.config.timeouts.probe())
        .await
        .success
}

pub async fn check_status(ctx: &SimContext, device_id: &str) -> bool {
    let r = run(ctx, &Adb::new(ctx).get_state(device_id)).await;
    r.success && r.output.contains("device")
}

pub async fn connect(ctx: &SimContext, device_id: &str) -> Result<AndroidReport, OpError> {
    if device_id.is_empty() {
        return Err(OpError::Precondition(DEVICE_REQUIRED.into()));
    }
    info!(device_id, "connecting to Android device");
    let adb = Adb::new(ctx);

    if !tool_available(ctx).await {
        return Err(OpError::Precondition(ADB_MISSING.into()));
    }
    if !check_status(ctx, device_id).await {
        return Err(OpError::Precondition(format!(
            "Device {} not found or not accessible. Please ensure USB debugging is enabled and device is authorized.",
            device_id
        )));
    }

    let echo = run(ctx, &adb.shell(device_id, ["echo", "test"])).await;
    if !(echo.success && echo.output.contains("test")) {
        return Err(OpError::Precondition(
            "USB debugging not working. Please enable Developer Options and USB Debugging, then authorize this computer on your device.".into(),
        ));
    }

    // Developer options
    let debuggable = property(ctx, device_id, "ro.debuggable").await;
    let dev_settings = run(
        ctx,
        &adb.settings_get(device_id, "global", "development_settings_enabled"),
    )
    .await;
    let settings_enabled = dev_settings.output.trim() == "1";
    info!(debuggable = ?debuggable, settings_enabled, "developer options check");
    if !settings_enabled {
        warn!("developer options may not be properly enabled");
    }

    // Mock location
    let mock_app = run(ctx, &adb.settings_get(device_id, "secure", "mock_location_app")).await;
    let mock_flag = run(ctx, &adb.settings_get(device_id, "secure", "mock_location")).await;
    let mock_configured = mock_setting_active(&mock_app, &mock_flag);
    debug!(
        mock_location_app = %mock_app.output.trim(),
        mock_location = %mock_flag.output.trim(),
        mock_configured,
        "mock location settings"
    );
    let mock_enabled = enable_mock_location(ctx, device_id).await;

    // Location services
    let providers = run(
        ctx,
        &adb.settings_get(device_id, "secure", "location_providers_allowed"),
    )
    .await;
    let dumpsys = run(ctx, &adb.shell(device_id, ["dumpsys", "location"])).await;
    let gps_available = dumpsys.output.to_lowercase().contains("gps");

    let model = property(ctx, device_id, "ro.product.model")
        .await
        .unwrap_or_else(|| "Unknown Android Device".into());
    let android_version = property(ctx, device_id, "ro.build.version.release")
        .await
        .unwrap_or_else(|| "Unknown".into());

    let ready = dev_settings.success && providers.success && (mock_enabled || mock_configured);

    let mut message = if ready {
        format!(
            "Android device {} (Android {}) prepared for location testing.",
            model, android_version
        )
    } else {
        format!(
            "Android device {} (Android {}) could not be fully prepared for location testing.",
            model, android_version
        )
    };
    if !mock_enabled {
        message.push_str(
            " Note: Mock location may need manual setup in Settings > Developer Options > Mock Location App.",
        );
    }
    info!(device_id, ready, "Android device setup completed");

    Ok(AndroidReport {
        message,
        ready,
        model,
        android_version,
        developer_options: if settings_enabled { "enabled" } else { "check manually" }.into(),
        mock_location: if mock_enabled || mock_configured {
            "configured"
        } else {
            "needs manual setup"
        }
        .into(),
        location_services: if gps_available { "available" } else { "check manually" }.into(),
        device_id: device_id.to_string(),
        platform: Platform::Android,
    })
}

/// A selected mock app or the legacy `mock_location=1` flag. adb prints
/// `null` for unset keys, which counts as not configured.
fn mock_setting_active(app: &CommandResult, flag: &CommandResult) -> bool {
    let app_name = app.output.trim();
    let app_selected = app.success && !app_name.is_empty() && app_name != "null";
    let flag_on = flag.success && flag.output.trim() == "1";
    app_selected || flag_on
}

/// Three independent attempts; any one succeeding is enough.
async fn enable_mock_location(ctx: &SimContext, device_id: &str) -> bool {
    let adb = Adb::new(ctx);
    let shell_app = run(
        ctx,
        &adb.shell(
            device_id,
            ["settings", "put", "secure", "mock_location_app", "com.android.shell"],
        ),
    )
    .await;
    let appops = run(
        ctx,
        &adb.shell(
            device_id,
            ["appops", "set", "com.android.shell", "android:mock_location", "allow"],
        ),
    )
    .await;
    let global = run(
        ctx,
        &adb.shell(device_id, ["settings", "put", "secure", "mock_location", "1"]),
    )
    .await;

    let ok = shell_app.success || appops.success || global.success;
    if ok {
        info!(
            shell_app = shell_app.success,
            appops = appops.success,
            global = global.success,
            "mock location setup completed"
        );
    } else {
        warn!("failed to enable mock location - manual setup may be required");
    }
    ok
}

/// Nothing persistent to tear down.
pub async fn disconnect() {
    info!("Android cleanup completed");
}

/// Debug helper: restart the adb server.
pub async fn restart_server(ctx: &SimContext) -> CommandResult {
    let adb = Adb::new(ctx);
    let kill = run(ctx, &adb.bare().arg("kill-server")).await;
    if !kill.success {
        return kill;
    }
    run(ctx, &adb.bare().arg("start-server")).await
}

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

pub async fn list_devices(ctx: &SimContext) -> Vec<Device> {
    let r = ctx
        .process()
        .execute(&Adb::new(ctx).devices(), ctx.config.timeouts.probe())
        .await;
    if !r.success {
        debug!(error = %r.error, "Android detection failed");
        return Vec::new();
    }
    parse_devices(&r.output)
}

/// Parse `adb devices -l`. Only entries in the `device` state count.
pub fn parse_devices(output: &str) -> Vec<Device> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 2 || parts[1] != "device" {
                return None;
            }
            let name = parts[2..]
                .iter()
                .find_map(|p| p.strip_prefix("model:"))
                .map(|m| m.replace('_', " "))
                .unwrap_or_else(|| "Android Device".into());
            Some(Device {
                id: parts[0].to_string(),
                name,
                platform: Platform::Android,
                connection_type: "usb".into(),
                status: "available".into(),
            })
        })
        .collect()
}
