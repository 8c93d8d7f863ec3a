//! Device platforms as a closed set of variants sharing one capability
//! surface: list, connect, disconnect, status and location control.

use crate::android;
use crate::commands::OpError;
use crate::context::SimContext;
use crate::ios::{self, Pmd};
use crate::location::{CurrentLocation, LocationReport};
use crate::types::{CommandResult, Coordinates, Device, Platform};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info};

/// Outcome of a connect call, per platform.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ConnectReport {
    Ios(crate::workflow::SetupReport),
    Android(android::AndroidReport),
}

impl ConnectReport {
    pub fn message(&self) -> &str {
        match self {
            ConnectReport::Ios(r) => &r.message,
            ConnectReport::Android(r) => &r.message,
        }
    }
}

impl Platform {
    pub async fn tool_available(&self, ctx: &SimContext) -> bool {
        match self {
            Platform::Ios => ios::tool_available(ctx).await,
            Platform::Android => android::tool_available(ctx).await,
        }
    }

    pub async fn list_devices(&self, ctx: &SimContext) -> Vec<Device> {
        match self {
            Platform::Ios => ios::list_devices(ctx).await,
            Platform::Android => android::list_devices(ctx).await,
        }
    }

    pub async fn connect_device(
        &self,
        ctx: &SimContext,
        device_id: &str,
    ) -> Result<ConnectReport, OpError> {
        match self {
            Platform::Ios => ios::connect(ctx, device_id).await.map(ConnectReport::Ios),
            Platform::Android => {
                let report = android::connect(ctx, device_id).await?;
                if report.ready {
                    Ok(ConnectReport::Android(report))
                } else {
                    Err(OpError::ToolError(report.message))
                }
            }
        }
    }

    pub async fn disconnect_device(&self, ctx: &SimContext) -> Result<(), OpError> {
        match self {
            Platform::Ios => ios::cleanup(ctx).await,
            Platform::Android => {
                android::disconnect().await;
                Ok(())
            }
        }
    }

    pub async fn check_status(&self, ctx: &SimContext, device_id: &str) -> bool {
        match self {
            Platform::Ios => ios::check_status(ctx, device_id).await,
            Platform::Android => android::check_status(ctx, device_id).await,
        }
    }

    pub async fn set_location(
        &self,
        ctx: &SimContext,
        device_id: &str,
        coordinates: Coordinates,
    ) -> Result<LocationReport, OpError> {
        match self {
            Platform::Ios => ios::set_location(ctx, device_id, coordinates).await,
            Platform::Android => android::set_location(ctx, device_id, coordinates).await,
        }
    }

    pub async fn clear_location(
        &self,
        ctx: &SimContext,
        device_id: &str,
    ) -> Result<LocationReport, OpError> {
        match self {
            Platform::Ios => ios::clear_location(ctx, device_id).await,
            Platform::Android => android::clear_location(ctx, device_id).await,
        }
    }

    pub async fn current_location(
        &self,
        ctx: &SimContext,
        device_id: &str,
    ) -> Result<CurrentLocation, OpError> {
        match self {
            Platform::Ios => ios::current_location(device_id),
            Platform::Android => android::current_location(ctx, device_id).await,
        }
    }

    /// Debug helper: a short-lived tunnel on iOS, an adb server restart on
    /// Android.
    pub async fn start_tunnel(&self, ctx: &SimContext) -> CommandResult {
        match self {
            Platform::Ios => ios::start_tunnel(ctx).await,
            Platform::Android => android::restart_server(ctx).await,
        }
    }

    /// Raw tool diagnostics for the status report.
    pub async fn diagnostics(&self, ctx: &SimContext) -> (Value, Value) {
        let timeout = ctx.config.timeouts.command();
        match self {
            Platform::Ios => {
                let pmd = Pmd::new(ctx);
                let devices = ctx.process().execute(&pmd.usbmux_list(), timeout).await;
                let mounts = ctx.process().execute(&pmd.mounter_list(), timeout).await;
                let probe = Coordinates {
                    latitude: 37.7749,
                    longitude: -122.4194,
                };
                let location = ctx
                    .process()
                    .execute(&pmd.dvt_location(None, None, Some(&probe)), timeout)
                    .await;
                (
                    text_or(&devices, "No iOS devices found"),
                    json!({
                        "device_error": error_if_failed(&devices),
                        "mounted_images": text_or(&mounts, "None"),
                        "location_service_test": if location.success { "Available" } else { "Unavailable" },
                        "location_error": error_if_failed(&location),
                    }),
                )
            }
            Platform::Android => {
                let adb = android::Adb::new(ctx);
                let devices = ctx.process().execute(&adb.devices(), timeout).await;
                let version = ctx.process().execute(&adb.version(), timeout).await;
                let first_line = version.output.lines().next().unwrap_or_default();
                (
                    text_or(&devices, "No Android devices found"),
                    json!({
                        "adb_version": if version.success { first_line } else { "Unknown" },
                        "device_error": error_if_failed(&devices),
                    }),
                )
            }
        }
    }
}

fn text_or(r: &CommandResult, fallback: &str) -> Value {
    Value::String(if r.success {
        r.output.clone()
    } else {
        fallback.to_string()
    })
}

fn error_if_failed(r: &CommandResult) -> Value {
    if r.success {
        Value::Null
    } else {
        Value::String(r.error.clone())
    }
}

// ---------------------------------------------------------------------------
// Cross-platform operations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Requirements {
    pub ios: bool,
    pub android: bool,
}

impl Requirements {
    pub fn get(&self, platform: Platform) -> bool {
        match platform {
            Platform::Ios => self.ios,
            Platform::Android => self.android,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceListing {
    pub devices: Vec<Device>,
    pub requirements: Requirements,
    pub output: String,
}

pub async fn check_requirements(ctx: &SimContext) -> Requirements {
    Requirements {
        ios: Platform::Ios.tool_available(ctx).await,
        android: Platform::Android.tool_available(ctx).await,
    }
}

/// Devices on every platform whose tool is installed.
pub async fn list_all_devices(ctx: &SimContext) -> DeviceListing {
    let requirements = check_requirements(ctx).await;
    let mut devices = Vec::new();
    for platform in Platform::ALL {
        if !requirements.get(platform) {
            info!(%platform, "tool not available - skipping detection");
            continue;
        }
        let found = platform.list_devices(ctx).await;
        info!(%platform, count = found.len(), "devices detected");
        devices.extend(found);
    }
    let output = format!("Found {} device(s) total", devices.len());
    DeviceListing {
        devices,
        requirements,
        output,
    }
}

pub async fn find_device_platform(ctx: &SimContext, device_id: &str) -> Option<Platform> {
    list_all_devices(ctx)
        .await
        .devices
        .into_iter()
        .find(|d| d.id == device_id)
        .map(|d| d.platform)
}

pub async fn connect_device(
    ctx: &SimContext,
    device_id: &str,
    platform: Option<Platform>,
) -> Result<ConnectReport, OpError> {
    if device_id.is_empty() {
        return Err(OpError::Precondition(ios::DEVICE_REQUIRED.into()));
    }
    let platform = match platform {
        Some(p) => p,
        None => find_device_platform(ctx, device_id).await.ok_or_else(|| {
            OpError::Precondition(format!(
                "Could not determine platform for device {}",
                device_id
            ))
        })?,
    };
    platform.connect_device(ctx, device_id).await
}

/// Tear down every platform's connections. Failures are logged only.
pub async fn disconnect_all(ctx: &SimContext) {
    info!("cleaning up connections across all platforms");
    for platform in Platform::ALL {
        if let Err(e) = platform.disconnect_device(ctx).await {
            debug!(%platform, error = %e, "cleanup failed");
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub platforms: Requirements,
    pub devices: serde_json::Map<String, Value>,
    pub services: serde_json::Map<String, Value>,
}

pub async fn status(ctx: &SimContext) -> StatusReport {
    let platforms = check_requirements(ctx).await;
    let mut devices = serde_json::Map::new();
    let mut services = serde_json::Map::new();
    for platform in Platform::ALL {
        if !platforms.get(platform) {
            continue;
        }
        let (d, s) = platform.diagnostics(ctx).await;
        devices.insert(platform.to_string(), d);
        services.insert(platform.to_string(), s);
    }
    StatusReport {
        platforms,
        devices,
        services,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fake_context, FakeProcess};

    fn both_tools() -> FakeProcess {
        let fake = FakeProcess::new();
        fake.ok("pymobiledevice3 --help", "usage")
            .ok("usbmux list", r#"[{"Identifier":"IOS1","DeviceName":"Phone"}]"#)
            .ok("adb version", "Android Debug Bridge version 1.0.41\nVersion 34.0.5")
            .ok("adb devices -l", "List of devices attached\nAND1 device model:Pixel_7\n");
        fake
    }

    #[tokio::test]
    async fn test_list_all_devices() {
        let ctx = fake_context(&both_tools());
        let listing = list_all_devices(&ctx).await;
        assert_eq!(listing.requirements, Requirements { ios: true, android: true });
        let ids: Vec<_> = listing.devices.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["IOS1", "AND1"]);
        assert_eq!(listing.output, "Found 2 device(s) total");
    }

    #[tokio::test]
    async fn test_missing_tool_skips_platform() {
        let fake = FakeProcess::new();
        fake.ok("adb version", "Android Debug Bridge")
            .ok("adb devices -l", "List of devices attached\n");
        let ctx = fake_context(&fake);

        let listing = list_all_devices(&ctx).await;
        assert!(!listing.requirements.ios);
        assert!(listing.devices.is_empty());
        assert!(fake.calls_matching("usbmux").is_empty());
    }

    #[tokio::test]
    async fn test_connect_requires_device_id() {
        let ctx = fake_context(&FakeProcess::new());
        let err = connect_device(&ctx, "", None).await.unwrap_err();
        assert_eq!(err.to_string(), ios::DEVICE_REQUIRED);
    }

    #[tokio::test]
    async fn test_disconnect_all_is_idempotent() {
        let fake = FakeProcess::new();
        let ctx = fake_context(&fake);
        disconnect_all(&ctx).await;
        disconnect_all(&ctx).await;
        assert_eq!(fake.calls_matching("lockdown start-tunnel").len(), 2);
    }

    #[tokio::test]
    async fn test_status_reports_available_platforms() {
        let fake = both_tools();
        fake.ok("mounter list", "[]")
            .fail("simulate-location set", "InvalidServiceError");
        let ctx = fake_context(&fake);

        let report = status(&ctx).await;
        assert!(report.platforms.ios && report.platforms.android);
        assert_eq!(report.services["ios"]["location_service_test"], "Unavailable");
        assert_eq!(report.services["ios"]["location_error"], "InvalidServiceError");
        assert_eq!(
            report.services["android"]["adb_version"],
            "Android Debug Bridge version 1.0.41"
        );
    }
}
