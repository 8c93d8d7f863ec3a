//! Platform-independent location operations.
//!
//! Device and platform are optional. A missing device falls back to the
//! device bound to the stored tunnel (always iOS); a missing platform is
//! looked up in the current device list.

use crate::chain::StrategyAttempt;
use crate::commands::OpError;
use crate::context::SimContext;
use crate::devices;
use crate::ios::NO_DEVICE;
use crate::types::{Coordinates, Platform};
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, Serialize)]
pub struct LocationReport {
    pub message: String,
    pub device_id: String,
    pub platform: Platform,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<Coordinates>,
    /// Strategy that succeeded, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    pub attempts: Vec<StrategyAttempt>,
}

/// What a device reports about its own position.
#[derive(Debug, Clone, Serialize)]
pub struct CurrentLocation {
    pub message: String,
    pub device_id: String,
    pub platform: Platform,
    /// Only filled when the device output carried a parseable fix.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<Coordinates>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    pub details: String,
}

/// Resolve the target device and its platform.
pub async fn resolve_target(
    ctx: &SimContext,
    device_id: Option<&str>,
    platform: Option<Platform>,
) -> Result<(String, Platform), OpError> {
    let (device_id, platform) = match device_id.filter(|d| !d.is_empty()) {
        Some(id) => (id.to_string(), platform),
        None => match ctx.store().load() {
            Some(t) => {
                debug!(device_id = %t.device_id, "using device from stored tunnel info");
                (t.device_id, Some(Platform::Ios))
            }
            None => return Err(OpError::Precondition(NO_DEVICE.into())),
        },
    };

    let platform = match platform {
        Some(p) => p,
        None => devices::find_device_platform(ctx, &device_id)
            .await
            .ok_or_else(|| {
                OpError::Precondition(format!(
                    "Could not determine platform for device {}",
                    device_id
                ))
            })?,
    };
    Ok((device_id, platform))
}

/// Coordinates are validated by the caller building [`Coordinates`].
pub async fn set_location(
    ctx: &SimContext,
    coordinates: Coordinates,
    device_id: Option<&str>,
    platform: Option<Platform>,
) -> Result<LocationReport, OpError> {
    let (device_id, platform) = resolve_target(ctx, device_id, platform).await?;
    platform.set_location(ctx, &device_id, coordinates).await
}

pub async fn clear_location(
    ctx: &SimContext,
    device_id: Option<&str>,
    platform: Option<Platform>,
) -> Result<LocationReport, OpError> {
    let (device_id, platform) = resolve_target(ctx, device_id, platform).await?;
    platform.clear_location(ctx, &device_id).await
}

pub async fn current_location(
    ctx: &SimContext,
    device_id: Option<&str>,
    platform: Option<Platform>,
) -> Result<CurrentLocation, OpError> {
    let (device_id, platform) = resolve_target(ctx, device_id, platform).await?;
    platform.current_location(ctx, &device_id).await
}
