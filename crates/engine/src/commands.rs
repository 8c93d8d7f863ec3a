//! Command registry and the user-facing operations.
//!
//! Commands are registered by name and invoked with JSON input/output.
//! Every invocation returns an [`OperationResult`] envelope.

use crate::context::SimContext;
use crate::devices;
use crate::doctor;
use crate::location;
use crate::runner::TIMEOUT_MESSAGE;
use crate::traits::CapError;
use crate::types::*;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Instant;

pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<Value, OpError>> + Send + 'a>>;

/// Signature for all engine commands.
pub type CommandHandler = for<'a> fn(Value, &'a SimContext) -> HandlerFuture<'a>;

/// Operation-level failures. Messages are user-facing.
#[derive(Debug, thiserror::Error)]
pub enum OpError {
    #[error("{0}")]
    InvalidInput(String),
    #[error("{0}")]
    Precondition(String),
    #[error("{0}")]
    Timeout(String),
    #[error("{0}")]
    SpawnFailure(String),
    #[error("{0}")]
    ToolError(String),
    #[error("{0}")]
    ChainExhausted(String),
    #[error("{0}")]
    Unsupported(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Internal(String),
}

impl OpError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            OpError::InvalidInput(_) => ErrorCode::InvalidInput,
            OpError::Precondition(_) => ErrorCode::PreconditionFailed,
            OpError::Timeout(_) => ErrorCode::Timeout,
            OpError::SpawnFailure(_) => ErrorCode::SpawnFailure,
            OpError::ToolError(_) => ErrorCode::ToolError,
            OpError::ChainExhausted(_) => ErrorCode::ChainExhausted,
            OpError::Unsupported(_) => ErrorCode::Unsupported,
            OpError::Io(_) => ErrorCode::IoError,
            OpError::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Classify a failed tool invocation.
    pub fn from_tool(result: &CommandResult) -> Self {
        if result.error == TIMEOUT_MESSAGE {
            OpError::Timeout(result.error.clone())
        } else {
            OpError::ToolError(result.error_or_unknown().to_string())
        }
    }
}

impl From<CapError> for OpError {
    fn from(e: CapError) -> Self {
        match e {
            CapError::Spawn { .. } => OpError::SpawnFailure(e.to_string()),
            CapError::Io(io) => OpError::Io(io),
            CapError::Timeout => OpError::Timeout(TIMEOUT_MESSAGE.into()),
            CapError::Unsupported(m) => OpError::Unsupported(m),
            CapError::Other(m) => OpError::Internal(m),
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub struct CommandRegistry {
    handlers: HashMap<String, CommandHandler>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        let mut reg = Self {
            handlers: HashMap::new(),
        };
        reg.register("devices", cmd_devices);
        reg.register("connect", cmd_connect);
        reg.register("disconnect", cmd_disconnect);
        reg.register("set_location", cmd_set_location);
        reg.register("clear_location", cmd_clear_location);
        reg.register("current_location", cmd_current_location);
        reg.register("status", cmd_status);
        reg.register("start_tunnel", cmd_start_tunnel);
        reg.register("doctor", cmd_doctor);
        reg
    }

    pub fn register(&mut self, name: &str, handler: CommandHandler) {
        self.handlers.insert(name.to_string(), handler);
    }

    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(|s| s.as_str()).collect();
        names.sort();
        names
    }

    /// Execute a command by name and wrap the outcome in an envelope.
    pub async fn execute(&self, name: &str, args: Value, ctx: &SimContext) -> OperationResult {
        let run_id = new_run_id();
        let start = Instant::now();
        let target = target_of(&args);

        let handler = match self.handlers.get(name) {
            Some(h) => h,
            None => {
                return result_err(
                    name,
                    &target,
                    &run_id,
                    start.elapsed().as_millis() as u64,
                    ErrorCode::InvalidInput,
                    format!("unknown command: {}", name),
                );
            }
        };

        tracing::debug!(command = name, %run_id, "executing command");
        match handler(args, ctx).await {
            Ok(data) => {
                let mut r = result_ok(name, &target, &run_id, start.elapsed().as_millis() as u64);
                r.data = Some(data);
                r
            }
            Err(e) => {
                tracing::warn!(command = name, code = %e.error_code(), error = %e, "command failed");
                result_err(
                    name,
                    &target,
                    &run_id,
                    start.elapsed().as_millis() as u64,
                    e.error_code(),
                    e.to_string(),
                )
            }
        }
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Device id, else platform, else `-`.
fn target_of(args: &Value) -> String {
    ["device_id", "deviceId", "platform"]
        .iter()
        .find_map(|k| args.get(*k).and_then(Value::as_str))
        .unwrap_or("-")
        .to_string()
}

// ===========================================================================
// Arguments
// ===========================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TargetArgs {
    #[serde(alias = "deviceId")]
    device_id: Option<String>,
    platform: Option<String>,
}

impl TargetArgs {
    fn platform(&self) -> Result<Option<Platform>, OpError> {
        self.platform
            .as_deref()
            .map(|p| p.parse::<Platform>().map_err(OpError::Unsupported))
            .transpose()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SetArgs {
    latitude: Option<Value>,
    longitude: Option<Value>,
    #[serde(flatten)]
    target: TargetArgs,
}

fn parse_args<T: for<'de> Deserialize<'de> + Default>(args: Value) -> Result<T, OpError> {
    if args.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(args).map_err(|e| OpError::InvalidInput(format!("invalid args: {}", e)))
}

fn to_value<T: serde::Serialize>(v: &T) -> Result<Value, OpError> {
    serde_json::to_value(v).map_err(|e| OpError::Internal(e.to_string()))
}

// ===========================================================================
// Commands
// ===========================================================================

/// `devices` – every connected device plus tool availability.
fn cmd_devices(_args: Value, ctx: &SimContext) -> HandlerFuture<'_> {
    Box::pin(async move { to_value(&devices::list_all_devices(ctx).await) })
}

/// `connect` – prepare a device for location simulation.
///
/// Args: `{ "device_id": "...", "platform": "ios" | "android" }`
fn cmd_connect(args: Value, ctx: &SimContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let args: TargetArgs = parse_args(args)?;
        let platform = args.platform()?;
        let device_id = args.device_id.unwrap_or_default();
        let report = devices::connect_device(ctx, &device_id, platform).await?;
        to_value(&report)
    })
}

/// `disconnect` – stop tunnels and clear state on every platform.
fn cmd_disconnect(_args: Value, ctx: &SimContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        devices::disconnect_all(ctx).await;
        Ok(serde_json::json!({
            "message": "All devices disconnected and connections cleaned up"
        }))
    })
}

/// `set_location`
///
/// Args: `{ "latitude": 37.77, "longitude": -122.41, "device_id"?, "platform"? }`
/// Coordinates may be numbers or numeric strings.
fn cmd_set_location(args: Value, ctx: &SimContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let args: SetArgs = parse_args(args)?;
        let (Some(lat), Some(lng)) = (&args.latitude, &args.longitude) else {
            return Err(OpError::InvalidInput(
                "Latitude and longitude are required".into(),
            ));
        };
        let coordinates = Coordinates::from_json(lat, lng).map_err(OpError::InvalidInput)?;
        let platform = args.target.platform()?;
        let report = location::set_location(
            ctx,
            coordinates,
            args.target.device_id.as_deref(),
            platform,
        )
        .await?;
        to_value(&report)
    })
}

/// `clear_location` – Args: `{ "device_id"?, "platform"? }`
fn cmd_clear_location(args: Value, ctx: &SimContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let args: TargetArgs = parse_args(args)?;
        let platform = args.platform()?;
        let report =
            location::clear_location(ctx, args.device_id.as_deref(), platform).await?;
        to_value(&report)
    })
}

/// `current_location` – what the device itself reports.
/// Args: `{ "device_id"?, "platform"? }`
fn cmd_current_location(args: Value, ctx: &SimContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let args: TargetArgs = parse_args(args)?;
        let platform = args.platform()?;
        let report =
            location::current_location(ctx, args.device_id.as_deref(), platform).await?;
        to_value(&report)
    })
}

fn cmd_status(_args: Value, ctx: &SimContext) -> HandlerFuture<'_> {
    Box::pin(async move { to_value(&devices::status(ctx).await) })
}

/// `start_tunnel` – debug helper. Args: `{ "platform": "ios" }` (default ios).
fn cmd_start_tunnel(args: Value, ctx: &SimContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let args: TargetArgs = parse_args(args)?;
        let platform = args.platform()?.unwrap_or(Platform::Ios);
        let result = platform.start_tunnel(ctx).await;
        if !result.success {
            return Err(OpError::from_tool(&result));
        }
        let message = match platform {
            Platform::Ios => "iOS tunnel start attempted",
            Platform::Android => "ADB server restart attempted",
        };
        Ok(serde_json::json!({
            "message": message,
            "output": result.output,
        }))
    })
}

fn cmd_doctor(_args: Value, ctx: &SimContext) -> HandlerFuture<'_> {
    Box::pin(async move { to_value(&doctor::gather_report(ctx).await) })
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fake_context, FakeProcess};
    use serde_json::json;

    #[tokio::test]
    async fn test_unknown_command() {
        let ctx = fake_context(&FakeProcess::new());
        let reg = CommandRegistry::new();
        let result = reg.execute("nonexistent", json!({}), &ctx).await;
        assert_eq!(result.status, Status::Error);
        assert_eq!(result.error.unwrap().code, ErrorCode::InvalidInput);
    }

    #[tokio::test]
    async fn test_set_location_validation() {
        let ctx = fake_context(&FakeProcess::new());
        let reg = CommandRegistry::new();

        let r = reg
            .execute("set_location", json!({"latitude": 91, "longitude": 0, "device_id": "X"}), &ctx)
            .await;
        assert_eq!(r.status, Status::Error);
        let err = r.error.unwrap();
        assert_eq!(err.code, ErrorCode::InvalidInput);
        assert_eq!(err.message, "Latitude must be between -90 and 90");

        let r = reg.execute("set_location", json!({"latitude": 1}), &ctx).await;
        assert_eq!(r.error.unwrap().message, "Latitude and longitude are required");

        let r = reg
            .execute("set_location", json!({"latitude": "abc", "longitude": 0}), &ctx)
            .await;
        assert_eq!(r.error.unwrap().message, "Invalid coordinate format");
    }

    #[tokio::test]
    async fn test_set_location_envelope() {
        let fake = FakeProcess::new();
        fake.ok("GPS_FIX_CHANGE", "Broadcast completed");
        let ctx = fake_context(&fake);
        let reg = CommandRegistry::new();

        let r = reg
            .execute(
                "set_location",
                json!({"latitude": "37.7749", "longitude": -122.4194, "deviceId": "X", "platform": "android"}),
                &ctx,
            )
            .await;
        assert_eq!(r.status, Status::Pass);
        assert_eq!(r.target, "X");
        assert_eq!(r.command, "set_location");
        let data = r.data.unwrap();
        assert_eq!(data["method"], "AM Broadcast");
        assert_eq!(data["coordinates"]["latitude"], 37.7749);
    }

    #[tokio::test]
    async fn test_unsupported_platform_is_skip() {
        let ctx = fake_context(&FakeProcess::new());
        let reg = CommandRegistry::new();
        let r = reg
            .execute("clear_location", json!({"device_id": "X", "platform": "windows"}), &ctx)
            .await;
        assert_eq!(r.status, Status::Skip);
        assert_eq!(r.error.unwrap().message, "Platform 'windows' not supported");
    }

    #[tokio::test]
    async fn test_connect_passcode_is_fail() {
        let fake = FakeProcess::new();
        fake.ok("lockdown info", r#"{"PasswordProtected": true}"#);
        let ctx = fake_context(&fake);
        let reg = CommandRegistry::new();

        let r = reg
            .execute("connect", json!({"device_id": "ABC", "platform": "ios"}), &ctx)
            .await;
        assert_eq!(r.status, Status::Fail);
        assert_eq!(r.error.unwrap().code, ErrorCode::PreconditionFailed);
        assert!(fake.calls_matching("mounter").is_empty());
    }

    #[tokio::test]
    async fn test_start_tunnel_timeout_maps_to_timeout() {
        let fake = FakeProcess::new();
        fake.fail("lockdown start-tunnel", TIMEOUT_MESSAGE);
        let ctx = fake_context(&fake);
        let reg = CommandRegistry::new();

        let r = reg.execute("start_tunnel", json!({}), &ctx).await;
        assert_eq!(r.status, Status::Fail);
        assert_eq!(r.error.unwrap().code, ErrorCode::Timeout);
    }

    #[tokio::test]
    async fn test_current_location_envelope() {
        let fake = FakeProcess::new();
        fake.ok(
            "dumpsys location",
            "last location=Location[fused 35.6586,139.7454 hAcc=12.0]",
        );
        let ctx = fake_context(&fake);
        let reg = CommandRegistry::new();

        let r = reg
            .execute("current_location", json!({"device_id": "X", "platform": "android"}), &ctx)
            .await;
        assert_eq!(r.status, Status::Pass);
        assert_eq!(r.target, "X");
        let data = r.data.unwrap();
        assert_eq!(data["provider"], "fused");
        assert_eq!(data["coordinates"]["longitude"], 139.7454);

        let r = reg
            .execute("current_location", json!({"device_id": "ABC", "platform": "ios"}), &ctx)
            .await;
        assert_eq!(r.status, Status::Skip);
        assert_eq!(r.error.unwrap().code, ErrorCode::Unsupported);
    }

    #[tokio::test]
    async fn test_disconnect_passes_with_nothing_running() {
        let ctx = fake_context(&FakeProcess::new());
        let reg = CommandRegistry::new();
        let r = reg.execute("disconnect", Value::Null, &ctx).await;
        assert_eq!(r.status, Status::Pass);
    }

    #[test]
    fn test_list_commands() {
        let reg = CommandRegistry::new();
        assert_eq!(
            reg.list(),
            vec![
                "clear_location",
                "connect",
                "current_location",
                "devices",
                "disconnect",
                "doctor",
                "set_location",
                "start_tunnel",
                "status"
            ]
        );
    }
}
