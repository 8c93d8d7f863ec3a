use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Tool invocation result
// ---------------------------------------------------------------------------

/// Outcome of a single external tool invocation.
///
/// Built fresh per call and never mutated after it is returned. A failed
/// result always carries a non-empty `error` unless the operation was a
/// recognised best-effort no-op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CommandResult {
    pub success: bool,
    pub output: String,
    pub error: String,
}

impl CommandResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: String::new(),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: error.into(),
        }
    }

    /// Error text if present, otherwise a generic placeholder.
    pub fn error_or_unknown(&self) -> &str {
        if self.error.trim().is_empty() {
            "Unknown error"
        } else {
            &self.error
        }
    }
}

// ---------------------------------------------------------------------------
// Commands issued to wrapped tools
// ---------------------------------------------------------------------------

/// Which wrapped tool a command targets. Selects the output classifier
/// profile used to judge success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tool {
    Mobiledevice,
    Adb,
    System,
}

/// A fully-interpolated command line, kept as an argument vector so device
/// ids and coordinates never pass through a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub tool: Tool,
    pub program: String,
    pub args: Vec<String>,
}

impl ToolCommand {
    pub fn new(tool: Tool, program: impl Into<String>) -> Self {
        Self {
            tool,
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Build from a prefix such as `["python3", "-m", "pymobiledevice3"]`.
    pub fn from_prefix(tool: Tool, prefix: &[String]) -> Self {
        let mut iter = prefix.iter();
        let program = iter.next().cloned().unwrap_or_default();
        Self {
            tool,
            program,
            args: iter.cloned().collect(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// True when `needle` occurs in the rendered command line.
    pub fn contains(&self, needle: &str) -> bool {
        self.to_string().contains(needle)
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for a in &self.args {
            write!(f, " {}", a)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Platforms and devices
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Ios,
    Android,
}

impl Platform {
    pub const ALL: [Platform; 2] = [Platform::Ios, Platform::Android];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Ios => "ios",
            Platform::Android => "android",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ios" => Ok(Platform::Ios),
            "android" => Ok(Platform::Android),
            other => Err(format!("Platform '{}' not supported", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub platform: Platform,
    pub connection_type: String,
    pub status: String,
}

// ---------------------------------------------------------------------------
// Coordinates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    /// Parse and range-check textual coordinates.
    pub fn parse(lat: &str, lng: &str) -> Result<Self, String> {
        let latitude: f64 = lat
            .trim()
            .parse()
            .map_err(|_| "Invalid coordinate format".to_string())?;
        let longitude: f64 = lng
            .trim()
            .parse()
            .map_err(|_| "Invalid coordinate format".to_string())?;
        Self::new(latitude, longitude)
    }

    /// Accepts JSON numbers or numeric strings.
    pub fn from_json(lat: &serde_json::Value, lng: &serde_json::Value) -> Result<Self, String> {
        fn as_text(v: &serde_json::Value) -> Result<String, String> {
            match v {
                serde_json::Value::Number(n) => Ok(n.to_string()),
                serde_json::Value::String(s) => Ok(s.clone()),
                _ => Err("Invalid coordinate format".to_string()),
            }
        }
        Self::parse(&as_text(lat)?, &as_text(lng)?)
    }

    pub fn new(latitude: f64, longitude: f64) -> Result<Self, String> {
        if !(-90.0..=90.0).contains(&latitude) {
            return Err("Latitude must be between -90 and 90".to_string());
        }
        if !(-180.0..=180.0).contains(&longitude) {
            return Err("Longitude must be between -180 and 180".to_string());
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }

    /// Plain decimal rendering, independent of locale.
    pub fn lat_arg(&self) -> String {
        self.latitude.to_string()
    }

    pub fn lng_arg(&self) -> String {
        self.longitude.to_string()
    }
}

impl fmt::Display for Coordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}", self.latitude, self.longitude)
    }
}

// ---------------------------------------------------------------------------
// Tunnel descriptor – persisted connection state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelState {
    Pending,
    Established,
}

const PENDING: &str = "pending";

/// Single-slot record of the active tunnel. Serialised as one line:
/// `"<address> <port> <device_id>"` or `"pending pending <device_id>"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelDescriptor {
    pub address: Option<String>,
    pub port: Option<String>,
    pub device_id: String,
    pub state: TunnelState,
}

impl TunnelDescriptor {
    pub fn established(
        address: impl Into<String>,
        port: impl Into<String>,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            address: Some(address.into()),
            port: Some(port.into()),
            device_id: device_id.into(),
            state: TunnelState::Established,
        }
    }

    pub fn pending(device_id: impl Into<String>) -> Self {
        Self {
            address: None,
            port: None,
            device_id: device_id.into(),
            state: TunnelState::Pending,
        }
    }

    /// Address and port, only when the tunnel is usable.
    pub fn endpoint(&self) -> Option<(&str, &str)> {
        match (self.state, &self.address, &self.port) {
            (TunnelState::Established, Some(a), Some(p)) => Some((a.as_str(), p.as_str())),
            _ => None,
        }
    }

    pub fn to_line(&self) -> String {
        match self.endpoint() {
            Some((a, p)) => format!("{} {} {}", a, p, self.device_id),
            None => format!("{} {} {}", PENDING, PENDING, self.device_id),
        }
    }

    /// Parse a stored line. Fewer than three fields means no connection.
    pub fn parse_line(line: &str) -> Option<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 3 {
            return None;
        }
        let (address, port, device_id) = (parts[0], parts[1], parts[2]);
        if address == PENDING || port == PENDING {
            Some(Self::pending(device_id))
        } else {
            Some(Self::established(address, port, device_id))
        }
    }
}

// ---------------------------------------------------------------------------
// Operation result envelope – the stable output contract
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationResult {
    pub run_id: String,
    pub command: String,
    pub target: String,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    pub timing_ms: TimingInfo,
    /// Operation-specific payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pass,
    Fail,
    Skip,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidInput,
    Unsupported,
    PreconditionFailed,
    SpawnFailure,
    ToolError,
    ChainExhausted,
    Timeout,
    IoError,
    InternalError,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_else(|| format!("{:?}", self));
        f.write_str(&s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TimingInfo {
    pub total: u64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub steps: HashMap<String, u64>,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub fn current_os() -> &'static str {
    match std::env::consts::OS {
        "macos" => "macos",
        "linux" => "linux",
        "windows" => "windows",
        other => other,
    }
}

/// Generate a new run ID (UUIDv4).
pub fn new_run_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Build a successful OperationResult shell (caller fills in data).
pub fn result_ok(command: &str, target: &str, run_id: &str, total_ms: u64) -> OperationResult {
    OperationResult {
        run_id: run_id.to_string(),
        command: command.to_string(),
        target: target.to_string(),
        status: Status::Pass,
        error: None,
        timing_ms: TimingInfo {
            total: total_ms,
            steps: HashMap::new(),
        },
        data: None,
    }
}

/// Build a failed OperationResult. Tool and workflow failures are `Fail`,
/// everything else is `Error`.
pub fn result_err(
    command: &str,
    target: &str,
    run_id: &str,
    total_ms: u64,
    code: ErrorCode,
    message: impl Into<String>,
) -> OperationResult {
    let status = match code {
        ErrorCode::ToolError
        | ErrorCode::ChainExhausted
        | ErrorCode::PreconditionFailed
        | ErrorCode::Timeout => Status::Fail,
        ErrorCode::Unsupported => Status::Skip,
        _ => Status::Error,
    };
    OperationResult {
        run_id: run_id.to_string(),
        command: command.to_string(),
        target: target.to_string(),
        status,
        error: Some(ErrorInfo {
            code,
            message: message.into(),
            details: serde_json::Value::Null,
        }),
        timing_ms: TimingInfo {
            total: total_ms,
            steps: HashMap::new(),
        },
        data: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coordinates_latitude_out_of_range() {
        let err = Coordinates::parse("91", "0").unwrap_err();
        assert_eq!(err, "Latitude must be between -90 and 90");
    }

    #[test]
    fn test_coordinates_longitude_out_of_range() {
        let err = Coordinates::parse("45", "200").unwrap_err();
        assert_eq!(err, "Longitude must be between -180 and 180");
    }

    #[test]
    fn test_coordinates_bad_format() {
        let err = Coordinates::parse("abc", "0").unwrap_err();
        assert_eq!(err, "Invalid coordinate format");
    }

    #[test]
    fn test_coordinates_accepted_unchanged() {
        let c = Coordinates::parse("37.7749", "-122.4194").unwrap();
        assert_eq!(c.latitude, 37.7749);
        assert_eq!(c.longitude, -122.4194);
        assert_eq!(c.lat_arg(), "37.7749");
        assert_eq!(c.lng_arg(), "-122.4194");
    }

    #[test]
    fn test_coordinates_from_json_numbers_and_strings() {
        let c = Coordinates::from_json(&serde_json::json!(37.7749), &serde_json::json!("-122.4194"))
            .unwrap();
        assert_eq!(c.longitude, -122.4194);
        let err = Coordinates::from_json(&serde_json::json!(true), &serde_json::json!(0)).unwrap_err();
        assert_eq!(err, "Invalid coordinate format");
    }

    #[test]
    fn test_descriptor_line_roundtrip() {
        let d = TunnelDescriptor::established("10.0.0.1", "1234", "ABC");
        assert_eq!(d.to_line(), "10.0.0.1 1234 ABC");
        let back = TunnelDescriptor::parse_line(&d.to_line()).unwrap();
        assert_eq!(back, d);
    }

    #[test]
    fn test_descriptor_pending_line() {
        let d = TunnelDescriptor::pending("ABC");
        assert_eq!(d.to_line(), "pending pending ABC");
        let back = TunnelDescriptor::parse_line("pending pending ABC\n").unwrap();
        assert_eq!(back.state, TunnelState::Pending);
        assert_eq!(back.device_id, "ABC");
        assert!(back.endpoint().is_none());
    }

    #[test]
    fn test_descriptor_short_line_is_no_connection() {
        assert!(TunnelDescriptor::parse_line("10.0.0.1 1234").is_none());
        assert!(TunnelDescriptor::parse_line("").is_none());
    }

    #[test]
    fn test_tool_command_display() {
        let cmd = ToolCommand::new(Tool::Adb, "adb").args(["-s", "X", "get-state"]);
        assert_eq!(cmd.to_string(), "adb -s X get-state");
        assert!(cmd.contains("get-state"));
    }

    #[test]
    fn test_platform_from_str() {
        assert_eq!("iOS".parse::<Platform>(), Ok(Platform::Ios));
        assert!("windows".parse::<Platform>().is_err());
    }
}
