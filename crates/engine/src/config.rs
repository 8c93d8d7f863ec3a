//! Engine configuration.
//!
//! Every field has a default, so an empty source set yields a working
//! config. Sources are layered: `locsim.yaml`, `.locsim.yaml`, an optional
//! explicit file, then `LOCSIM__*` environment variables.

use crate::classifier::ClassifierTable;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub ios: IosConfig,
    pub android: AndroidConfig,
    pub timeouts: TimeoutConfig,
    pub tunnel: TunnelConfig,
    pub location: LocationConfig,
    pub classifier: ClassifierTable,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IosConfig {
    /// Invocation prefix for pymobiledevice3.
    pub tool: Vec<String>,
}

impl Default for IosConfig {
    fn default() -> Self {
        Self {
            tool: vec![
                "python3".to_string(),
                "-m".to_string(),
                "pymobiledevice3".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AndroidConfig {
    pub adb: String,
}

impl Default for AndroidConfig {
    fn default() -> Self {
        Self {
            adb: "adb".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub command_seconds: u64,
    /// Tool availability checks.
    pub probe_seconds: u64,
    /// How long to wait for a tunnel command's readiness marker.
    pub tunnel_ready_seconds: u64,
    /// Upper bound on the readiness watcher's lifetime.
    pub monitor_seconds: u64,
    /// Grace window between SIGTERM and SIGKILL.
    pub kill_grace_ms: u64,
    /// Timeout of the manual start-tunnel helper.
    pub start_tunnel_seconds: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            command_seconds: 30,
            probe_seconds: 10,
            tunnel_ready_seconds: 10,
            monitor_seconds: 15,
            kill_grace_ms: 1000,
            start_tunnel_seconds: 5,
        }
    }
}

impl TimeoutConfig {
    pub fn command(&self) -> Duration {
        Duration::from_secs(self.command_seconds)
    }

    pub fn probe(&self) -> Duration {
        Duration::from_secs(self.probe_seconds)
    }

    pub fn tunnel_ready(&self) -> Duration {
        Duration::from_secs(self.tunnel_ready_seconds)
    }

    pub fn monitor(&self) -> Duration {
        Duration::from_secs(self.monitor_seconds)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn start_tunnel(&self) -> Duration {
        Duration::from_secs(self.start_tunnel_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Directory holding the tunnel log and descriptor.
    pub scratch_dir: PathBuf,
    pub log_file: String,
    pub info_file: String,
    /// Wait after launching the detached tunnel before reading its log.
    pub settle_ms: u64,
    /// Wait after killing tunnel processes during cleanup.
    pub cleanup_settle_ms: u64,
    /// Any of these in a tunnel command's output means it is ready.
    pub ready_markers: Vec<String>,
    /// Command-line fragment identifying detached tunnel processes.
    pub process_pattern: String,
    pub address_label: String,
    pub port_label: String,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            scratch_dir: std::env::temp_dir(),
            log_file: "tunnel.log".to_string(),
            info_file: "tunnel_info.txt".to_string(),
            settle_ms: 2000,
            cleanup_settle_ms: 1000,
            ready_markers: vec![
                "Press Ctrl+C to send a SIGINT".to_string(),
                "SIGINT".to_string(),
            ],
            process_pattern: "lockdown start-tunnel".to_string(),
            address_label: "RSD Address:".to_string(),
            port_label: "RSD Port:".to_string(),
        }
    }
}

impl TunnelConfig {
    pub fn log_path(&self) -> PathBuf {
        self.scratch_dir.join(&self.log_file)
    }

    pub fn info_path(&self) -> PathBuf {
        self.scratch_dir.join(&self.info_file)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn cleanup_settle(&self) -> Duration {
        Duration::from_millis(self.cleanup_settle_ms)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct LocationConfig {
    /// Times each set command is sent; the last result counts.
    pub set_repeats: u32,
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self { set_repeats: 2 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `error`, `warn`, `info`, `debug` or `trace`.
    pub level: String,
    pub json: bool,
    pub show_time: bool,
    pub show_target: bool,
    pub redaction: RedactionConfig,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            show_time: true,
            show_target: false,
            redaction: RedactionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedactionConfig {
    pub enabled: bool,
    pub patterns: Vec<RedactionPattern>,
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            patterns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedactionPattern {
    pub name: String,
    pub regex: String,
    pub placeholder: String,
}

/// Load configuration from the default file locations, an optional explicit
/// file, and the environment.
pub fn load_config(explicit: Option<&Path>) -> Result<EngineConfig, ConfigError> {
    let mut builder = Config::builder()
        .add_source(File::with_name("locsim.yaml").required(false))
        .add_source(File::with_name(".locsim.yaml").required(false));

    if let Some(path) = explicit {
        builder = builder.add_source(File::from(path.to_path_buf()).required(true));
    }

    // Nested env vars like LOCSIM__TIMEOUTS__COMMAND_SECONDS=5
    builder
        .add_source(
            Environment::with_prefix("LOCSIM")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    struct EnvGuard(&'static str);
    impl EnvGuard {
        fn new(key: &'static str, val: &str) -> Self {
            env::set_var(key, val);
            Self(key)
        }
    }
    impl Drop for EnvGuard {
        fn drop(&mut self) {
            env::remove_var(self.0);
        }
    }

    #[test]
    #[serial]
    fn test_load_defaults() {
        let config = load_config(None);
        assert!(config.is_ok(), "Failed to load config: {:?}", config.err());

        let config = config.unwrap();
        assert_eq!(config.timeouts.command_seconds, 30);
        assert_eq!(config.timeouts.tunnel_ready_seconds, 10);
        assert_eq!(config.timeouts.monitor_seconds, 15);
        assert_eq!(config.location.set_repeats, 2);
        assert_eq!(config.android.adb, "adb");
        assert_eq!(config.tunnel.log_file, "tunnel.log");
    }

    #[test]
    #[serial]
    fn test_env_var_override_numeric() {
        let _guard = EnvGuard::new("LOCSIM__TIMEOUTS__COMMAND_SECONDS", "5");
        let config = load_config(None).expect("Should load config");
        assert_eq!(config.timeouts.command_seconds, 5);
        // Siblings keep their defaults.
        assert_eq!(config.timeouts.probe_seconds, 10);
    }

    #[test]
    #[serial]
    fn test_env_var_override_string() {
        let _guard = EnvGuard::new("LOCSIM__ANDROID__ADB", "/opt/platform-tools/adb");
        let config = load_config(None).expect("Should load config");
        assert_eq!(config.android.adb, "/opt/platform-tools/adb");
    }

    #[test]
    #[serial]
    fn test_explicit_file() {
        let path = env::temp_dir().join(format!("locsim_cfg_{}.yaml", crate::types::new_run_id()));
        std::fs::write(
            &path,
            "tunnel:\n  settle_ms: 50\nlocation:\n  set_repeats: 1\n",
        )
        .unwrap();

        let config = load_config(Some(&path)).expect("Should load config");
        assert_eq!(config.tunnel.settle_ms, 50);
        assert_eq!(config.location.set_repeats, 1);
        assert_eq!(config.tunnel.ready_markers.len(), 2);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    #[serial]
    fn test_missing_explicit_file_is_error() {
        let path = env::temp_dir().join("locsim_does_not_exist.yaml");
        assert!(load_config(Some(&path)).is_err());
    }

    #[test]
    fn test_scratch_paths() {
        let mut t = TunnelConfig::default();
        t.scratch_dir = PathBuf::from("/var/run/locsim");
        assert_eq!(t.log_path(), PathBuf::from("/var/run/locsim/tunnel.log"));
        assert_eq!(t.info_path(), PathBuf::from("/var/run/locsim/tunnel_info.txt"));
    }
}
