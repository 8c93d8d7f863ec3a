//! Output classifier – judges tool success from exit code plus output text.
//!
//! The wrapped tools have no structured error channel, so success is
//! decided by substring tables. The tables are configuration data
//! ([`ClassifierTable`]) and can be replaced without touching control flow.

use crate::types::{CommandResult, Tool};
use serde::{Deserialize, Serialize};

/// Pattern profile for one wrapped tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputProfile {
    /// Compare lowercased text when true.
    #[serde(default)]
    pub case_insensitive: bool,
    /// Substrings that mark a logical failure even on exit code 0.
    #[serde(default)]
    pub error_patterns: Vec<String>,
    /// Substrings of known-good output. A match clears the error flag.
    #[serde(default)]
    pub normal_patterns: Vec<String>,
}

impl OutputProfile {
    pub fn mobiledevice() -> Self {
        Self {
            case_insensitive: false,
            error_patterns: strings(&[
                "InvalidServiceError",
                "Unable to connect to Tunneld",
                "Cannot enable developer-mode when passcode is set",
                "DeveloperDiskImage not mounted",
                "No such file or directory",
            ]),
            normal_patterns: strings(&[
                "Press Ctrl+C to send a SIGINT",
                "tunnel created",
                "Use the follow connection option",
            ]),
        }
    }

    pub fn adb() -> Self {
        Self {
            case_insensitive: true,
            error_patterns: strings(&[
                "device not found",
                "no devices/emulators found",
                "device offline",
                "device unauthorized",
                "permission denied",
                "failed to connect",
                "adb: not found",
            ]),
            normal_patterns: Vec::new(),
        }
    }

    /// Exit code only.
    pub fn plain() -> Self {
        Self {
            case_insensitive: false,
            error_patterns: Vec::new(),
            normal_patterns: Vec::new(),
        }
    }

    fn matches_any(&self, haystack: &str, patterns: &[String]) -> bool {
        if self.case_insensitive {
            patterns
                .iter()
                .any(|p| haystack.contains(&p.to_lowercase()))
        } else {
            patterns.iter().any(|p| haystack.contains(p.as_str()))
        }
    }

    /// True when the combined output matches an error pattern that is not
    /// excused by a normal-output pattern.
    pub fn has_error(&self, stdout: &str, stderr: &str) -> bool {
        let mut combined = String::with_capacity(stdout.len() + stderr.len());
        combined.push_str(stdout);
        combined.push_str(stderr);
        if self.case_insensitive {
            combined = combined.to_lowercase();
        }
        let has_error = self.matches_any(&combined, &self.error_patterns);
        let is_normal = self.matches_any(&combined, &self.normal_patterns);
        has_error && !is_normal
    }

    pub fn classify(&self, exit_code: Option<i32>, stdout: &str, stderr: &str) -> bool {
        exit_code == Some(0) && !self.has_error(stdout, stderr)
    }

    /// Turn raw process output into a [`CommandResult`].
    pub fn to_result(&self, exit_code: Option<i32>, stdout: String, stderr: String) -> CommandResult {
        let has_error = self.has_error(&stdout, &stderr);
        let success = exit_code == Some(0) && !has_error;
        let error = if !stderr.is_empty() {
            stderr
        } else if has_error {
            stdout.clone()
        } else if !success {
            match exit_code {
                Some(code) => format!("Command exited with status {}", code),
                None => "Command terminated by signal".to_string(),
            }
        } else {
            String::new()
        };
        CommandResult {
            success,
            output: stdout,
            error,
        }
    }
}

/// Versioned set of classifier profiles, one per tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierTable {
    pub version: u32,
    pub mobiledevice: OutputProfile,
    pub adb: OutputProfile,
}

impl Default for ClassifierTable {
    fn default() -> Self {
        Self {
            version: 1,
            mobiledevice: OutputProfile::mobiledevice(),
            adb: OutputProfile::adb(),
        }
    }
}

impl ClassifierTable {
    pub fn profile(&self, tool: Tool) -> OutputProfile {
        match tool {
            Tool::Mobiledevice => self.mobiledevice.clone(),
            Tool::Adb => self.adb.clone(),
            Tool::System => OutputProfile::plain(),
        }
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_exit_is_success() {
        let p = OutputProfile::mobiledevice();
        assert!(p.classify(Some(0), "ok", ""));
    }

    #[test]
    fn test_nonzero_exit_is_failure() {
        let p = OutputProfile::mobiledevice();
        assert!(!p.classify(Some(1), "", ""));
        assert!(!p.classify(None, "", ""));
    }

    #[test]
    fn test_error_pattern_overrides_zero_exit() {
        let p = OutputProfile::mobiledevice();
        assert!(!p.classify(Some(0), "", "InvalidServiceError: dvt"));
    }

    #[test]
    fn test_normal_pattern_clears_error() {
        let p = OutputProfile::mobiledevice();
        let out = "No such file or directory\nPress Ctrl+C to send a SIGINT";
        assert!(p.classify(Some(0), out, ""));
    }

    #[test]
    fn test_mobiledevice_profile_is_case_sensitive() {
        let p = OutputProfile::mobiledevice();
        assert!(p.classify(Some(0), "invalidserviceerror", ""));
    }

    #[test]
    fn test_adb_profile_is_case_insensitive() {
        let p = OutputProfile::adb();
        assert!(!p.classify(Some(0), "", "error: Device Not Found"));
        assert!(!p.classify(Some(0), "adb: Permission Denied", ""));
    }

    #[test]
    fn test_to_result_uses_output_when_stderr_empty() {
        let p = OutputProfile::adb();
        let r = p.to_result(Some(0), "error: device offline".into(), String::new());
        assert!(!r.success);
        assert_eq!(r.error, "error: device offline");
    }

    #[test]
    fn test_to_result_failure_always_has_error_text() {
        let p = OutputProfile::plain();
        let r = p.to_result(Some(3), String::new(), String::new());
        assert!(!r.success);
        assert_eq!(r.error, "Command exited with status 3");
    }

    #[test]
    fn test_table_from_yaml_overrides_patterns() {
        let yaml = r#"
version: 2
adb:
  case_insensitive: true
  error_patterns: ["boom"]
"#;
        let table: ClassifierTable = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(table.version, 2);
        assert!(!table.profile(Tool::Adb).classify(Some(0), "BOOM", ""));
        // Untouched profile keeps its defaults.
        assert_eq!(table.mobiledevice, OutputProfile::mobiledevice());
    }
}
