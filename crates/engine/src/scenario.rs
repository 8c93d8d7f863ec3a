//! Scenario playback – scripted connect/set/clear flows from YAML files.
//!
//! ```yaml
//! name: commute
//! device: 00008110-000A
//! platform: ios
//! steps:
//!   - connect: {}
//!   - set: { lat: 37.7749, lng: -122.4194 }
//!   - wait: { ms: 2000 }
//!   - set: { lat: 37.8044, lng: -122.2712 }
//!   - clear: {}
//!   - disconnect: {}
//! ```

use crate::commands::CommandRegistry;
use crate::context::SimContext;
use crate::types::*;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    pub name: Option<String>,
    /// Default target for every step.
    pub device: Option<String>,
    pub platform: Option<String>,
    #[serde(default = "default_stop_on_failure")]
    pub stop_on_failure: bool,
    pub steps: Vec<ScenarioStep>,
}

fn default_stop_on_failure() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ScenarioStep {
    Connect { connect: StepTarget },
    Set { set: Waypoint },
    Clear { clear: StepTarget },
    Wait { wait: Pause },
    Disconnect { disconnect: StepTarget },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StepTarget {
    pub device: Option<String>,
    pub platform: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Waypoint {
    pub lat: Value,
    pub lng: Value,
    #[serde(flatten)]
    pub target: StepTarget,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Pause {
    pub ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    pub name: Option<String>,
    pub overall_status: Status,
    pub step_results: Vec<OperationResult>,
}

pub fn load_scenario(yaml: &str) -> Result<Scenario, String> {
    serde_yaml::from_str(yaml).map_err(|e| format!("failed to parse scenario YAML: {}", e))
}

impl Scenario {
    /// Registry args for a step, falling back to the scenario-level target.
    fn target_args(&self, target: &StepTarget) -> Map<String, Value> {
        let mut args = Map::new();
        if let Some(d) = target.device.as_ref().or(self.device.as_ref()) {
            args.insert("device_id".into(), json!(d));
        }
        if let Some(p) = target.platform.as_ref().or(self.platform.as_ref()) {
            args.insert("platform".into(), json!(p));
        }
        args
    }
}

pub async fn run_scenario(
    scenario: &Scenario,
    ctx: &SimContext,
    registry: &CommandRegistry,
) -> ScenarioResult {
    let mut step_results = Vec::new();
    let mut overall = Status::Pass;

    for (i, step) in scenario.steps.iter().enumerate() {
        let result = match step {
            ScenarioStep::Connect { connect } => {
                let args = scenario.target_args(connect);
                registry.execute("connect", Value::Object(args), ctx).await
            }
            ScenarioStep::Set { set } => {
                let mut args = scenario.target_args(&set.target);
                args.insert("latitude".into(), set.lat.clone());
                args.insert("longitude".into(), set.lng.clone());
                registry.execute("set_location", Value::Object(args), ctx).await
            }
            ScenarioStep::Clear { clear } => {
                let args = scenario.target_args(clear);
                registry.execute("clear_location", Value::Object(args), ctx).await
            }
            ScenarioStep::Disconnect { disconnect } => {
                let args = scenario.target_args(disconnect);
                registry.execute("disconnect", Value::Object(args), ctx).await
            }
            ScenarioStep::Wait { wait } => {
                let start = Instant::now();
                tokio::time::sleep(Duration::from_millis(wait.ms)).await;
                result_ok("wait", "-", &new_run_id(), start.elapsed().as_millis() as u64)
            }
        };

        let failed = matches!(result.status, Status::Fail | Status::Error);
        if failed {
            tracing::warn!(
                step = i,
                command = %result.command,
                status = ?result.status,
                "scenario step failed"
            );
            overall = Status::Fail;
        }
        step_results.push(result);
        if failed && scenario.stop_on_failure {
            break;
        }
    }

    ScenarioResult {
        name: scenario.name.clone(),
        overall_status: overall,
        step_results,
    }
}
