//! `locsimctl` – simulate GPS locations on connected iOS and Android devices.
//!
//! Every subcommand goes through the engine's command registry and prints
//! the resulting envelope, either human-readable or as JSON.

mod logging;
mod serve;

use anyhow::Context;
use clap::{Parser, Subcommand};
use dialoguer::{theme::ColorfulTheme, Select};
use locsim_engine::devices;
use locsim_engine::types::*;
use locsim_engine::{load_config, CommandRegistry, SimContext};
use serde_json::{json, Map, Value};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};

// ===========================================================================
// CLI definition
// ===========================================================================

#[derive(Parser)]
#[command(
    name = "locsimctl",
    version,
    about = "Simulate GPS locations on iOS and Android devices"
)]
struct Cli {
    /// Extra configuration file, layered over locsim.yaml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List connected devices on every platform whose tool is installed.
    Devices {
        #[arg(long)]
        json: bool,
    },

    /// Prepare a device for location simulation.
    Connect {
        /// Device id. Prompts for one when omitted on a terminal.
        device: Option<String>,
        /// ios | android. Looked up from the device list when omitted.
        #[arg(long)]
        platform: Option<String>,
        #[arg(long)]
        json: bool,
    },

    /// Stop tunnels and clear connection state on every platform.
    Disconnect {
        #[arg(long)]
        json: bool,
    },

    /// Set a simulated location.
    Set {
        #[arg(allow_negative_numbers = true)]
        lat: String,
        #[arg(allow_negative_numbers = true)]
        lng: String,
        #[arg(long)]
        device: Option<String>,
        #[arg(long)]
        platform: Option<String>,
        #[arg(long)]
        json: bool,
    },

    /// Clear the simulated location.
    Clear {
        #[arg(long)]
        device: Option<String>,
        #[arg(long)]
        platform: Option<String>,
        #[arg(long)]
        json: bool,
    },

    /// Show the location the device itself reports.
    Current {
        #[arg(long)]
        device: Option<String>,
        #[arg(long)]
        platform: Option<String>,
        #[arg(long)]
        json: bool,
    },

    /// Tool availability and per-platform diagnostics.
    Status {
        #[arg(long)]
        json: bool,
    },

    /// Debug helper: short-lived iOS tunnel or adb server restart.
    StartTunnel {
        #[arg(long, default_value = "ios")]
        platform: String,
        #[arg(long)]
        json: bool,
    },

    /// Collect environment facts.
    Doctor {
        #[arg(long)]
        json: bool,
        /// Write result JSON to this path.
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Invoke a registry command by name with JSON args.
    Call {
        /// Command name (e.g. "set_location", "status").
        cmd: String,
        #[arg(long, default_value = "{}")]
        args: String,
        #[arg(long)]
        json: bool,
    },

    /// Play back a scripted scenario from a YAML file.
    RunScenario {
        file: PathBuf,
        #[arg(long)]
        json: bool,
    },

    /// Serve registry commands over a Unix socket.
    Serve {
        #[arg(long)]
        socket: PathBuf,
    },
}

// ===========================================================================
// Main
// ===========================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref()).context("failed to load configuration")?;
    logging::init_logging(&config.logging)?;

    let ctx = SimContext::system(config);
    let registry = CommandRegistry::new();

    match cli.command {
        Commands::Devices { json } => {
            let r = registry.execute("devices", Value::Null, &ctx).await;
            output_result(&r, json);
        }
        Commands::Connect {
            device,
            platform,
            json,
        } => {
            let device = match device {
                Some(d) => Some(d),
                None if std::io::stdin().is_terminal() => pick_device(&ctx).await?,
                None => None,
            };
            let r = registry
                .execute("connect", target_args(device, platform), &ctx)
                .await;
            output_result(&r, json);
        }
        Commands::Disconnect { json } => {
            let r = registry.execute("disconnect", Value::Null, &ctx).await;
            output_result(&r, json);
        }
        Commands::Set {
            lat,
            lng,
            device,
            platform,
            json,
        } => {
            let mut args = target_args(device, platform);
            args["latitude"] = json!(lat);
            args["longitude"] = json!(lng);
            let r = registry.execute("set_location", args, &ctx).await;
            output_result(&r, json);
        }
        Commands::Clear {
            device,
            platform,
            json,
        } => {
            let r = registry
                .execute("clear_location", target_args(device, platform), &ctx)
                .await;
            output_result(&r, json);
        }
        Commands::Current {
            device,
            platform,
            json,
        } => {
            let r = registry
                .execute("current_location", target_args(device, platform), &ctx)
                .await;
            output_result(&r, json);
        }
        Commands::Status { json } => {
            let r = registry.execute("status", Value::Null, &ctx).await;
            output_result(&r, json);
        }
        Commands::StartTunnel { platform, json } => {
            let r = registry
                .execute("start_tunnel", json!({ "platform": platform }), &ctx)
                .await;
            output_result(&r, json);
        }
        Commands::Doctor { json, out } => {
            let r = registry.execute("doctor", Value::Null, &ctx).await;
            if let Some(ref path) = out {
                write_result_file(path, &r);
            }
            output_result(&r, json);
        }
        Commands::Call { cmd, args, json } => cmd_call(&cmd, &args, json, &ctx, &registry).await,
        Commands::RunScenario { file, json } => {
            cmd_run_scenario(&file, json, &ctx, &registry).await
        }
        Commands::Serve { socket } => serve::run_daemon(socket, ctx, registry).await?,
    }
    Ok(())
}

fn target_args(device: Option<String>, platform: Option<String>) -> Value {
    let mut args = Map::new();
    if let Some(d) = device {
        args.insert("device_id".into(), json!(d));
    }
    if let Some(p) = platform {
        args.insert("platform".into(), json!(p));
    }
    Value::Object(args)
}

/// Interactive device selection. `None` when nothing is connected or the
/// prompt is dismissed.
async fn pick_device(ctx: &SimContext) -> anyhow::Result<Option<String>> {
    let listing = devices::list_all_devices(ctx).await;
    if listing.devices.is_empty() {
        eprintln!("No devices found.");
        return Ok(None);
    }
    let items: Vec<String> = listing
        .devices
        .iter()
        .map(|d| format!("{} ({}, {})", d.name, d.platform, d.id))
        .collect();
    let choice = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select a device")
        .items(&items)
        .default(0)
        .interact_opt()
        .context("device selection failed")?;
    Ok(choice.map(|i| listing.devices[i].id.clone()))
}

// ===========================================================================
// Subcommand implementations
// ===========================================================================

async fn cmd_call(
    cmd: &str,
    args_str: &str,
    json: bool,
    ctx: &SimContext,
    registry: &CommandRegistry,
) {
    let args: Value = match serde_json::from_str(args_str) {
        Ok(v) => v,
        Err(e) => {
            let r = result_err(
                cmd,
                "-",
                &new_run_id(),
                0,
                ErrorCode::InvalidInput,
                format!("invalid JSON args: {}", e),
            );
            output_result(&r, json);
            return;
        }
    };
    let r = registry.execute(cmd, args, ctx).await;
    output_result(&r, json);
}

async fn cmd_run_scenario(
    file: &Path,
    json: bool,
    ctx: &SimContext,
    registry: &CommandRegistry,
) {
    let target = file.display().to_string();
    let yaml = match std::fs::read_to_string(file) {
        Ok(s) => s,
        Err(e) => {
            let r = result_err(
                "run-scenario",
                &target,
                &new_run_id(),
                0,
                ErrorCode::IoError,
                format!("cannot read scenario file: {}", e),
            );
            output_result(&r, json);
            return;
        }
    };

    let scenario = match locsim_engine::scenario::load_scenario(&yaml) {
        Ok(s) => s,
        Err(e) => {
            let r = result_err(
                "run-scenario",
                &target,
                &new_run_id(),
                0,
                ErrorCode::InvalidInput,
                e,
            );
            output_result(&r, json);
            return;
        }
    };

    let result = locsim_engine::scenario::run_scenario(&scenario, ctx, registry).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&result).unwrap_or_default());
    } else {
        println!("Scenario: {}", result.name.as_deref().unwrap_or("<unnamed>"));
        println!("Overall: {:?}", result.overall_status);
        for (i, sr) in result.step_results.iter().enumerate() {
            let message = sr.error.as_ref().map(|e| e.message.as_str()).unwrap_or("");
            println!(
                "  Step {}: {} {} -> {:?} ({}ms) {}",
                i, sr.command, sr.target, sr.status, sr.timing_ms.total, message
            );
        }
    }

    if result.overall_status != Status::Pass {
        std::process::exit(1);
    }
}

// ===========================================================================
// Output helpers
// ===========================================================================

fn output_result(result: &OperationResult, json: bool) {
    if json {
        println!("{}", serde_json::to_string_pretty(result).unwrap_or_default());
    } else {
        print_human(result);
    }

    match result.status {
        Status::Pass | Status::Skip => {}
        Status::Fail => std::process::exit(1),
        Status::Error => std::process::exit(2),
    }
}

fn print_human(r: &OperationResult) {
    let status = match r.status {
        Status::Pass => "PASS",
        Status::Fail => "FAIL",
        Status::Skip => "SKIP",
        Status::Error => "ERROR",
    };

    println!("[{}] {} {}", status, r.command, r.target);
    println!("  run_id: {}", r.run_id);
    println!("  timing: {}ms", r.timing_ms.total);

    if let Some(ref err) = r.error {
        println!("  error:  {} – {}", err.code, err.message);
    }

    if let Some(ref data) = r.data {
        if let Ok(s) = serde_json::to_string_pretty(data) {
            for line in s.lines() {
                println!("  {}", line);
            }
        }
    }
}

fn write_result_file(path: &Path, result: &OperationResult) {
    let j = serde_json::to_string_pretty(result).unwrap_or_default();
    if let Err(e) = std::fs::write(path, &j) {
        eprintln!(
            "warning: failed to write result to {}: {}",
            path.display(),
            e
        );
    }
}
