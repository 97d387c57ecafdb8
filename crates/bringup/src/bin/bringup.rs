//! Bringup CLI
//!
//! Usage:
//!   bringup bringup.yaml
//!   bringup bringup.yaml -a chain:=mainnet --global-timeout 900
//!   bringup bringup.yaml --dry-run
//!   bringup bringup.yaml --report report.json

use bringup::{
    resolve_scheduler_config, Bringup, BringupArgs, LaunchFile, ProcessInvoker, RunReport,
};
use std::sync::Arc;
use tokio::sync::watch;

fn write_report(path: &str, report: &RunReport) {
    let json = match report.to_json() {
        Ok(json) => json,
        Err(e) => {
            log::error!("Failed to serialize run report: {}", e);
            return;
        }
    };
    match std::fs::write(path, json) {
        Ok(()) => log::info!("Run report written to {}", path),
        Err(e) => log::error!("Failed to write run report to '{}': {}", path, e),
    }
}

#[tokio::main]
async fn main() {
    let args: BringupArgs = argh::from_env();

    // Initialize logging
    let log_level = match args.log_level.to_lowercase().as_str() {
        "error" => "error",
        "warn" => "warn",
        "info" => "info",
        "debug" => "debug",
        "trace" => "trace",
        _ => "info",
    };
    let env = env_logger::Env::default().default_filter_or(log_level);
    env_logger::init_from_env(env);

    // Load launch file
    log::info!("Loading launch file: {}", args.launch_file);
    let launch_file = match LaunchFile::from_file(&args.launch_file) {
        Ok(lf) => lf,
        Err(e) => {
            log::error!("Failed to load launch file: {}", e);
            std::process::exit(1);
        }
    };

    let config = resolve_scheduler_config(&launch_file.settings, args.settings_overrides());
    let version = launch_file.version.clone();
    let arg_count = launch_file.args.len();

    let bringup = match Bringup::new(launch_file, args.arg_overrides(), args.node_selection()) {
        Ok(b) => b,
        Err(e) => {
            log::error!("Failed to prepare bring-up: {}", e);
            std::process::exit(1);
        }
    };

    // Validate only mode resolves the whole graph so cycles and
    // condition mismatches are reported too
    if args.validate {
        match bringup.graph() {
            Ok(graph) => {
                println!("Launch file '{}' is valid", args.launch_file);
                println!("  Version: {}", version);
                println!("  Args: {}", arg_count);
                println!("  Nodes: {}", graph.len());
                println!("  Launch order: {}", graph.topological_order().join(", "));
            }
            Err(e) => {
                log::error!("Launch file '{}' is invalid: {}", args.launch_file, e);
                std::process::exit(1);
            }
        }
        return;
    }

    // Dry run mode
    if args.dry_run {
        match bringup.plan(config) {
            Ok(plan) => {
                println!("{}", plan);
            }
            Err(e) => {
                log::error!("Failed to generate launch plan: {}", e);
                std::process::exit(1);
            }
        }
        return;
    }

    // Create interrupt channel
    let (interrupt_tx, interrupt_rx) = watch::channel(());

    // Set up Ctrl+C handler
    {
        let interrupt_tx = interrupt_tx.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            log::info!("Received Ctrl+C, cancelling bring-up...");
            let _ = interrupt_tx.send(());
        }) {
            log::warn!("Failed to install Ctrl+C handler: {}", e);
        }
    }

    let invoker = Arc::new(ProcessInvoker::new());
    let report = match bringup.run(invoker, config, interrupt_rx).await {
        Ok(report) => report,
        Err(e) => {
            log::error!("Bring-up rejected: {}", e);
            std::process::exit(1);
        }
    };

    println!("{}", report);
    if let Some(path) = &args.report {
        write_report(path, &report);
    }

    log::info!("Bringup exiting");
    std::process::exit(report.exit_code());
}
