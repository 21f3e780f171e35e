//! vmchecker-executor - run one submission bundle inside a disposable guest
//!
//! Exit code 0 means the tests ran (whether or not they passed). Exit code 1
//! means the bundle could not be set up or the guest could not be prepared.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, Level};
use vmchecker_core::{run_bundle, vmrun_hypervisor, RunReport};

#[derive(Parser)]
#[command(name = "vmchecker-executor")]
#[command(version = vmchecker_core::VERSION)]
#[command(about = "Run a vmchecker submission bundle inside a virtual machine", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Emit JSON-formatted log lines and print the run report as JSON
    #[arg(long)]
    json: bool,

    /// Bundle directory holding the archive, tests and configuration
    bundle: PathBuf,
}

fn exit_status(result: &vmchecker_core::Result<RunReport>) -> u8 {
    match result {
        Ok(report) if report.success() => 0,
        _ => 1,
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    vmchecker_core::init_tracing(cli.json, level);

    let result = run_bundle(&cli.bundle, vmrun_hypervisor).await;
    match &result {
        Ok(report) if cli.json => println!("{}", serde_json::to_string_pretty(report)?),
        Ok(report) => info!(
            run_id = %report.run_id,
            outcome = ?report.outcome,
            phases = report.phases.len(),
            aborted = report.aborted,
            duration_ms = report.duration_ms,
            "bundle run finished"
        ),
        Err(e) => error!(bundle = %cli.bundle.display(), error = %e, "bundle run not started"),
    }

    Ok(ExitCode::from(exit_status(&result)))
}
