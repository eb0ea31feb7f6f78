mod cli;
mod detectors;
mod live;
mod monitor;
mod server;
mod zones;

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use anyhow::{Context, Result};
use clap::Parser;
use vision::{TelemetryOptions, telemetry};

use crate::cli::{Cli, Command, LiveConfig, MonitorConfig};

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let _telemetry = telemetry::init_tracing(&TelemetryOptions {
        chrome_trace_path: cli.chrome_trace.clone(),
    })?;

    match cli.command {
        Command::Monitor(args) => monitor::run(MonitorConfig::try_from(args)?),
        Command::Live(args) => live::run(LiveConfig::try_from(args)?),
        Command::Zones(args) => zones::run(args),
    }
}

/// Flag raised by Ctrl+C.
pub(crate) fn shutdown_flag() -> Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    let handler_flag = flag.clone();
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::SeqCst);
    })
    .context("failed to install Ctrl+C handler")?;
    Ok(flag)
}
