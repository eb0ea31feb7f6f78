//! `live` subcommand: detection over frames pushed by remote clients.

use std::{net::TcpListener, sync::Arc};

use anyhow::{Context, Result};
use tracing::info;
use vision::{StreamAlertLog, live::run_listener, telemetry};

use crate::{cli::LiveConfig, detectors, shutdown_flag};

pub fn run(config: LiveConfig) -> Result<()> {
    if let Err(err) = telemetry::init_metrics_recorder() {
        tracing::warn!("metrics disabled: {err:#}");
    }
    let engine = Arc::new(detectors::build_engine(&config.detector)?);
    let alerts = Arc::new(StreamAlertLog::new());
    let listener = TcpListener::bind(config.bind)
        .with_context(|| format!("failed to bind {}", config.bind))?;

    let stop = shutdown_flag()?;
    run_listener(listener, engine, alerts.clone(), stop)?;

    let count = alerts.records().len();
    if let Some(path) = &config.export_csv {
        alerts.export_csv(path)?;
        info!(path = %path.display(), alerts = count, "stream alerts exported");
    }
    info!(alerts = count, "live ingestion stopped");
    Ok(())
}
