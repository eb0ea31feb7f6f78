//! Stall detection for per-source pipeline stages.
//!
//! Capture and inference loops beat once per iteration. A stage that has not
//! beaten for longer than the stall threshold (typically a hung model call)
//! is reported once through the log and the `pipeline_stalled` gauge. Nothing
//! is restarted or interrupted.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tracing::{error, info};

use crate::telemetry;

/// Sleep interval between health checks.
pub const WATCHDOG_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    Capture,
    Inference,
}

impl Stage {
    pub fn label(self) -> &'static str {
        match self {
            Stage::Capture => "capture",
            Stage::Inference => "inference",
        }
    }

    const ALL: [Stage; 2] = [Stage::Capture, Stage::Inference];

    fn index(self) -> usize {
        match self {
            Stage::Capture => 0,
            Stage::Inference => 1,
        }
    }
}

/// Heartbeats of one source's stages, in milliseconds since the epoch.
#[derive(Debug)]
pub struct SourceHealth {
    beats: [AtomicU64; 2],
    stalled: [AtomicBool; 2],
}

impl SourceHealth {
    fn new(now: u64) -> Self {
        Self {
            beats: [AtomicU64::new(now), AtomicU64::new(now)],
            stalled: [AtomicBool::new(false), AtomicBool::new(false)],
        }
    }

    pub fn beat(&self, stage: Stage) {
        self.beats[stage.index()].store(current_millis(), Ordering::Relaxed);
    }

    pub fn last_beat(&self, stage: Stage) -> u64 {
        self.beats[stage.index()].load(Ordering::Relaxed)
    }

    pub fn is_stalled(&self, stage: Stage) -> bool {
        self.stalled[stage.index()].load(Ordering::Relaxed)
    }
}

/// Transition observed by [`HealthRegistry::scan`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HealthChange {
    Stalled { source: String, stage: Stage },
    Recovered { source: String, stage: Stage },
}

#[derive(Debug, Default)]
pub struct HealthRegistry {
    sources: Mutex<HashMap<String, Arc<SourceHealth>>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, source_id: &str) -> Arc<SourceHealth> {
        let health = Arc::new(SourceHealth::new(current_millis()));
        self.lock().insert(source_id.to_string(), health.clone());
        health
    }

    pub fn unregister(&self, source_id: &str) {
        if let Some(health) = self.lock().remove(source_id) {
            for stage in Stage::ALL {
                if health.is_stalled(stage) {
                    stall_gauge(source_id, stage, false);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Compare every heartbeat against `now_ms` and return the stages whose
    /// state flipped since the previous scan.
    pub fn scan(&self, now_ms: u64, threshold: Duration) -> Vec<HealthChange> {
        let threshold_ms = threshold.as_millis() as u64;
        let mut changes = Vec::new();
        for (source, health) in self.lock().iter() {
            for stage in Stage::ALL {
                let stale = now_ms.saturating_sub(health.last_beat(stage)) > threshold_ms;
                let was = health.stalled[stage.index()].swap(stale, Ordering::Relaxed);
                match (was, stale) {
                    (false, true) => changes.push(HealthChange::Stalled {
                        source: source.clone(),
                        stage,
                    }),
                    (true, false) => changes.push(HealthChange::Recovered {
                        source: source.clone(),
                        stage,
                    }),
                    _ => {}
                }
            }
        }
        changes
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<SourceHealth>>> {
        self.sources.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Poll `registry` until `stop` is set, reporting stalls and recoveries.
pub fn spawn_watchdog(
    registry: Arc<HealthRegistry>,
    threshold: Duration,
    stop: Arc<AtomicBool>,
) -> std::io::Result<thread::JoinHandle<()>> {
    telemetry::spawn_thread("vision-watchdog", move || {
        while !stop.load(Ordering::Relaxed) {
            thread::sleep(WATCHDOG_POLL_INTERVAL);
            for change in registry.scan(current_millis(), threshold) {
                match change {
                    HealthChange::Stalled { source, stage } => {
                        error!(
                            %source,
                            "{} stage has not made progress for {threshold:?}",
                            stage.label()
                        );
                        stall_gauge(&source, stage, true);
                    }
                    HealthChange::Recovered { source, stage } => {
                        info!(%source, "{} stage recovered", stage.label());
                        stall_gauge(&source, stage, false);
                    }
                }
            }
        }
    })
}

fn stall_gauge(source: &str, stage: Stage, stalled: bool) {
    metrics::gauge!(
        "pipeline_stalled",
        "source" => source.to_string(),
        "stage" => stage.label()
    )
    .set(if stalled { 1.0 } else { 0.0 });
}

pub(crate) fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stall_is_reported_once_then_recovers() {
        let registry = HealthRegistry::new();
        let health = registry.register("cam1");
        let start = health.last_beat(Stage::Inference);
        let threshold = Duration::from_secs(10);

        assert!(registry.scan(start + 5_000, threshold).is_empty());

        let later = start + 11_000;
        let changes = registry.scan(later, threshold);
        assert!(changes.contains(&HealthChange::Stalled {
            source: "cam1".into(),
            stage: Stage::Inference,
        }));
        assert!(health.is_stalled(Stage::Inference));
        assert!(registry.scan(later + 1_000, threshold).is_empty());

        health.beat(Stage::Inference);
        health.beat(Stage::Capture);
        let now = health.last_beat(Stage::Inference);
        let changes = registry.scan(now, threshold);
        assert_eq!(changes.len(), 2);
        assert!(changes.iter().all(|c| matches!(c, HealthChange::Recovered { .. })));
    }

    #[test]
    fn unregistered_sources_are_not_scanned() {
        let registry = HealthRegistry::new();
        registry.register("a");
        registry.unregister("a");
        assert!(registry.is_empty());
        assert!(registry.scan(u64::MAX, Duration::ZERO).is_empty());
    }
}
