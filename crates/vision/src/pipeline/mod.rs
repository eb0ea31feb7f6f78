//! Per-source capture and inference workers.
//!
//! Each source gets a capture thread and an inference thread connected by
//! three drop-oldest queues of capacity two: raw frames for display, raw
//! frames for inference and annotated frames for display. Capture never
//! waits on inference; a slow model only causes older frames to be dropped.

mod capture;
mod inference;
pub mod render;
pub mod session;

use std::{
    collections::BTreeMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Instant,
};

use chrono::Local;
use tracing::{info, warn};
use video_ingest::{CaptureHandle, CaptureOptions, Playback, SourceSpec};

use crate::{
    config::PipelineConfig,
    error::VisionError,
    risk::RiskEngine,
    telemetry,
    watchdog::{self, HealthRegistry},
};

pub use render::{FrameStore, RenderTicker};
pub use session::{SessionQueues, SessionState, SourceInfo, SourceSession};

use capture::CaptureLoop;
use inference::InferenceLoop;
use session::SessionFlags;

/// Owns every running source.
pub struct SourceManager {
    engine: Arc<RiskEngine>,
    config: PipelineConfig,
    health: Arc<HealthRegistry>,
    sessions: Mutex<BTreeMap<String, SourceSession>>,
    watchdog_stop: Arc<AtomicBool>,
    watchdog: Mutex<Option<thread::JoinHandle<()>>>,
}

impl SourceManager {
    pub fn new(engine: Arc<RiskEngine>, config: PipelineConfig) -> Self {
        Self {
            engine,
            config,
            health: Arc::new(HealthRegistry::new()),
            sessions: Mutex::new(BTreeMap::new()),
            watchdog_stop: Arc::new(AtomicBool::new(false)),
            watchdog: Mutex::new(None),
        }
    }

    pub fn engine(&self) -> &Arc<RiskEngine> {
        &self.engine
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn health(&self) -> &Arc<HealthRegistry> {
        &self.health
    }

    /// Start the stall watchdog. Calling it twice is a no-op.
    pub fn start_watchdog(&self) -> anyhow::Result<()> {
        let mut slot = self.watchdog.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(watchdog::spawn_watchdog(
                self.health.clone(),
                self.config.stall_threshold,
                self.watchdog_stop.clone(),
            )?);
        }
        Ok(())
    }

    /// Open `spec` under a generated id (`{kind}_{timestamp}`).
    pub fn add_source(&self, spec: SourceSpec) -> Result<SourceInfo, VisionError> {
        let base = format!(
            "{}_{}",
            spec.kind_tag(),
            Local::now().format("%Y%m%d%H%M%S%6f")
        );
        self.open(base, spec)
    }

    /// Open `spec` under a caller-chosen id, suffixed if already taken.
    pub fn add_named_source(&self, id: &str, spec: SourceSpec) -> Result<SourceInfo, VisionError> {
        self.open(id.to_string(), spec)
    }

    fn open(&self, base_id: String, spec: SourceSpec) -> Result<SourceInfo, VisionError> {
        let options = CaptureOptions {
            target_size: self.config.capture_size,
            fallback_fps: self.config.fallback_fps,
        };
        let handle = CaptureHandle::open(&spec, options)?;
        let playback = spec.playback();
        let frame_period = handle.frame_period();
        let period = match playback {
            Playback::Looping => {
                frame_period.unwrap_or_else(|| video_ingest::frame_period(self.config.fallback_fps))
            }
            Playback::Live => std::time::Duration::ZERO,
        };

        let mut sessions = self.lock();
        let id = unique_id(base_id, |candidate| sessions.contains_key(candidate));
        let display_name = spec.display_name();
        let flags = Arc::new(SessionFlags::new());
        let handle = Arc::new(Mutex::new(handle));
        let queues = SessionQueues::new(self.config.queue_capacity);
        let health = self.health.register(&id);

        let capture = CaptureLoop {
            source_id: id.clone(),
            handle: handle.clone(),
            playback,
            period,
            flags: flags.clone(),
            queues: queues.clone(),
            health: health.clone(),
        };
        let inference = InferenceLoop {
            source_id: id.clone(),
            source_name: display_name.clone(),
            engine: self.engine.clone(),
            preprocess: self.config.preprocess,
            pop_timeout: self.config.inference_timeout,
            flags: flags.clone(),
            queues: queues.clone(),
            health,
        };

        let mut session = SourceSession {
            id: id.clone(),
            display_name,
            uri: spec.uri(),
            playback,
            frame_period: frame_period.or(match playback {
                Playback::Looping => Some(period),
                Playback::Live => None,
            }),
            flags,
            handle,
            queues,
            capture: None,
            inference: None,
        };

        match spawn_workers(&id, capture, inference) {
            Ok((c, i)) => {
                session.capture = Some(c);
                session.inference = Some(i);
            }
            Err(err) => {
                session.stop(self.config.join_timeout);
                self.health.unregister(&id);
                return Err(VisionError::Capture(err.into()));
            }
        }

        let info = session.info();
        info!(source = %id, name = %info.name, uri = %info.uri, "source added");
        metrics::gauge!("active_sources").increment(1.0);
        sessions.insert(id, session);
        Ok(info)
    }

    /// Stop and release `source_id`, forgetting its zones and cooldowns.
    pub fn remove_source(&self, source_id: &str) -> Result<(), VisionError> {
        let session = self.lock().remove(source_id);
        let Some(mut session) = session else {
            return Err(VisionError::UnknownSource(source_id.to_string()));
        };
        session.stop(self.config.join_timeout);
        self.health.unregister(source_id);
        self.engine.forget_source(source_id);
        metrics::gauge!("active_sources").decrement(1.0);
        info!(source = %source_id, "source removed");
        Ok(())
    }

    /// Stop every source and the watchdog. Each source gets the shutdown join
    /// timeout; a stuck worker never blocks the rest.
    pub fn shutdown(&self) {
        let started = Instant::now();
        let sessions = std::mem::take(&mut *self.lock());
        for session in sessions.values() {
            session.flags.deactivate();
        }
        let count = sessions.len();
        for (id, mut session) in sessions {
            session.stop(self.config.shutdown_join_timeout);
            self.health.unregister(&id);
            metrics::gauge!("active_sources").decrement(1.0);
        }

        self.watchdog_stop.store(true, Ordering::Relaxed);
        let watchdog = self.watchdog.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = watchdog {
            let deadline = Instant::now() + self.config.shutdown_join_timeout
                + watchdog::WATCHDOG_POLL_INTERVAL;
            if !session::join_until(handle, deadline) {
                warn!("watchdog did not stop in time");
            }
        }
        info!(sources = count, elapsed_ms = started.elapsed().as_millis() as u64, "pipeline shut down");
    }

    pub fn list(&self) -> Vec<SourceInfo> {
        self.lock().values().map(SourceSession::info).collect()
    }

    pub fn info(&self, source_id: &str) -> Option<SourceInfo> {
        self.lock().get(source_id).map(SourceSession::info)
    }

    pub fn queues(&self, source_id: &str) -> Option<SessionQueues> {
        self.lock().get(source_id).map(|s| s.queues.clone())
    }

    /// Queues of every source, for the render consumer.
    pub fn all_queues(&self) -> Vec<(String, SessionQueues)> {
        self.lock()
            .iter()
            .map(|(id, s)| (id.clone(), s.queues.clone()))
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, SourceSession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for SourceManager {
    fn drop(&mut self) {
        if self.lock().is_empty() {
            self.watchdog_stop.store(true, Ordering::Relaxed);
        } else {
            self.shutdown();
        }
    }
}

fn unique_id(base: String, taken: impl Fn(&str) -> bool) -> String {
    if !taken(&base) {
        return base;
    }
    (2..)
        .map(|n| format!("{base}_{n}"))
        .find(|candidate| !taken(candidate))
        .unwrap_or(base)
}

fn spawn_workers(
    id: &str,
    capture: CaptureLoop,
    inference: InferenceLoop,
) -> std::io::Result<(thread::JoinHandle<()>, thread::JoinHandle<()>)> {
    let capture = telemetry::spawn_thread(format!("capture-{id}"), move || capture.run())?;
    let inference = telemetry::spawn_thread(format!("inference-{id}"), move || inference.run())?;
    Ok((capture, inference))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn colliding_ids_get_a_suffix() {
        let taken = ["video_1", "video_1_2"];
        assert_eq!(unique_id("video_1".into(), |c| taken.contains(&c)), "video_1_3");
        assert_eq!(unique_id("live_1".into(), |c| taken.contains(&c)), "live_1");
    }
}
