//! Display consumer driven by a fixed tick.
//!
//! On every tick the ticker takes whatever the display queues hold without
//! blocking and keeps the newest frame per source in a [`FrameStore`]. An
//! empty queue simply leaves the previous frame in place.

use std::{
    collections::HashMap,
    sync::{
        Arc, PoisonError, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use tracing::debug;
use video_ingest::Frame;

use crate::{pipeline::SourceManager, telemetry};

#[derive(Clone, Default)]
struct Latest {
    annotated: Option<Arc<Frame>>,
    raw: Option<Arc<Frame>>,
}

/// Newest displayable frame per source.
#[derive(Default)]
pub struct FrameStore {
    frames: RwLock<HashMap<String, Latest>>,
}

impl FrameStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest annotated frame, or the latest raw frame before inference has
    /// produced one.
    pub fn latest(&self, source_id: &str) -> Option<Arc<Frame>> {
        let frames = self.frames.read().unwrap_or_else(PoisonError::into_inner);
        let latest = frames.get(source_id)?;
        latest.annotated.clone().or_else(|| latest.raw.clone())
    }

    pub fn sources(&self) -> Vec<String> {
        let frames = self.frames.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<String> = frames.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn store(&self, source_id: &str, annotated: Option<Arc<Frame>>, raw: Option<Arc<Frame>>) {
        let mut frames = self.frames.write().unwrap_or_else(PoisonError::into_inner);
        let entry = frames.entry(source_id.to_string()).or_default();
        if annotated.is_some() {
            entry.annotated = annotated;
        }
        if raw.is_some() {
            entry.raw = raw;
        }
    }

    /// Drop entries for sources that are no longer running.
    fn retain(&self, live: &[String]) {
        let mut frames = self.frames.write().unwrap_or_else(PoisonError::into_inner);
        frames.retain(|id, _| live.contains(id));
    }
}

/// Pull from every source's display queues once. Returns how many sources
/// delivered a new frame.
pub fn render_tick(manager: &SourceManager, store: &FrameStore) -> usize {
    let queues = manager.all_queues();
    let ids: Vec<String> = queues.iter().map(|(id, _)| id.clone()).collect();
    let mut updated = 0;
    for (id, q) in &queues {
        let annotated = std::iter::from_fn(|| q.annotated.try_pop()).last();
        let raw = std::iter::from_fn(|| q.raw_display.try_pop()).last();
        if annotated.is_none() && raw.is_none() {
            continue;
        }
        store.store(id, annotated, raw);
        updated += 1;
    }
    store.retain(&ids);
    updated
}

/// Background thread calling [`render_tick`] at a fixed period.
pub struct RenderTicker {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl RenderTicker {
    pub fn spawn(
        manager: Arc<SourceManager>,
        store: Arc<FrameStore>,
        tick: Duration,
    ) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = telemetry::spawn_thread("render-ticker", move || {
            let mut next = Instant::now();
            while !flag.load(Ordering::Relaxed) {
                let updated = render_tick(&manager, &store);
                if updated > 0 {
                    debug!(updated, "render tick");
                }
                next += tick;
                let now = Instant::now();
                if next > now {
                    thread::sleep(next - now);
                } else {
                    next = now;
                }
            }
        })?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RenderTicker {
    fn drop(&mut self) {
        self.halt();
    }
}
