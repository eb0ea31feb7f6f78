use std::{
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use tracing::{debug, error, info, warn};
use video_ingest::{CaptureHandle, Frame, Playback};

use crate::{
    pipeline::session::{SessionFlags, SessionQueues, lock_handle},
    watchdog::{SourceHealth, Stage},
};

/// Consecutive failed reads after a rewind before a looping source gives up.
const MAX_REWIND_FAILURES: u32 = 3;

pub(crate) struct CaptureLoop {
    pub source_id: String,
    pub handle: Arc<Mutex<CaptureHandle>>,
    pub playback: Playback,
    pub period: Duration,
    pub flags: Arc<SessionFlags>,
    pub queues: SessionQueues,
    pub health: Arc<SourceHealth>,
}

impl CaptureLoop {
    /// Read until the source is deactivated or a live source stops
    /// producing. Frames go to both raw queues with drop-oldest semantics.
    pub(crate) fn run(self) {
        let span = tracing::info_span!("capture.loop", source = %self.source_id);
        let _guard = span.enter();
        self.flags.mark_capturing();
        info!("capture started");

        let mut failures = 0u32;
        while self.flags.is_active() {
            self.health.beat(Stage::Capture);
            let started = Instant::now();
            let read = lock_handle(&self.handle).read();
            match read {
                Ok(Some(frame)) => {
                    failures = 0;
                    self.publish(frame);
                }
                outcome if self.playback == Playback::Looping => {
                    if let Err(err) = outcome {
                        debug!("read failed, rewinding: {err}");
                    }
                    failures += 1;
                    if failures > MAX_REWIND_FAILURES {
                        error!("source produced no frames after {MAX_REWIND_FAILURES} rewinds");
                        self.flags.end();
                        break;
                    }
                    if let Err(err) = lock_handle(&self.handle).rewind() {
                        error!("rewind failed: {err}");
                        self.flags.end();
                        break;
                    }
                    continue;
                }
                Ok(None) => {
                    warn!("live source stopped producing frames");
                    self.flags.end();
                    break;
                }
                Err(err) => {
                    warn!("live source read failed: {err}");
                    self.flags.end();
                    break;
                }
            }

            if self.playback == Playback::Looping {
                let spent = started.elapsed();
                if spent < self.period {
                    thread::sleep(self.period - spent);
                }
            }
        }

        lock_handle(&self.handle).release();
        info!("capture stopped");
    }

    fn publish(&self, frame: Frame) {
        let frame = Arc::new(frame);
        self.queues.raw_display.push(frame.clone());
        self.queues.raw_inference.push(frame);
        metrics::counter!("frames_captured_total", "source" => self.source_id.clone()).increment(1);
    }
}
