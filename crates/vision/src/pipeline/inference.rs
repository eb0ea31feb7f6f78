use std::{
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    time::{Duration, Instant},
};

use ml_core::panic_message;
use tracing::{error, info, trace};
use video_ingest::Frame;

use crate::{
    annotation::annotate,
    config::PreprocessMode,
    pipeline::session::{SessionFlags, SessionQueues},
    preprocess::preprocess,
    risk::RiskEngine,
    watchdog::{SourceHealth, Stage},
};

pub(crate) struct InferenceLoop {
    pub source_id: String,
    pub source_name: String,
    pub engine: Arc<RiskEngine>,
    pub preprocess: PreprocessMode,
    pub pop_timeout: Duration,
    pub flags: Arc<SessionFlags>,
    pub queues: SessionQueues,
    pub health: Arc<SourceHealth>,
}

impl InferenceLoop {
    /// Pop, evaluate and annotate frames until the source is deactivated. A
    /// failing frame is logged and skipped.
    pub(crate) fn run(self) {
        info!(source = %self.source_id, "inference started");
        while self.flags.is_active() {
            self.health.beat(Stage::Inference);
            let Some(frame) = self.queues.raw_inference.pop_timeout(self.pop_timeout) else {
                continue;
            };
            let span = tracing::debug_span!(
                "inference.frame",
                source = %self.source_id,
                frame = frame.sequence
            );
            let _guard = span.enter();

            let started = Instant::now();
            match panic::catch_unwind(AssertUnwindSafe(|| self.process(&frame))) {
                Ok(annotated) => {
                    self.queues.annotated.push(Arc::new(annotated));
                    trace!(elapsed_ms = started.elapsed().as_millis() as u64, "frame processed");
                }
                Err(payload) => {
                    error!("frame processing panicked: {}", panic_message(&payload));
                    metrics::counter!("inference_failures_total", "source" => self.source_id.clone())
                        .increment(1);
                }
            }
            metrics::histogram!("inference_frame_seconds", "source" => self.source_id.clone())
                .record(started.elapsed().as_secs_f64());
        }
        info!(source = %self.source_id, "inference stopped");
    }

    fn process(&self, frame: &Frame) -> Frame {
        let prepared = preprocess(frame, self.preprocess);
        let detections = self
            .engine
            .evaluate(&prepared, &self.source_id, &self.source_name);
        annotate(frame, &detections)
    }
}
