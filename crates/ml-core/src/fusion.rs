use std::panic::{self, AssertUnwindSafe};

use metrics::counter;
use tracing::{error, warn};
use video_ingest::Frame;

use crate::{
    detection::Detection,
    detector::DetectError,
    strategy::DetectionStrategy,
};

/// Overlap above which two same-label detections are considered duplicates.
pub const FUSION_IOU: f32 = 0.5;

/// Runs every strategy on a frame and merges their output.
pub struct FusionStrategy {
    strategies: Vec<DetectionStrategy>,
    iou_threshold: f32,
}

impl FusionStrategy {
    pub fn new(primary: DetectionStrategy, secondary: Option<DetectionStrategy>) -> Self {
        let mut strategies = vec![primary];
        strategies.extend(secondary);
        Self {
            strategies,
            iou_threshold: FUSION_IOU,
        }
    }

    pub fn with_iou_threshold(mut self, iou: f32) -> Self {
        self.iou_threshold = iou;
        self
    }

    pub fn iou_threshold(&self) -> f32 {
        self.iou_threshold
    }

    pub fn strategies(&self) -> &[DetectionStrategy] {
        &self.strategies
    }

    /// Detect with each strategy in order. A strategy that errors or panics
    /// contributes nothing for this frame.
    pub fn detect(&self, frame: &Frame) -> Vec<Detection> {
        let mut all = Vec::new();
        for strategy in &self.strategies {
            let source = strategy.source().label();
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| strategy.detect(frame)))
                .unwrap_or_else(|payload| Err(DetectError::Panicked(panic_message(&payload))));
            match outcome {
                Ok(dets) => all.extend(dets),
                Err(err @ DetectError::Panicked(_)) => {
                    error!(source, frame = frame.sequence, "detection strategy panicked: {err}");
                    counter!("detector_failures_total", "source" => source).increment(1);
                }
                Err(err) => {
                    warn!(source, frame = frame.sequence, "detection strategy failed: {err}");
                    counter!("detector_failures_total", "source" => source).increment(1);
                }
            }
        }
        suppress_same_label(all, self.iou_threshold)
    }
}

/// Greedy same-label NMS. Each unconsumed detection absorbs every later
/// same-label detection overlapping it by more than `iou_threshold`; the most
/// confident member of the group is emitted. Output keeps the order of the
/// group leaders.
pub fn suppress_same_label(dets: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    let mut consumed = vec![false; dets.len()];
    let mut kept = Vec::with_capacity(dets.len());
    for i in 0..dets.len() {
        if consumed[i] {
            continue;
        }
        consumed[i] = true;
        let mut best = i;
        for j in (i + 1)..dets.len() {
            if consumed[j] || dets[j].label != dets[i].label {
                continue;
            }
            if dets[i].bbox.iou(&dets[j].bbox) > iou_threshold {
                consumed[j] = true;
                if dets[j].confidence > dets[best].confidence {
                    best = j;
                }
            }
        }
        kept.push(best);
    }
    let mut slots: Vec<Option<Detection>> = dets.into_iter().map(Some).collect();
    kept.into_iter().filter_map(|idx| slots[idx].take()).collect()
}

/// Best-effort text of a caught panic payload.
pub fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
