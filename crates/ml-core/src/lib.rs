//! Object detection for the monitoring pipeline: the model boundary, the
//! strategies that normalise model output into [`Detection`]s, and the fusion
//! step that merges them.

pub mod detection;
pub mod detector;
pub mod fusion;
pub mod strategy;
#[cfg(feature = "with-tch")]
pub mod torchscript;

pub use detection::{BoundingBox, Detection, DetectionSource};
pub use detector::{
    COCO_NAMES, DetectError, DetectorModel, Device, PredictOptions, RawBox, coco_names,
    load_model, read_labels,
};
pub use fusion::{FUSION_IOU, FusionStrategy, panic_message, suppress_same_label};
pub use strategy::{DetectionStrategy, LabelMap};

#[cfg(feature = "with-tch")]
pub use tch;
