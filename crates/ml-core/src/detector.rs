use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use thiserror::Error;
use video_ingest::Frame;

/// Raw prediction as produced by a model, before label translation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawBox {
    pub xyxy: [f32; 4],
    pub conf: f32,
    pub cls: i64,
}

/// Compute device requested for an inference call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Device {
    #[default]
    Cpu,
    Cuda(usize),
}

/// Per-call inference parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PredictOptions {
    pub confidence: f32,
    pub iou: f32,
    pub device: Device,
    pub max_detections: Option<usize>,
}

impl PredictOptions {
    pub fn new(confidence: f32, iou: f32) -> Self {
        Self {
            confidence,
            iou,
            device: Device::Cpu,
            max_detections: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("model inference failed: {0}")]
    Model(String),
    #[error("failed to load model from {path:?}: {reason}")]
    Load { path: PathBuf, reason: String },
    #[error("no inference backend compiled in; rebuild with the `with-tch` feature")]
    BackendUnavailable,
    #[error("detector panicked: {0}")]
    Panicked(String),
    #[error("unexpected model output: {0}")]
    InvalidOutput(String),
}

/// Object detection model boundary.
///
/// Implementations return boxes in the pixel space of the frame they were
/// given. The class id of every box should be present in [`names`].
///
/// [`names`]: DetectorModel::names
pub trait DetectorModel: Send + Sync {
    fn predict(&self, frame: &Frame, options: &PredictOptions) -> Result<Vec<RawBox>, DetectError>;

    fn names(&self) -> &HashMap<i64, String>;
}

/// The 80 COCO class names in index order, used when a model ships without
/// a label file.
pub const COCO_NAMES: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
    "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
    "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
    "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
    "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich", "orange",
    "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch", "potted plant",
    "bed", "dining table", "toilet", "tv", "laptop", "mouse", "remote", "keyboard", "cell phone",
    "microwave", "oven", "toaster", "sink", "refrigerator", "book", "clock", "vase", "scissors",
    "teddy bear", "hair drier", "toothbrush",
];

pub fn coco_names() -> HashMap<i64, String> {
    COCO_NAMES
        .iter()
        .enumerate()
        .map(|(idx, name)| (idx as i64, (*name).to_string()))
        .collect()
}

/// Read a label file with one class name per line. Blank lines are skipped
/// but still consume an index.
pub fn read_labels(path: &Path) -> Result<HashMap<i64, String>, DetectError> {
    let text = fs::read_to_string(path).map_err(|err| DetectError::Load {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })?;
    Ok(text
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| (idx as i64, line.trim().to_string()))
        .collect())
}

/// Load a detector from disk. `labels` defaults to the COCO names.
#[cfg(feature = "with-tch")]
pub fn load_model(
    path: &Path,
    labels: Option<HashMap<i64, String>>,
) -> Result<Arc<dyn DetectorModel>, DetectError> {
    let names = labels.unwrap_or_else(coco_names);
    let model = crate::torchscript::TorchScriptModel::load(path, names)?;
    Ok(Arc::new(model))
}

/// Load a detector from disk. Always fails without an inference backend.
#[cfg(not(feature = "with-tch"))]
pub fn load_model(
    path: &Path,
    labels: Option<HashMap<i64, String>>,
) -> Result<Arc<dyn DetectorModel>, DetectError> {
    let _ = labels;
    if !path.is_file() {
        return Err(DetectError::Load {
            path: path.to_path_buf(),
            reason: "file not found".into(),
        });
    }
    Err(DetectError::BackendUnavailable)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coco_table_has_the_classes_the_remap_needs() {
        let names = coco_names();
        assert_eq!(names[&0], "person");
        assert_eq!(names[&43], "knife");
        assert_eq!(names[&60], "dining table");
        assert_eq!(names[&76], "scissors");
    }

    #[test]
    fn missing_model_file_is_a_load_error() {
        let err = load_model(Path::new("/nonexistent/model.pt"), None)
            .err()
            .unwrap();
        assert!(matches!(err, DetectError::Load { .. }));
    }
}
