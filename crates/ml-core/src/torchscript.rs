//! TorchScript YOLO backend.

use std::{collections::HashMap, convert::TryFrom, path::Path, sync::Mutex};

use image::imageops::{self, FilterType};
use tch::{Kind, Tensor};
use tracing::debug;
use video_ingest::Frame;

use crate::{
    detection::BoundingBox,
    detector::{DetectError, DetectorModel, Device, PredictOptions, RawBox},
};

const INPUT_SIZE: u32 = 640;
const MAX_CANDIDATES: usize = 512;

/// Detector running an exported YOLO TorchScript module.
///
/// The module takes a `[1, 3, 640, 640]` float tensor in `[0, 1]` and returns
/// `[1, 4 + C, N]` with centre/size geometry followed by per-class scores.
pub struct TorchScriptModel {
    module: Mutex<tch::CModule>,
    names: HashMap<i64, String>,
}

impl TorchScriptModel {
    pub fn load(path: &Path, names: HashMap<i64, String>) -> Result<Self, DetectError> {
        let mut module =
            tch::CModule::load_on_device(path, tch::Device::Cpu).map_err(|err| DetectError::Load {
                path: path.to_path_buf(),
                reason: err.to_string(),
            })?;
        module.set_eval();
        debug!(path = %path.display(), classes = names.len(), "loaded torchscript detector");
        Ok(Self {
            module: Mutex::new(module),
            names,
        })
    }

    fn frame_to_tensor(frame: &Frame, device: tch::Device) -> Tensor {
        let resized = imageops::resize(&frame.image, INPUT_SIZE, INPUT_SIZE, FilterType::Triangle);
        let side = INPUT_SIZE as i64;
        Tensor::from_slice(resized.as_raw())
            .to_device(device)
            .to_kind(Kind::Float)
            .view([1, side, side, 3])
            .permute([0, 3, 1, 2])
            / 255.0
    }
}

impl DetectorModel for TorchScriptModel {
    fn predict(&self, frame: &Frame, options: &PredictOptions) -> Result<Vec<RawBox>, DetectError> {
        let device = match options.device {
            Device::Cpu => tch::Device::Cpu,
            Device::Cuda(idx) => tch::Device::Cuda(idx),
        };
        let input = Self::frame_to_tensor(frame, device);
        let output = {
            let module = self
                .module
                .lock()
                .map_err(|_| DetectError::Model("torchscript module lock poisoned".into()))?;
            tch::no_grad(|| module.forward_ts(&[input]))
                .map_err(|err| DetectError::Model(err.to_string()))?
        };

        let shape = output.size();
        if shape.len() != 3 || shape[0] != 1 || shape[1] < 5 {
            return Err(DetectError::InvalidOutput(format!(
                "expected [1, 4 + classes, anchors], got {shape:?}"
            )));
        }
        let preds = output
            .to_device(tch::Device::Cpu)
            .to_kind(Kind::Float)
            .squeeze_dim(0)
            .permute([1, 0])
            .contiguous();
        let rows = Vec::<Vec<f32>>::try_from(&preds)
            .map_err(|err| DetectError::InvalidOutput(err.to_string()))?;

        let sx = frame.width() as f32 / INPUT_SIZE as f32;
        let sy = frame.height() as f32 / INPUT_SIZE as f32;
        let mut candidates = Vec::new();
        for row in rows {
            let Some((cls, conf)) = row[4..]
                .iter()
                .copied()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(&b.1))
            else {
                continue;
            };
            if conf < options.confidence {
                continue;
            }
            let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
            candidates.push(RawBox {
                xyxy: [
                    (cx - w / 2.0) * sx,
                    (cy - h / 2.0) * sy,
                    (cx + w / 2.0) * sx,
                    (cy + h / 2.0) * sy,
                ],
                conf,
                cls: cls as i64,
            });
        }
        candidates.sort_by(|a, b| b.conf.total_cmp(&a.conf));
        candidates.truncate(MAX_CANDIDATES);

        let limit = options.max_detections.unwrap_or(usize::MAX);
        Ok(class_nms(candidates, options.iou, limit))
    }

    fn names(&self) -> &HashMap<i64, String> {
        &self.names
    }
}

/// Per-class NMS over confidence-sorted candidates.
fn class_nms(sorted: Vec<RawBox>, iou: f32, limit: usize) -> Vec<RawBox> {
    let mut kept: Vec<RawBox> = Vec::new();
    for cand in sorted {
        if kept.len() >= limit {
            break;
        }
        let overlaps = kept
            .iter()
            .filter(|k| k.cls == cand.cls)
            .any(|k| float_iou(&k.xyxy, &cand.xyxy) > iou);
        if !overlaps {
            kept.push(cand);
        }
    }
    kept
}

fn float_iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let to_box = |v: &[f32; 4]| BoundingBox::new(v[0] as i32, v[1] as i32, v[2] as i32, v[3] as i32);
    match (to_box(a), to_box(b)) {
        (Some(a), Some(b)) => a.iou(&b),
        _ => 0.0,
    }
}
