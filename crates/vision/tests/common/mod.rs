#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use image::RgbImage;
use ml_core::{
    DetectError, DetectionStrategy, DetectorModel, FusionStrategy, PredictOptions, RawBox,
};
use video_ingest::Frame;
use vision::{RiskConfig, RiskEngine, RiskEvent, RiskObserver};

pub const CHILD: i64 = 0;
pub const KNIFE: i64 = 1;
pub const TABLE: i64 = 2;
pub const STAIRS: i64 = 3;
pub const RAILING: i64 = 4;

/// Model returning whatever boxes the test scripted last.
pub struct ScriptedModel {
    boxes: Mutex<Vec<RawBox>>,
    names: HashMap<i64, String>,
}

impl ScriptedModel {
    pub fn new() -> Arc<Self> {
        let names = [
            (CHILD, "nino"),
            (KNIFE, "cuchillo"),
            (TABLE, "mesa"),
            (STAIRS, "escaleras"),
            (RAILING, "baranda"),
        ]
        .into_iter()
        .map(|(k, v)| (k, v.to_string()))
        .collect();
        Arc::new(Self {
            boxes: Mutex::new(Vec::new()),
            names,
        })
    }

    pub fn set(&self, boxes: Vec<RawBox>) {
        *self.boxes.lock().unwrap() = boxes;
    }
}

impl DetectorModel for ScriptedModel {
    fn predict(&self, _: &Frame, _: &PredictOptions) -> Result<Vec<RawBox>, DetectError> {
        Ok(self.boxes.lock().unwrap().clone())
    }

    fn names(&self) -> &HashMap<i64, String> {
        &self.names
    }
}

pub fn raw(cls: i64, xyxy: [f32; 4], conf: f32) -> RawBox {
    RawBox { xyxy, conf, cls }
}

pub fn engine_with(model: Arc<ScriptedModel>, config: RiskConfig) -> Arc<RiskEngine> {
    let fusion = FusionStrategy::new(DetectionStrategy::primary(model), None);
    Arc::new(RiskEngine::new(fusion, config))
}

pub fn engine(model: Arc<ScriptedModel>) -> Arc<RiskEngine> {
    engine_with(model, RiskConfig::default())
}

pub fn frame() -> Frame {
    Frame::new(RgbImage::new(640, 480), 1)
}

/// Observer keeping every event it sees.
#[derive(Default)]
pub struct Recorder {
    pub events: Mutex<Vec<RiskEvent>>,
}

impl Recorder {
    pub fn messages(&self) -> Vec<Vec<String>> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.messages.iter().cloned().collect())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.events.lock().unwrap().len()
    }
}

impl RiskObserver for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    fn on_alert(&self, event: &RiskEvent) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}
