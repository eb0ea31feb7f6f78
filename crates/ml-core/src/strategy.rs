//! Detection strategies: one model plus the rules that turn its raw output
//! into [`Detection`]s.

use std::{collections::HashMap, sync::Arc};

use tracing::trace;
use video_ingest::Frame;

use crate::{
    detection::{BoundingBox, Detection, DetectionSource},
    detector::{DetectError, DetectorModel, PredictOptions},
};

/// Translation table from generic model labels to domain labels.
/// Labels that are not present are dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelMap(HashMap<String, String>);

impl LabelMap {
    pub fn new(entries: impl IntoIterator<Item = (String, String)>) -> Self {
        Self(
            entries
                .into_iter()
                .map(|(from, to)| (from.to_lowercase(), to.to_lowercase()))
                .collect(),
        )
    }

    /// COCO names translated into the household hazard vocabulary.
    pub fn household() -> Self {
        Self::new(
            [
                ("knife", "cuchillo"),
                ("oven", "horno"),
                ("chair", "silla"),
                ("dining table", "mesa"),
                ("table", "mesa"),
                ("person", "nino"),
                ("scissors", "tijeras"),
            ]
            .into_iter()
            .map(|(a, b)| (a.to_string(), b.to_string())),
        )
    }

    pub fn translate(&self, label: &str) -> Option<&str> {
        self.0.get(label).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Domain-tuned model whose labels are used as-is.
pub struct PrimaryStrategy {
    model: Arc<dyn DetectorModel>,
    options: PredictOptions,
}

/// Generic model whose labels go through a [`LabelMap`].
pub struct SecondaryStrategy {
    model: Arc<dyn DetectorModel>,
    options: PredictOptions,
    labels: LabelMap,
}

/// Closed set of detection strategies.
pub enum DetectionStrategy {
    Primary(PrimaryStrategy),
    Secondary(SecondaryStrategy),
}

impl DetectionStrategy {
    pub fn primary(model: Arc<dyn DetectorModel>) -> Self {
        DetectionStrategy::Primary(PrimaryStrategy {
            model,
            options: PredictOptions::new(0.25, 0.45),
        })
    }

    pub fn secondary(model: Arc<dyn DetectorModel>, labels: LabelMap) -> Self {
        DetectionStrategy::Secondary(SecondaryStrategy {
            model,
            options: PredictOptions::new(0.25, 0.5),
            labels,
        })
    }

    pub fn with_options(mut self, options: PredictOptions) -> Self {
        match &mut self {
            DetectionStrategy::Primary(s) => s.options = options,
            DetectionStrategy::Secondary(s) => s.options = options,
        }
        self
    }

    pub fn source(&self) -> DetectionSource {
        match self {
            DetectionStrategy::Primary(_) => DetectionSource::Primary,
            DetectionStrategy::Secondary(_) => DetectionSource::Secondary,
        }
    }

    pub fn options(&self) -> &PredictOptions {
        match self {
            DetectionStrategy::Primary(s) => &s.options,
            DetectionStrategy::Secondary(s) => &s.options,
        }
    }

    /// Run the model on `frame` and normalise its output. Boxes whose class
    /// has no name, or whose geometry is malformed, are skipped.
    pub fn detect(&self, frame: &Frame) -> Result<Vec<Detection>, DetectError> {
        let (model, options, labels) = match self {
            DetectionStrategy::Primary(s) => (&s.model, &s.options, None),
            DetectionStrategy::Secondary(s) => (&s.model, &s.options, Some(&s.labels)),
        };
        let source = self.source();
        let raw = model.predict(frame, options)?;
        let names = model.names();

        let mut out = Vec::with_capacity(raw.len());
        for rb in raw {
            let Some(name) = names.get(&rb.cls) else {
                trace!(cls = rb.cls, "dropping box with unknown class id");
                continue;
            };
            let name = name.to_lowercase();
            let label = match labels {
                None => name,
                Some(map) => match map.translate(&name) {
                    Some(mapped) => mapped.to_string(),
                    None => continue,
                },
            };
            let Some(bbox) = BoundingBox::from_xyxy(rb.xyxy, frame.width(), frame.height()) else {
                trace!(label, xyxy = ?rb.xyxy, "dropping malformed box");
                continue;
            };
            if !rb.conf.is_finite() {
                continue;
            }
            out.push(Detection::new(label, bbox, rb.conf.clamp(0.0, 1.0), source));
        }
        Ok(out)
    }
}
