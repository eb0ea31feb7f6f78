//! Model loading and strategy assembly.

use std::{collections::HashMap, path::Path, sync::Arc};

use anyhow::{Context, Result};
use ml_core::{
    DetectError, DetectionStrategy, DetectorModel, FusionStrategy, load_model, read_labels,
};
use tracing::{info, warn};
use vision::RiskEngine;

use crate::cli::DetectorConfig;

type Loader =
    dyn Fn(&Path, Option<HashMap<i64, String>>) -> Result<Arc<dyn DetectorModel>, DetectError>;

/// Load the configured models and wrap them in a [`RiskEngine`].
pub fn build_engine(config: &DetectorConfig) -> Result<RiskEngine> {
    let fusion = build_fusion(config, &load_model)?;
    Ok(RiskEngine::new(fusion, config.risk.clone()))
}

/// The primary model is required. A secondary model that fails to load is
/// logged and left out.
pub(crate) fn build_fusion(config: &DetectorConfig, loader: &Loader) -> Result<FusionStrategy> {
    let labels = config
        .labels
        .as_deref()
        .map(read_labels)
        .transpose()
        .context("reading primary labels")?;
    let primary = loader(&config.model, labels)
        .with_context(|| format!("loading primary model {}", config.model.display()))?;
    info!(model = %config.model.display(), classes = primary.names().len(), "primary detector ready");

    let secondary = config
        .secondary_model
        .as_deref()
        .and_then(|path| match load_secondary(config, path, loader) {
            Ok(model) => {
                info!(model = %path.display(), "secondary detector ready");
                Some(DetectionStrategy::secondary(model, config.risk.label_map()))
            }
            Err(err) => {
                warn!(model = %path.display(), "secondary detector disabled: {err:#}");
                None
            }
        });

    Ok(FusionStrategy::new(DetectionStrategy::primary(primary), secondary)
        .with_iou_threshold(config.fusion_iou))
}

fn load_secondary(
    config: &DetectorConfig,
    path: &Path,
    loader: &Loader,
) -> Result<Arc<dyn DetectorModel>> {
    let labels = config
        .secondary_labels
        .as_deref()
        .map(read_labels)
        .transpose()?;
    Ok(loader(path, labels)?)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use ml_core::{PredictOptions, RawBox};
    use video_ingest::Frame;
    use vision::RiskConfig;

    use super::*;

    struct Named(HashMap<i64, String>);

    impl DetectorModel for Named {
        fn predict(&self, _: &Frame, _: &PredictOptions) -> Result<Vec<RawBox>, DetectError> {
            Ok(Vec::new())
        }

        fn names(&self) -> &HashMap<i64, String> {
            &self.0
        }
    }

    fn config(secondary: Option<&str>) -> DetectorConfig {
        DetectorConfig {
            model: PathBuf::from("primary.pt"),
            labels: None,
            secondary_model: secondary.map(PathBuf::from),
            secondary_labels: None,
            fusion_iou: ml_core::FUSION_IOU,
            risk: RiskConfig::default(),
        }
    }

    fn loader(
        path: &Path,
        labels: Option<HashMap<i64, String>>,
    ) -> Result<Arc<dyn DetectorModel>, DetectError> {
        if path.ends_with("missing.pt") {
            return Err(DetectError::Load {
                path: path.to_path_buf(),
                reason: "file not found".into(),
            });
        }
        Ok(Arc::new(Named(labels.unwrap_or_default())))
    }

    #[test]
    fn secondary_failure_is_not_fatal() {
        let fusion = build_fusion(&config(Some("missing.pt")), &loader).unwrap();
        assert_eq!(fusion.strategies().len(), 1);

        let fusion = build_fusion(&config(Some("coco.pt")), &loader).unwrap();
        assert_eq!(fusion.strategies().len(), 2);
    }

    #[test]
    fn fusion_overlap_comes_from_config() {
        let fusion = build_fusion(&config(None), &loader).unwrap();
        assert_eq!(fusion.iou_threshold(), ml_core::FUSION_IOU);

        let mut cfg = config(None);
        cfg.fusion_iou = 0.7;
        assert_eq!(build_fusion(&cfg, &loader).unwrap().iou_threshold(), 0.7);
    }

    #[test]
    fn primary_failure_is_fatal() {
        let mut cfg = config(None);
        cfg.model = PathBuf::from("missing.pt");
        assert!(build_fusion(&cfg, &loader).is_err());
    }

    #[test]
    fn primary_labels_come_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let labels = dir.path().join("labels.txt");
        std::fs::write(&labels, "nino\ncuchillo\n").unwrap();
        let mut cfg = config(None);
        cfg.labels = Some(labels);
        let fusion = build_fusion(&cfg, &loader).unwrap();
        assert_eq!(fusion.strategies().len(), 1);

        cfg.labels = Some(dir.path().join("absent.txt"));
        assert!(build_fusion(&cfg, &loader).is_err());
    }
}
