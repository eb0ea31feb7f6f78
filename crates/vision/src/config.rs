//! Configuration shared by the risk engine, the per-source pipeline and the
//! notification dispatcher.
//!
//! Every struct deserialises with `#[serde(default)]`, so a rules file only
//! needs the fields it overrides.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use ml_core::LabelMap;
use serde::{Deserialize, Serialize};

use crate::error::VisionError;

fn labels(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

/// One proximity rule: a child closer than the proximity threshold to any
/// detection carrying one of `labels` raises `message`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HazardRule {
    /// Rule key used for cooldowns and metrics, e.g. `CHILD_NEAR_KNIFE`.
    pub key: String,
    pub message: String,
    pub labels: BTreeSet<String>,
    /// Seconds between repeated alerts; falls back to the general cooldown.
    #[serde(default)]
    pub cooldown_secs: Option<f64>,
}

impl HazardRule {
    fn new(key: &str, message: &str, synonyms: &[&str]) -> Self {
        Self {
            key: key.to_string(),
            message: message.to_string(),
            labels: labels(synonyms),
            cooldown_secs: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CooldownConfig {
    pub general_secs: f64,
    pub railing_secs: f64,
    pub height_secs: f64,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            general_secs: 5.0,
            railing_secs: 1.0,
            height_secs: 2.0,
        }
    }
}

/// Furniture a child can climb onto, split by the vertical heuristic used.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SurfaceConfig {
    pub table_like: BTreeSet<String>,
    pub chair_like: BTreeSet<String>,
    /// Children whose box area is below this are ignored.
    pub min_child_area: i64,
}

impl Default for SurfaceConfig {
    fn default() -> Self {
        Self {
            table_like: labels(&[
                "bar", "barra", "table", "mesa", "counter", "mostrador", "shelf", "estante",
            ]),
            chair_like: labels(&["chair", "silla", "stool", "taburete"]),
            min_child_area: 40 * 40,
        }
    }
}

/// Rule tables and constants used by the risk engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Minimum confidence per label, inclusive.
    pub thresholds: BTreeMap<String, f32>,
    pub default_threshold: f32,
    pub child_labels: BTreeSet<String>,
    pub proximity_px: f64,
    /// Side of the square cells used to key cooldowns by child position.
    pub grid_px: i32,
    pub cooldowns: CooldownConfig,
    pub hazards: Vec<HazardRule>,
    pub surfaces: SurfaceConfig,
    /// Generic detector label -> domain label.
    pub label_map: BTreeMap<String, String>,
}

pub const RAILING_RULE: &str = "CHILD_NEAR_RAILING";
pub const HIGH_SURFACE_RULE: &str = "CHILD_ON_HIGH_SURFACE";
pub const ZONE_RULE_PREFIX: &str = "CHILD_IN_ZONE_";

impl Default for RiskConfig {
    fn default() -> Self {
        let mut thresholds = BTreeMap::new();
        for label in [
            "knife", "cuchillo", "cocina", "kitchen", "cooker", "olla", "pot", "pan", "horno",
            "oven", "handrail", "baranda", "chair", "silla", "bar", "barra", "table", "mesa",
            "stool", "taburete", "counter", "mostrador", "shelf", "estante", "tijeras", "scissors",
        ] {
            thresholds.insert(label.to_string(), 0.35);
        }
        thresholds.insert("escaleras".into(), 0.30);
        thresholds.insert("stairs".into(), 0.30);
        thresholds.insert("nino".into(), 0.40);
        thresholds.insert("child".into(), 0.40);

        let hazards = vec![
            HazardRule::new("CHILD_NEAR_KNIFE", "NIÑO CERCA DE CUCHILLO!", &["knife", "cuchillo"]),
            HazardRule::new(
                "CHILD_NEAR_STAIRS",
                "NIÑO CERCA DE ESCALERAS!",
                &["stairs", "escaleras"],
            ),
            HazardRule::new(
                "CHILD_NEAR_STOVE",
                "NIÑO CERCA DE ESTUFA/COCINA!",
                &["cooker", "kitchen", "cocina"],
            ),
            HazardRule::new("CHILD_NEAR_POT", "NIÑO CERCA DE OLLA/SARTÉN!", &["pot", "pan", "olla"]),
            HazardRule::new("CHILD_NEAR_OVEN", "NIÑO CERCA DE HORNO!", &["oven", "horno"]),
            HazardRule::new(RAILING_RULE, "NIÑO CERCA DE BARANDA!", &["handrail", "baranda"]),
            HazardRule::new(
                "CHILD_NEAR_SCISSORS",
                "NIÑO CERCA DE TIJERAS!",
                &["scissors", "tijeras"],
            ),
        ];

        let label_map = [
            ("knife", "cuchillo"),
            ("oven", "horno"),
            ("chair", "silla"),
            ("dining table", "mesa"),
            ("table", "mesa"),
            ("person", "nino"),
            ("scissors", "tijeras"),
        ]
        .into_iter()
        .map(|(a, b)| (a.to_string(), b.to_string()))
        .collect();

        Self {
            thresholds,
            default_threshold: 0.25,
            child_labels: labels(&["nino", "child"]),
            proximity_px: 120.0,
            grid_px: 25,
            cooldowns: CooldownConfig::default(),
            hazards,
            surfaces: SurfaceConfig::default(),
            label_map,
        }
    }
}

impl RiskConfig {
    /// Load a JSON rules file; missing fields keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, VisionError> {
        let text = fs::read_to_string(path).map_err(|source| VisionError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: RiskConfig =
            serde_json::from_str(&text).map_err(|source| VisionError::Config {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), VisionError> {
        if self.grid_px <= 0 {
            return Err(VisionError::InvalidConfig("grid_px must be positive".into()));
        }
        if !(self.proximity_px.is_finite() && self.proximity_px > 0.0) {
            return Err(VisionError::InvalidConfig(
                "proximity_px must be a positive number".into(),
            ));
        }
        let cd = &self.cooldowns;
        for secs in [cd.general_secs, cd.railing_secs, cd.height_secs]
            .into_iter()
            .chain(self.hazards.iter().filter_map(|h| h.cooldown_secs))
        {
            if !(secs.is_finite() && secs >= 0.0) {
                return Err(VisionError::InvalidConfig(format!(
                    "cooldown {secs} must be a non-negative number of seconds"
                )));
            }
        }
        Ok(())
    }

    /// Confidence a detection with `label` must reach to be kept.
    pub fn threshold(&self, label: &str) -> f32 {
        self.thresholds
            .get(label)
            .copied()
            .unwrap_or(self.default_threshold)
    }

    pub fn is_child(&self, label: &str) -> bool {
        self.child_labels.contains(label)
    }

    /// Cooldown applied to `rule`.
    pub fn cooldown(&self, rule: &str) -> Duration {
        let secs = if let Some(h) = self.hazards.iter().find(|h| h.key == rule) {
            h.cooldown_secs.unwrap_or_else(|| self.hazard_default_cooldown(rule))
        } else if rule == HIGH_SURFACE_RULE {
            self.cooldowns.height_secs
        } else {
            self.cooldowns.general_secs
        };
        Duration::from_secs_f64(secs.max(0.0))
    }

    fn hazard_default_cooldown(&self, rule: &str) -> f64 {
        if rule == RAILING_RULE {
            self.cooldowns.railing_secs
        } else {
            self.cooldowns.general_secs
        }
    }

    pub fn label_map(&self) -> LabelMap {
        LabelMap::new(self.label_map.clone())
    }
}

/// Optional image conditioning applied before detection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PreprocessMode {
    #[default]
    None,
    Grayscale,
    Equalize,
    GrayscaleEqualize,
}

impl FromStr for PreprocessMode {
    type Err = VisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "off" => Ok(PreprocessMode::None),
            "grayscale" | "gray" => Ok(PreprocessMode::Grayscale),
            "equalize" | "clahe" => Ok(PreprocessMode::Equalize),
            "grayscale-equalize" | "gray-equalize" => Ok(PreprocessMode::GrayscaleEqualize),
            other => Err(VisionError::InvalidConfig(format!(
                "unknown preprocessing mode {other:?}"
            ))),
        }
    }
}

/// Tunables for the per-source capture/inference stages.
#[derive(Clone, Debug, PartialEq)]
pub struct PipelineConfig {
    pub queue_capacity: usize,
    pub inference_timeout: Duration,
    pub join_timeout: Duration,
    pub shutdown_join_timeout: Duration,
    pub fallback_fps: f64,
    pub capture_size: (u32, u32),
    pub preprocess: PreprocessMode,
    pub render_tick: Duration,
    pub stall_threshold: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 2,
            inference_timeout: Duration::from_millis(200),
            join_timeout: Duration::from_secs(1),
            shutdown_join_timeout: Duration::from_millis(800),
            fallback_fps: 25.0,
            capture_size: (640, 480),
            preprocess: PreprocessMode::None,
            render_tick: Duration::from_millis(25),
            stall_threshold: Duration::from_secs(10),
        }
    }
}

/// Outbound notification settings.
#[derive(Clone, Debug, PartialEq)]
pub struct NotifyConfig {
    pub enabled: bool,
    pub max_concurrency: usize,
    pub queue_depth: usize,
    pub image_max_width: u32,
    pub jpeg_quality: u8,
    /// Ring the terminal bell on each alert.
    pub sound: bool,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrency: 2,
            queue_depth: 16,
            image_max_width: 640,
            jpeg_quality: 80,
            sound: true,
        }
    }
}

/// Tracing options for the process-wide subscriber.
#[derive(Clone, Debug, Default)]
pub struct TelemetryOptions {
    /// Write a Chrome trace JSON file capturing pipeline spans.
    pub chrome_trace_path: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn built_in_thresholds() {
        let cfg = RiskConfig::default();
        assert_eq!(cfg.threshold("cuchillo"), 0.35);
        assert_eq!(cfg.threshold("stairs"), 0.30);
        assert_eq!(cfg.threshold("nino"), 0.40);
        assert_eq!(cfg.threshold("giraffe"), 0.25);
    }

    #[test]
    fn cooldowns_follow_rule_class() {
        let cfg = RiskConfig::default();
        assert_eq!(cfg.cooldown("CHILD_NEAR_KNIFE"), Duration::from_secs(5));
        assert_eq!(cfg.cooldown(RAILING_RULE), Duration::from_secs(1));
        assert_eq!(cfg.cooldown(HIGH_SURFACE_RULE), Duration::from_secs(2));
        assert_eq!(cfg.cooldown("CHILD_IN_ZONE_cocina"), Duration::from_secs(5));
    }

    #[test]
    fn partial_rules_file_keeps_defaults() {
        let cfg: RiskConfig =
            serde_json::from_str(r#"{"proximity_px": 80, "cooldowns": {"general_secs": 3}}"#)
                .unwrap();
        assert_eq!(cfg.proximity_px, 80.0);
        assert_eq!(cfg.cooldowns.general_secs, 3.0);
        assert_eq!(cfg.cooldowns.railing_secs, 1.0);
        assert_eq!(cfg.hazards.len(), 7);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn invalid_grid_is_rejected() {
        let cfg = RiskConfig {
            grid_px: 0,
            ..RiskConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn preprocess_modes_parse() {
        assert_eq!("none".parse::<PreprocessMode>().unwrap(), PreprocessMode::None);
        assert_eq!(
            "Grayscale-Equalize".parse::<PreprocessMode>().unwrap(),
            PreprocessMode::GrayscaleEqualize
        );
        assert!("sepia".parse::<PreprocessMode>().is_err());
    }
}
