use std::{
    collections::HashMap,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex, PoisonError, RwLock},
    time::Instant,
};

use chrono::Local;
use ml_core::{BoundingBox, Detection, FusionStrategy, panic_message};
use tracing::{debug, error, info};
use video_ingest::Frame;

use crate::{
    config::{HIGH_SURFACE_RULE, RiskConfig, ZONE_RULE_PREFIX},
    risk::{
        cooldown::{CooldownTable, GridCell},
        event::{RiskEvent, RiskObserver},
        surface::{SurfaceKind, child_on_surface},
        zones::{ZoneMap, sample_points},
    },
};

/// Mutable risk state owned by one source.
#[derive(Debug, Default)]
struct SourceState {
    zones: ZoneMap,
    cooldowns: CooldownTable,
}

/// A rule that fired during one evaluation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Firing {
    pub rule: String,
    pub message: String,
    pub cell: GridCell,
}

/// Applies proximity, climbing and zone rules to fused detections and fans
/// alerts out to observers.
///
/// Each source has its own zones and cooldown table behind a mutex; sources
/// never contend with each other.
pub struct RiskEngine {
    fusion: FusionStrategy,
    config: RiskConfig,
    sources: RwLock<HashMap<String, Arc<Mutex<SourceState>>>>,
    observers: RwLock<Vec<Arc<dyn RiskObserver>>>,
}

impl RiskEngine {
    pub fn new(fusion: FusionStrategy, config: RiskConfig) -> Self {
        Self {
            fusion,
            config,
            sources: RwLock::new(HashMap::new()),
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    pub fn fusion(&self) -> &FusionStrategy {
        &self.fusion
    }

    pub fn subscribe(&self, observer: Arc<dyn RiskObserver>) {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    /// Replace every zone of `source_id`.
    pub fn set_zones(&self, source_id: &str, zones: ZoneMap) {
        let state = self.state(source_id);
        state.lock().unwrap_or_else(PoisonError::into_inner).zones = zones;
    }

    pub fn zones(&self, source_id: &str) -> ZoneMap {
        self.existing_state(source_id)
            .map(|state| state.lock().unwrap_or_else(PoisonError::into_inner).zones.clone())
            .unwrap_or_default()
    }

    /// Drop zones and cooldowns of a removed source.
    pub fn forget_source(&self, source_id: &str) {
        self.sources
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(source_id);
    }

    /// When `rule` last fired for `cell` on `source_id`.
    pub fn last_fired(&self, source_id: &str, rule: &str, cell: GridCell) -> Option<Instant> {
        self.existing_state(source_id).and_then(|state| {
            state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .cooldowns
                .last_fired(rule, cell)
        })
    }

    /// Detect, filter by per-label threshold and apply the rules. Returns the
    /// detections that passed their threshold.
    pub fn evaluate(&self, frame: &Frame, source_id: &str, source_name: &str) -> Vec<Detection> {
        self.evaluate_at(frame, source_id, source_name, Instant::now())
    }

    /// [`evaluate`](Self::evaluate) with an explicit clock.
    pub fn evaluate_at(
        &self,
        frame: &Frame,
        source_id: &str,
        source_name: &str,
        now: Instant,
    ) -> Vec<Detection> {
        let span = tracing::debug_span!("risk.evaluate", source = source_id, frame = frame.sequence);
        let _guard = span.enter();

        let detections = self.filter_by_threshold(self.fusion.detect(frame));
        let firings = self.apply_rules(&detections, source_id, now);
        metrics::histogram!("risk_detections_per_frame").record(detections.len() as f64);

        if !firings.is_empty() {
            let event = RiskEvent {
                source_id: source_id.to_string(),
                source_name: source_name.to_string(),
                messages: firings.iter().map(|f| f.message.clone()).collect(),
                rules: firings.iter().map(|f| f.rule.clone()).collect(),
                frame: Arc::new(frame.clone()),
                timestamp: Local::now(),
            };
            info!(source = source_id, alert = %event.text(), "risk alert");
            self.notify(&event);
        }
        detections
    }

    /// Keep detections whose confidence reaches their label's threshold.
    pub fn filter_by_threshold(&self, detections: Vec<Detection>) -> Vec<Detection> {
        detections
            .into_iter()
            .filter(|d| d.confidence >= self.config.threshold(&d.label))
            .collect()
    }

    /// Evaluate every rule against already filtered detections, arming
    /// cooldowns for the rules that fire.
    pub fn apply_rules(&self, detections: &[Detection], source_id: &str, now: Instant) -> Vec<Firing> {
        let children: Vec<&Detection> = detections
            .iter()
            .filter(|d| self.config.is_child(&d.label))
            .collect();
        if children.is_empty() {
            return Vec::new();
        }

        let state = self.state(source_id);
        let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
        let SourceState { zones, cooldowns } = &mut *state;
        let mut firings = Vec::new();

        self.proximity_rules(&children, detections, cooldowns, now, &mut firings);
        self.surface_rule(&children, detections, cooldowns, now, &mut firings);
        self.zone_rule(&children, zones, cooldowns, now, &mut firings);
        firings
    }

    fn proximity_rules(
        &self,
        children: &[&Detection],
        detections: &[Detection],
        cooldowns: &mut CooldownTable,
        now: Instant,
        firings: &mut Vec<Firing>,
    ) {
        for child in children {
            let cell = GridCell::of(&child.bbox, self.config.grid_px);
            for rule in &self.config.hazards {
                let hit = detections
                    .iter()
                    .filter(|d| rule.labels.contains(&d.label))
                    .find(|d| center_distance(&child.bbox, &d.bbox) < self.config.proximity_px);
                if hit.is_none() {
                    continue;
                }
                let cooldown = self.config.cooldown(&rule.key);
                if cooldowns.try_fire(&rule.key, cell, cooldown, now) {
                    firings.push(Firing {
                        rule: rule.key.clone(),
                        message: rule.message.clone(),
                        cell,
                    });
                } else {
                    debug!(rule = %rule.key, ?cell, "proximity alert suppressed by cooldown");
                }
            }
        }
    }

    fn surface_rule(
        &self,
        children: &[&Detection],
        detections: &[Detection],
        cooldowns: &mut CooldownTable,
        now: Instant,
        firings: &mut Vec<Firing>,
    ) {
        let surfaces = &self.config.surfaces;
        for child in children {
            if child.bbox.area() < surfaces.min_child_area {
                continue;
            }
            let on = detections.iter().find(|s| {
                SurfaceKind::classify(&s.label, surfaces)
                    .is_some_and(|kind| child_on_surface(&child.bbox, &s.bbox, kind))
            });
            let Some(surface) = on else {
                continue;
            };
            let cell = GridCell::of(&child.bbox, self.config.grid_px);
            let cooldown = self.config.cooldown(HIGH_SURFACE_RULE);
            if cooldowns.try_fire(HIGH_SURFACE_RULE, cell, cooldown, now) {
                firings.push(Firing {
                    rule: HIGH_SURFACE_RULE.to_string(),
                    message: format!("¡ALERTA! NIÑO SOBRE {}!", surface.label.to_uppercase()),
                    cell,
                });
            }
        }
    }

    fn zone_rule(
        &self,
        children: &[&Detection],
        zones: &ZoneMap,
        cooldowns: &mut CooldownTable,
        now: Instant,
        firings: &mut Vec<Firing>,
    ) {
        if zones.is_empty() {
            return;
        }
        for child in children {
            let cell = GridCell::of(&child.bbox, self.config.grid_px);
            let samples = sample_points(&child.bbox);
            for (name, polygons) in zones {
                let inside = polygons
                    .iter()
                    .any(|poly| samples.iter().any(|&(x, y)| poly.contains(x, y)));
                if !inside {
                    continue;
                }
                let rule = format!("{ZONE_RULE_PREFIX}{name}");
                let cooldown = self.config.cooldown(&rule);
                if cooldowns.try_fire(&rule, cell, cooldown, now) {
                    firings.push(Firing {
                        message: format!("NIÑO EN ZONA: {}!", name.to_uppercase()),
                        rule,
                        cell,
                    });
                }
            }
        }
    }

    /// Deliver `event` to every observer in registration order.
    fn notify(&self, event: &RiskEvent) {
        let observers: Vec<Arc<dyn RiskObserver>> = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in observers {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| observer.on_alert(event)));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(observer = observer.name(), "observer failed: {err:#}");
                    metrics::counter!("risk_observer_failures_total", "observer" => observer.name().to_string())
                        .increment(1);
                }
                Err(payload) => {
                    error!(
                        observer = observer.name(),
                        "observer panicked: {}",
                        panic_message(&payload)
                    );
                    metrics::counter!("risk_observer_failures_total", "observer" => observer.name().to_string())
                        .increment(1);
                }
            }
        }
    }

    fn state(&self, source_id: &str) -> Arc<Mutex<SourceState>> {
        if let Some(state) = self.existing_state(source_id) {
            return state;
        }
        self.sources
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(source_id.to_string())
            .or_default()
            .clone()
    }

    fn existing_state(&self, source_id: &str) -> Option<Arc<Mutex<SourceState>>> {
        self.sources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(source_id)
            .cloned()
    }
}

/// Euclidean distance between the integer centers of two boxes.
pub fn center_distance(a: &BoundingBox, b: &BoundingBox) -> f64 {
    let (ax, ay) = a.center();
    let (bx, by) = b.center();
    f64::from(ax - bx).hypot(f64::from(ay - by))
}
