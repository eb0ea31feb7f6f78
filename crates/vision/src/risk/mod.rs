//! Risk rules evaluated over fused detections.
//!
//! The [`RiskEngine`] filters detections by per-label confidence, finds
//! children and applies three rule families: proximity to hazards, climbing
//! onto furniture and presence inside user-drawn zones. Each firing is keyed by
//! `(source, rule, grid cell)` and rate limited by a cooldown.

pub mod cooldown;
pub mod engine;
pub mod event;
pub mod surface;
pub mod zones;

pub use cooldown::{CooldownTable, GridCell};
pub use engine::{Firing, RiskEngine, center_distance};
pub use event::{RiskEvent, RiskObserver};
pub use surface::{SurfaceKind, child_on_surface};
pub use zones::{Polygon, ZoneBook, ZoneMap, point_in_polygon, sample_points};
