//! Named polygon zones per source and the point-in-polygon test the zone rule
//! uses.
//!
//! Persisted as `{source_id: {zone_name: [[[x, y], ...], ...]}}` with integer
//! coordinates in the unscaled frame space.

use std::{collections::BTreeMap, fs, path::Path};

use ml_core::BoundingBox;
use serde::{Deserialize, Serialize};

use crate::error::VisionError;

/// Closed polygon with at least three vertices.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<[f64; 2]>", into = "Vec<[i32; 2]>")]
pub struct Polygon(Vec<[i32; 2]>);

impl Polygon {
    pub fn new(points: Vec<[i32; 2]>) -> Result<Self, VisionError> {
        if points.len() < 3 {
            return Err(VisionError::Zone {
                name: String::new(),
                reason: format!("a polygon needs at least 3 points, got {}", points.len()),
            });
        }
        Ok(Self(points))
    }

    pub fn points(&self) -> &[[i32; 2]] {
        &self.0
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        point_in_polygon(x, y, &self.0)
    }
}

impl TryFrom<Vec<[f64; 2]>> for Polygon {
    type Error = VisionError;

    /// Fractional coordinates from hand-edited files are truncated.
    fn try_from(points: Vec<[f64; 2]>) -> Result<Self, Self::Error> {
        Polygon::new(points.into_iter().map(|[x, y]| [x as i32, y as i32]).collect())
    }
}

impl From<Polygon> for Vec<[i32; 2]> {
    fn from(polygon: Polygon) -> Self {
        polygon.0
    }
}

/// Zone name to the polygons that make it up.
pub type ZoneMap = BTreeMap<String, Vec<Polygon>>;

/// Even-odd ray casting towards +x.
///
/// A crossing is counted for an edge when it straddles `y` with the lower
/// endpoint included and the upper excluded, and `x` lies strictly left of
/// the crossing. With image coordinates (y down), points on the left or top
/// edge of an axis-aligned rectangle are inside and points on its right or
/// bottom edge are outside.
pub fn point_in_polygon(x: i32, y: i32, poly: &[[i32; 2]]) -> bool {
    let (px, py) = (f64::from(x), f64::from(y));
    let n = poly.len();
    let mut inside = false;
    for i in 0..n {
        let [x1, y1] = poly[i].map(f64::from);
        let [x2, y2] = poly[(i + 1) % n].map(f64::from);
        if (y1 > py) != (y2 > py) && px < (x2 - x1) * (py - y1) / (y2 - y1 + 1e-9) + x1 {
            inside = !inside;
        }
    }
    inside
}

/// Center plus the four corners of a box.
pub fn sample_points(bbox: &BoundingBox) -> [(i32, i32); 5] {
    let (cx, cy) = bbox.center();
    [
        (cx, cy),
        (bbox.x1, bbox.y1),
        (bbox.x2, bbox.y1),
        (bbox.x2, bbox.y2),
        (bbox.x1, bbox.y2),
    ]
}

/// Trimmed, lower-cased zone name. Empty names are rejected.
pub fn normalize_zone_name(name: &str) -> Result<String, VisionError> {
    let normalized = name.trim().to_lowercase();
    if normalized.is_empty() {
        return Err(VisionError::Zone {
            name: name.to_string(),
            reason: "zone name is empty".into(),
        });
    }
    Ok(normalized)
}

/// Map points picked on a display scaled by `scale` back into frame space,
/// clamped to `[0, size - 1]`.
pub fn display_to_frame(points: &[(f64, f64)], scale: f64, frame: (u32, u32)) -> Vec<[i32; 2]> {
    let scale = if scale.is_finite() && scale > 0.0 { scale } else { 1.0 };
    let max_x = frame.0.saturating_sub(1) as i32;
    let max_y = frame.1.saturating_sub(1) as i32;
    points
        .iter()
        .map(|(x, y)| {
            let ox = (x / scale).round_ties_even() as i32;
            let oy = (y / scale).round_ties_even() as i32;
            [ox.clamp(0, max_x), oy.clamp(0, max_y)]
        })
        .collect()
}

/// Zones for every source, in the persisted layout.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ZoneBook(BTreeMap<String, ZoneMap>);

impl ZoneBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> Result<Self, VisionError> {
        let text = fs::read_to_string(path).map_err(|source| VisionError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| VisionError::Config {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), VisionError> {
        let io_err = |source| VisionError::Io {
            path: path.to_path_buf(),
            source,
        };
        let json = serde_json::to_string_pretty(self).map_err(|source| VisionError::Config {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, json).map_err(io_err)
    }

    pub fn zones(&self, source_id: &str) -> Option<&ZoneMap> {
        self.0.get(source_id)
    }

    pub fn sources(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Append a polygon to `name`, creating the zone if needed.
    pub fn add_polygon(
        &mut self,
        source_id: &str,
        name: &str,
        points: Vec<[i32; 2]>,
    ) -> Result<String, VisionError> {
        let name = normalize_zone_name(name)?;
        let polygon = Polygon::new(points).map_err(|err| match err {
            VisionError::Zone { reason, .. } => VisionError::Zone {
                name: name.clone(),
                reason,
            },
            other => other,
        })?;
        self.0
            .entry(source_id.to_string())
            .or_default()
            .entry(name.clone())
            .or_default()
            .push(polygon);
        Ok(name)
    }

    /// Append a polygon drawn on a scaled preview of a `frame`-sized image.
    pub fn add_display_polygon(
        &mut self,
        source_id: &str,
        name: &str,
        display_points: &[(f64, f64)],
        scale: f64,
        frame: (u32, u32),
    ) -> Result<String, VisionError> {
        self.add_polygon(source_id, name, display_to_frame(display_points, scale, frame))
    }

    /// Remove a zone. Returns whether it existed.
    pub fn remove_zone(&mut self, source_id: &str, name: &str) -> bool {
        let Ok(name) = normalize_zone_name(name) else {
            return false;
        };
        let Some(zones) = self.0.get_mut(source_id) else {
            return false;
        };
        let removed = zones.remove(&name).is_some();
        if zones.is_empty() {
            self.0.remove(source_id);
        }
        removed
    }

    pub fn clear(&mut self, source_id: &str) {
        self.0.remove(source_id);
    }

    pub fn replace(&mut self, source_id: &str, zones: ZoneMap) {
        if zones.is_empty() {
            self.0.remove(source_id);
        } else {
            self.0.insert(source_id.to_string(), zones);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square() -> Vec<[i32; 2]> {
        vec![[0, 0], [100, 0], [100, 100], [0, 100]]
    }

    #[test]
    fn centroid_inside_far_point_outside() {
        assert!(point_in_polygon(50, 50, &square()));
        assert!(!point_in_polygon(500, 500, &square()));
        assert!(!point_in_polygon(-10, 50, &square()));
    }

    #[test]
    fn edge_points_follow_half_open_convention() {
        let sq = square();
        assert!(point_in_polygon(0, 50, &sq), "left edge");
        assert!(!point_in_polygon(100, 50, &sq), "right edge");
        assert!(point_in_polygon(50, 0, &sq), "top edge");
        assert!(!point_in_polygon(50, 100, &sq), "bottom edge");
    }

    #[test]
    fn concave_polygon() {
        let l_shape = [[0, 0], [100, 0], [100, 40], [40, 40], [40, 100], [0, 100]];
        assert!(point_in_polygon(20, 80, &l_shape));
        assert!(!point_in_polygon(80, 80, &l_shape));
    }

    #[test]
    fn polygons_need_three_points() {
        let mut book = ZoneBook::new();
        let err = book
            .add_polygon("cam1", "Cocina", vec![[0, 0], [1, 1]])
            .unwrap_err();
        assert!(matches!(err, VisionError::Zone { name, .. } if name == "cocina"));
        assert!(book.zones("cam1").is_none());
    }

    #[test]
    fn names_are_normalized_and_zones_removed() {
        let mut book = ZoneBook::new();
        assert_eq!(book.add_polygon("cam1", "  Cocina ", square()).unwrap(), "cocina");
        book.add_polygon("cam1", "cocina", square()).unwrap();
        assert_eq!(book.zones("cam1").unwrap()["cocina"].len(), 2);
        assert!(book.remove_zone("cam1", "COCINA"));
        assert!(!book.remove_zone("cam1", "cocina"));
        assert!(book.zones("cam1").is_none());
        assert!(book.add_polygon("cam1", "   ", square()).is_err());
    }

    #[test]
    fn display_points_map_back_to_frame_space() {
        let pts = display_to_frame(&[(50.0, 25.0), (-3.0, 700.0), (2.5, 1.5)], 0.5, (640, 480));
        assert_eq!(pts, vec![[100, 50], [0, 479], [5, 3]]);
    }

    #[test]
    fn zone_book_round_trips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zones.json");
        let mut book = ZoneBook::new();
        book.add_polygon("live_1", "escalera", vec![[10, 10], [200, 15], [120, 300]])
            .unwrap();
        book.add_polygon("live_1", "escalera", square()).unwrap();
        book.add_polygon("video_2", "horno", square()).unwrap();
        book.save(&path).unwrap();
        assert_eq!(ZoneBook::load(&path).unwrap(), book);

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["video_2"]["horno"][0][1], serde_json::json!([100, 0]));
    }

    #[test]
    fn loading_rejects_open_polygons() {
        let err = serde_json::from_str::<ZoneBook>(r#"{"cam": {"z": [[[0, 0], [1, 1]]]}}"#);
        assert!(err.is_err());
    }
}
