use serde::{Serialize, Serializer};

/// Axis-aligned box in integer pixel coordinates with `x1 <= x2`, `y1 <= y2`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BoundingBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BoundingBox {
    /// Returns `None` for inverted corners.
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Option<Self> {
        if x1 > x2 || y1 > y2 {
            return None;
        }
        Some(Self { x1, y1, x2, y2 })
    }

    /// Convert model geometry into a pixel box inside a `width`x`height`
    /// frame. Coordinates are truncated and clamped to the frame; non-finite
    /// or inverted boxes are rejected.
    pub fn from_xyxy(xyxy: [f32; 4], width: u32, height: u32) -> Option<Self> {
        if xyxy.iter().any(|v| !v.is_finite()) {
            return None;
        }
        let max_x = width as i32;
        let max_y = height as i32;
        let x1 = (xyxy[0] as i32).clamp(0, max_x);
        let y1 = (xyxy[1] as i32).clamp(0, max_y);
        let x2 = (xyxy[2] as i32).clamp(0, max_x);
        let y2 = (xyxy[3] as i32).clamp(0, max_y);
        Self::new(x1, y1, x2, y2)
    }

    pub fn width(&self) -> i32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> i32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> i64 {
        i64::from(self.width()) * i64::from(self.height())
    }

    /// Integer center, truncated.
    pub fn center(&self) -> (i32, i32) {
        ((self.x1 + self.x2) / 2, (self.y1 + self.y2) / 2)
    }

    /// Intersection over union. Zero-area boxes never overlap anything.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let area_a = self.area();
        let area_b = other.area();
        if area_a <= 0 || area_b <= 0 {
            return 0.0;
        }
        let ix = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0);
        let iy = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0);
        let inter = i64::from(ix) * i64::from(iy);
        if inter == 0 {
            return 0.0;
        }
        inter as f32 / (area_a + area_b - inter) as f32
    }
}

impl Serialize for BoundingBox {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        [self.x1, self.y1, self.x2, self.y2].serialize(serializer)
    }
}

/// Which detector produced a detection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionSource {
    Primary,
    Secondary,
}

impl DetectionSource {
    pub fn label(self) -> &'static str {
        match self {
            DetectionSource::Primary => "primary",
            DetectionSource::Secondary => "secondary",
        }
    }
}

/// A single labelled, scored object found in a frame.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Detection {
    pub label: String,
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
    #[serde(rename = "conf")]
    pub confidence: f32,
    #[serde(rename = "src")]
    pub source: DetectionSource,
}

impl Detection {
    pub fn new(
        label: impl Into<String>,
        bbox: BoundingBox,
        confidence: f32,
        source: DetectionSource,
    ) -> Self {
        Self {
            label: label.into(),
            bbox,
            confidence,
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x1: i32, y1: i32, x2: i32, y2: i32) -> BoundingBox {
        BoundingBox::new(x1, y1, x2, y2).unwrap()
    }

    #[test]
    fn inverted_boxes_are_rejected() {
        assert!(BoundingBox::new(10, 0, 5, 5).is_none());
        assert!(BoundingBox::from_xyxy([10.0, 10.0, 2.0, 20.0], 100, 100).is_none());
        assert!(BoundingBox::from_xyxy([f32::NAN, 0.0, 2.0, 2.0], 100, 100).is_none());
    }

    #[test]
    fn model_geometry_is_truncated_and_clamped() {
        let b = BoundingBox::from_xyxy([-5.7, 10.9, 120.2, 40.1], 100, 80).unwrap();
        assert_eq!(b, bbox(0, 10, 100, 40));
    }

    #[test]
    fn iou_of_identical_and_disjoint_boxes() {
        let a = bbox(0, 0, 10, 10);
        assert!((a.iou(&a) - 1.0).abs() < f32::EPSILON);
        assert_eq!(a.iou(&bbox(20, 20, 30, 30)), 0.0);
        let half = bbox(5, 0, 15, 10);
        assert!((a.iou(&half) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn degenerate_boxes_have_zero_iou() {
        let line = bbox(0, 0, 10, 0);
        assert_eq!(line.iou(&line), 0.0);
        assert_eq!(line.iou(&bbox(0, 0, 10, 10)), 0.0);
    }

    #[test]
    fn center_truncates() {
        assert_eq!(bbox(100, 100, 140, 180).center(), (120, 140));
        assert_eq!(bbox(0, 0, 3, 3).center(), (1, 1));
    }

    #[test]
    fn detections_serialize_with_wire_names() {
        let det = Detection::new("knife", bbox(1, 2, 3, 4), 0.5, DetectionSource::Secondary);
        let json = serde_json::to_value(&det).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"label": "knife", "box": [1, 2, 3, 4], "conf": 0.5, "src": "secondary"})
        );
    }
}
