//! Heuristic for a child standing or sitting on top of furniture.

use ml_core::BoundingBox;

use crate::config::SurfaceConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SurfaceKind {
    /// Flat tops: tables, bars, counters, shelves.
    TableLike,
    /// Seats: chairs, stools.
    ChairLike,
}

impl SurfaceKind {
    pub fn classify(label: &str, config: &SurfaceConfig) -> Option<Self> {
        if config.table_like.contains(label) {
            Some(SurfaceKind::TableLike)
        } else if config.chair_like.contains(label) {
            Some(SurfaceKind::ChairLike)
        } else {
            None
        }
    }
}

/// Whether `child` appears to be on top of `surface`.
///
/// The child must overlap the surface horizontally by more than 35% of its
/// width, or have its center inside the surface's horizontal span. Then:
/// - table-like: the feet sit near the surface top and the head is above it;
/// - chair-like: the feet sit inside the seat band (15%..75% of its height).
pub fn child_on_surface(child: &BoundingBox, surface: &BoundingBox, kind: SurfaceKind) -> bool {
    let (cw, ch) = (f64::from(child.width()), f64::from(child.height()));
    let (sw, sh) = (f64::from(surface.width()), f64::from(surface.height()));
    if cw <= 0.0 || ch <= 0.0 || sw <= 0.0 || sh <= 0.0 {
        return false;
    }

    let cx = f64::from(child.x1 + child.x2) / 2.0;
    let feet = f64::from(child.y2);
    let head = f64::from(child.y1);
    let (s_x1, s_x2, s_y1) = (
        f64::from(surface.x1),
        f64::from(surface.x2),
        f64::from(surface.y1),
    );
    let overlap = f64::from(child.x2.min(surface.x2) - child.x1.max(surface.x1));
    if !(overlap > cw * 0.35 || (s_x1 < cx && cx < s_x2)) {
        return false;
    }

    match kind {
        SurfaceKind::TableLike => {
            let eff = sh.max(10.0);
            let lo = s_y1 - ch * 0.12;
            let hi = s_y1 + eff * 0.30;
            lo < feet && feet < hi && head < s_y1 + eff * 0.10
        }
        SurfaceKind::ChairLike => {
            let top = s_y1 + sh * 0.15;
            let bottom = s_y1 + sh * 0.75;
            top < feet && feet < bottom && head < bottom
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
    fn child_standing_on_table() {
        let table = bbox(80, 120, 200, 200);
        assert!(child_on_surface(&bbox(100, 50, 140, 130), &table, SurfaceKind::TableLike));
        // Feet well below the top: standing beside it, not on it.
        assert!(!child_on_surface(&bbox(100, 110, 140, 190), &table, SurfaceKind::TableLike));
    }

    #[test]
    fn child_sitting_on_chair() {
        let chair = bbox(90, 100, 150, 180);
        assert!(child_on_surface(&bbox(100, 40, 140, 120), &chair, SurfaceKind::ChairLike));
        assert!(!child_on_surface(&bbox(100, 40, 140, 175), &chair, SurfaceKind::ChairLike));
    }

    #[test]
    fn no_horizontal_overlap_never_matches() {
        let table = bbox(80, 120, 200, 200);
        assert!(!child_on_surface(&bbox(300, 50, 340, 130), &table, SurfaceKind::TableLike));
    }

    #[test]
    fn zero_sized_boxes_never_match() {
        let table = bbox(80, 120, 200, 120);
        assert!(!child_on_surface(&bbox(100, 50, 140, 130), &table, SurfaceKind::TableLike));
    }

    #[test]
    fn labels_are_classified() {
        let cfg = SurfaceConfig::default();
        assert_eq!(SurfaceKind::classify("mesa", &cfg), Some(SurfaceKind::TableLike));
        assert_eq!(SurfaceKind::classify("taburete", &cfg), Some(SurfaceKind::ChairLike));
        assert_eq!(SurfaceKind::classify("horno", &cfg), None);
    }
}
