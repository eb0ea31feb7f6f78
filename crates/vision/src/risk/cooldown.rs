use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use ml_core::BoundingBox;

/// Coarse position bucket of a detection, used so the same child re-triggers
/// a rule only after its cooldown while other children are unaffected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GridCell {
    pub col: i32,
    pub row: i32,
}

impl GridCell {
    pub fn of(bbox: &BoundingBox, grid_px: i32) -> Self {
        let (cx, cy) = bbox.center();
        let grid = grid_px.max(1);
        Self {
            col: cx.div_euclid(grid),
            row: cy.div_euclid(grid),
        }
    }
}

/// Last firing time per `(rule, cell)` for one source.
///
/// Entries are never evicted; the key space is bounded by the frame size
/// divided by the grid, times the number of rules.
#[derive(Debug, Default)]
pub struct CooldownTable {
    last: HashMap<(String, GridCell), Instant>,
}

impl CooldownTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `rule` may fire again for `cell` at `now`.
    pub fn ready(&self, rule: &str, cell: GridCell, cooldown: Duration, now: Instant) -> bool {
        match self.last.get(&(rule.to_string(), cell)) {
            None => true,
            Some(last) => now >= *last + cooldown,
        }
    }

    pub fn mark(&mut self, rule: &str, cell: GridCell, now: Instant) {
        self.last.insert((rule.to_string(), cell), now);
    }

    /// Check and arm in one step. Returns `true` when the rule fired.
    pub fn try_fire(&mut self, rule: &str, cell: GridCell, cooldown: Duration, now: Instant) -> bool {
        if self.ready(rule, cell, cooldown, now) {
            self.mark(rule, cell, now);
            true
        } else {
            false
        }
    }

    pub fn last_fired(&self, rule: &str, cell: GridCell) -> Option<Instant> {
        self.last.get(&(rule.to_string(), cell)).copied()
    }

    pub fn len(&self) -> usize {
        self.last.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RULE: &str = "CHILD_NEAR_KNIFE";

    #[test]
    fn grid_cell_uses_truncated_center() {
        let bbox = BoundingBox::new(100, 100, 140, 180).unwrap();
        assert_eq!(GridCell::of(&bbox, 25), GridCell { col: 4, row: 5 });
    }

    #[test]
    fn same_cell_is_suppressed_until_cooldown_elapses() {
        let mut table = CooldownTable::new();
        let cell = GridCell { col: 4, row: 5 };
        let cd = Duration::from_secs(5);
        let t0 = Instant::now();
        assert!(table.try_fire(RULE, cell, cd, t0));
        assert!(!table.try_fire(RULE, cell, cd, t0 + Duration::from_secs(2)));
        assert!(table.try_fire(RULE, cell, cd, t0 + Duration::from_secs(5)));
        assert_eq!(table.last_fired(RULE, cell), Some(t0 + Duration::from_secs(5)));
    }

    #[test]
    fn cells_and_rules_are_independent() {
        let mut table = CooldownTable::new();
        let cd = Duration::from_secs(5);
        let t0 = Instant::now();
        assert!(table.try_fire(RULE, GridCell { col: 1, row: 1 }, cd, t0));
        assert!(table.try_fire(RULE, GridCell { col: 8, row: 1 }, cd, t0));
        assert!(table.try_fire("CHILD_NEAR_OVEN", GridCell { col: 1, row: 1 }, cd, t0));
        assert_eq!(table.len(), 3);
    }
}
