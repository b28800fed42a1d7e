//! Per-window split view: two tabs side by side with a draggable divider.

use serde::{Deserialize, Serialize};

use crate::tab::TabId;

pub const MIN_FRACTION: f64 = 0.2;
pub const MAX_FRACTION: f64 = 0.8;
pub const DEFAULT_FRACTION: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub fn other(self) -> Side {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }
}

/// Clamp a requested divider position. NaN keeps `current`.
pub fn clamp_fraction(current: f64, requested: f64) -> f64 {
    if requested.is_nan() {
        return current;
    }
    requested.clamp(MIN_FRACTION, MAX_FRACTION)
}

/// What a heal pass did to the split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum HealOutcome {
    Unchanged,
    /// A pane died during a drag; the heal runs when the drag ends.
    Deferred,
    /// One pane died; the other is now the sole pane.
    Collapsed { survivor: TabId },
    /// Both panes died.
    Exited,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitState {
    panes: Option<(TabId, TabId)>,
    fraction: f64,
    active_side: Side,
    preview_active: bool,
    heal_deferred: bool,
}

impl Default for SplitState {
    fn default() -> Self {
        Self {
            panes: None,
            fraction: DEFAULT_FRACTION,
            active_side: Side::Left,
            preview_active: false,
            heal_deferred: false,
        }
    }
}

impl SplitState {
    pub fn is_split(&self) -> bool {
        self.panes.is_some()
    }

    pub fn panes(&self) -> Option<(TabId, TabId)> {
        self.panes
    }

    pub fn pane(&self, side: Side) -> Option<TabId> {
        self.panes.map(|(left, right)| match side {
            Side::Left => left,
            Side::Right => right,
        })
    }

    pub fn fraction(&self) -> f64 {
        self.fraction
    }

    pub fn active_side(&self) -> Side {
        self.active_side
    }

    pub fn active_tab(&self) -> Option<TabId> {
        self.pane(self.active_side)
    }

    pub fn is_previewing(&self) -> bool {
        self.preview_active
    }

    pub fn heal_deferred(&self) -> bool {
        self.heal_deferred
    }

    pub fn side_of(&self, tab: TabId) -> Option<Side> {
        match self.panes {
            Some((left, _)) if left == tab => Some(Side::Left),
            Some((_, right)) if right == tab => Some(Side::Right),
            _ => None,
        }
    }

    pub fn contains(&self, tab: TabId) -> bool {
        self.side_of(tab).is_some()
    }

    pub fn enter(&mut self, left: TabId, right: TabId) -> Result<(), String> {
        if left == right {
            return Err(format!("Cannot split tab {} with itself", left));
        }
        self.panes = Some((left, right));
        self.fraction = clamp_fraction(DEFAULT_FRACTION, self.fraction);
        self.active_side = Side::Left;
        self.preview_active = false;
        self.heal_deferred = false;
        Ok(())
    }

    /// Returns the fraction actually applied.
    pub fn set_divider_fraction(&mut self, requested: f64) -> f64 {
        self.fraction = clamp_fraction(self.fraction, requested);
        self.fraction
    }

    /// Leave split view, returning the former panes.
    pub fn exit(&mut self) -> Option<(TabId, TabId)> {
        self.preview_active = false;
        self.heal_deferred = false;
        self.active_side = Side::Left;
        self.panes.take()
    }

    /// Put `tab` on `side`. If it already occupies the other side the panes
    /// swap instead.
    pub fn assign_pane(&mut self, side: Side, tab: TabId) -> Result<(), String> {
        let Some((left, right)) = self.panes else {
            return Err("Window is not in split view".to_string());
        };
        self.panes = Some(match (side, self.side_of(tab)) {
            (_, Some(current)) if current == side => (left, right),
            (_, Some(_)) => (right, left),
            (Side::Left, None) => (tab, right),
            (Side::Right, None) => (left, tab),
        });
        self.active_side = side;
        Ok(())
    }

    /// Swap the panes, keeping the same tab active.
    pub fn swap_sides(&mut self) {
        if let Some((left, right)) = self.panes {
            self.panes = Some((right, left));
            self.active_side = self.active_side.other();
        }
    }

    pub fn set_active_side(&mut self, side: Side) {
        self.active_side = side;
    }

    pub fn begin_preview(&mut self) {
        self.preview_active = true;
    }

    /// End a drag. Returns `true` when a heal was held back during it.
    pub fn end_preview(&mut self) -> bool {
        self.preview_active = false;
        std::mem::take(&mut self.heal_deferred)
    }

    /// Enforce "at least one pane resolves to a live tab".
    pub fn heal(&mut self, is_live: impl Fn(TabId) -> bool) -> HealOutcome {
        let Some((left, right)) = self.panes else {
            return HealOutcome::Unchanged;
        };
        let (left_live, right_live) = (is_live(left), is_live(right));
        if left_live && right_live {
            return HealOutcome::Unchanged;
        }
        if self.preview_active {
            self.heal_deferred = true;
            return HealOutcome::Deferred;
        }
        self.exit();
        match (left_live, right_live) {
            (true, _) => HealOutcome::Collapsed { survivor: left },
            (_, true) => HealOutcome::Collapsed { survivor: right },
            _ => HealOutcome::Exited,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const A: TabId = TabId(1);
    const B: TabId = TabId(2);
    const C: TabId = TabId(3);

    fn split(left: TabId, right: TabId) -> SplitState {
        let mut s = SplitState::default();
        s.enter(left, right).unwrap();
        s
    }

    #[test]
    fn divider_clamps_and_ignores_nan() {
        let mut s = split(A, B);
        assert_eq!(s.set_divider_fraction(0.05), MIN_FRACTION);
        assert_eq!(s.set_divider_fraction(0.63), 0.63);
        assert_eq!(s.set_divider_fraction(f64::NAN), 0.63);
        assert_eq!(s.set_divider_fraction(f64::INFINITY), MAX_FRACTION);
        assert_eq!(s.set_divider_fraction(f64::NEG_INFINITY), MIN_FRACTION);
    }

    #[test]
    fn cannot_split_a_tab_with_itself() {
        let mut s = SplitState::default();
        assert!(s.enter(A, A).is_err());
        assert!(!s.is_split());
    }

    #[test]
    fn assign_pane_swaps_when_tab_is_on_the_other_side() {
        let mut s = split(A, B);
        s.assign_pane(Side::Left, B).unwrap();
        assert_eq!(s.panes(), Some((B, A)));
        assert_eq!(s.active_side(), Side::Left);

        s.assign_pane(Side::Right, C).unwrap();
        assert_eq!(s.panes(), Some((B, C)));
        assert_eq!(s.active_tab(), Some(C));

        assert!(SplitState::default().assign_pane(Side::Left, A).is_err());
    }

    #[test]
    fn swap_keeps_the_active_tab() {
        let mut s = split(A, B);
        s.set_active_side(Side::Right);
        s.swap_sides();
        assert_eq!(s.panes(), Some((B, A)));
        assert_eq!(s.active_tab(), Some(B));
    }

    #[test]
    fn heal_collapses_to_the_survivor() {
        let mut s = split(A, B);
        assert_eq!(s.heal(|t| t == A), HealOutcome::Collapsed { survivor: A });
        assert!(!s.is_split());

        let mut s = split(A, B);
        assert_eq!(s.heal(|_| false), HealOutcome::Exited);
        assert!(!s.is_split());

        let mut s = split(A, B);
        assert_eq!(s.heal(|_| true), HealOutcome::Unchanged);
        assert!(s.is_split());
    }

    #[test]
    fn heal_waits_for_the_drag_to_end() {
        let mut s = split(A, B);
        s.begin_preview();
        assert_eq!(s.heal(|t| t == A), HealOutcome::Deferred);
        assert!(s.is_split());
        assert!(s.heal_deferred());

        assert!(s.end_preview());
        assert!(!s.heal_deferred());
        assert_eq!(s.heal(|t| t == A), HealOutcome::Collapsed { survivor: A });
    }

    #[test]
    fn entering_resets_drag_state() {
        let mut s = split(A, B);
        s.begin_preview();
        s.heal(|_| false);
        s.enter(B, C).unwrap();
        assert!(!s.is_previewing());
        assert!(!s.heal_deferred());
    }

    proptest! {
        #[test]
        fn fraction_always_within_bounds(values in prop::collection::vec(prop::num::f64::ANY, 1..64)) {
            let mut s = split(A, B);
            for value in values {
                let before = s.fraction();
                let after = s.set_divider_fraction(value);
                prop_assert!((MIN_FRACTION..=MAX_FRACTION).contains(&after));
                if value.is_nan() {
                    prop_assert_eq!(after, before);
                }
            }
        }

        #[test]
        fn heal_leaves_no_dead_pane(left_live: bool, right_live: bool, previewing: bool) {
            let mut s = split(A, B);
            if previewing {
                s.begin_preview();
            }
            let live = |t: TabId| (t == A && left_live) || (t == B && right_live);
            let outcome = s.heal(live);
            if previewing && !(left_live && right_live) {
                prop_assert_eq!(outcome, HealOutcome::Deferred);
                s.end_preview();
                s.heal(live);
            }
            if let Some((l, r)) = s.panes() {
                prop_assert!(live(l) && live(r));
            }
        }
    }
}
