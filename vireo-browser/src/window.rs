use serde::{Deserialize, Serialize};

use crate::split::{HealOutcome, SplitState};
use crate::tab::{SpaceId, TabId, WindowId};

pub const MIN_SIDEBAR_WIDTH: f64 = 180.0;
pub const MAX_SIDEBAR_WIDTH: f64 = 480.0;
pub const DEFAULT_SIDEBAR_WIDTH: f64 = 260.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowState {
    pub id: WindowId,
    pub current_tab: Option<TabId>,
    pub current_space: SpaceId,
    pub sidebar_visible: bool,
    pub sidebar_width: f64,
    /// Bumped whenever the compositor must rebuild even if its other
    /// inputs look unchanged.
    pub compositor_version: u64,
    pub split: SplitState,
}

impl WindowState {
    pub fn new(id: WindowId, space: SpaceId) -> Self {
        Self {
            id,
            current_tab: None,
            current_space: space,
            sidebar_visible: true,
            sidebar_width: DEFAULT_SIDEBAR_WIDTH,
            compositor_version: 0,
            split: SplitState::default(),
        }
    }

    pub fn bump_version(&mut self) {
        self.compositor_version = self.compositor_version.wrapping_add(1);
    }

    pub fn set_sidebar_width(&mut self, width: f64) -> f64 {
        if !width.is_nan() {
            self.sidebar_width = width.clamp(MIN_SIDEBAR_WIDTH, MAX_SIDEBAR_WIDTH);
        }
        self.sidebar_width
    }

    pub fn toggle_sidebar(&mut self) -> bool {
        self.sidebar_visible = !self.sidebar_visible;
        self.sidebar_visible
    }

    /// Collapse the split to `keep`, which becomes the focused tab.
    pub fn exit_split(&mut self, keep: Option<TabId>) {
        self.split.exit();
        if let Some(keep) = keep {
            self.current_tab = Some(keep);
        }
        self.bump_version();
    }

    /// Heal the split against the set of live tabs and fix focus afterwards.
    pub fn heal_split(&mut self, is_live: impl Fn(TabId) -> bool) -> HealOutcome {
        let outcome = self.split.heal(&is_live);
        match outcome {
            HealOutcome::Collapsed { survivor } => {
                log::info!("Window {}: split pane closed, keeping tab {}", self.id, survivor);
                self.current_tab = Some(survivor);
                self.bump_version();
            }
            HealOutcome::Exited => {
                log::info!("Window {}: both split panes gone, leaving split view", self.id);
                if self.current_tab.is_some_and(|t| !is_live(t)) {
                    self.current_tab = None;
                }
                self.bump_version();
            }
            HealOutcome::Deferred => {
                log::debug!("Window {}: split heal deferred until drag ends", self.id);
            }
            HealOutcome::Unchanged => {}
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sidebar_width_is_clamped() {
        let mut w = WindowState::new(WindowId(1), SpaceId(1));
        assert_eq!(w.set_sidebar_width(10.0), MIN_SIDEBAR_WIDTH);
        assert_eq!(w.set_sidebar_width(300.0), 300.0);
        assert_eq!(w.set_sidebar_width(f64::NAN), 300.0);
        assert_eq!(w.set_sidebar_width(9000.0), MAX_SIDEBAR_WIDTH);
        assert!(!w.toggle_sidebar());
    }

    #[test]
    fn heal_focuses_the_survivor_and_bumps_version() {
        let mut w = WindowState::new(WindowId(1), SpaceId(1));
        w.split.enter(TabId(1), TabId(2)).unwrap();
        w.current_tab = Some(TabId(2));
        let outcome = w.heal_split(|t| t == TabId(1));
        assert_eq!(outcome, HealOutcome::Collapsed { survivor: TabId(1) });
        assert_eq!(w.current_tab, Some(TabId(1)));
        assert_eq!(w.compositor_version, 1);
    }
}
