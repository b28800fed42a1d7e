//! Central owner of tabs, spaces and windows.
//!
//! Records live in id-keyed maps and refer to each other by id only, so
//! nothing holds a pointer back into the registry.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

use crate::compositor::{Compositor, CompositorInputs, SurfaceHost, Viewport};
use crate::split::{HealOutcome, Side};
use crate::tab::{NavigationEvent, Space, SpaceId, Tab, TabId, TabMembership, WindowId};
use crate::window::WindowState;

const DEFAULT_SPACE_NAME: &str = "Personal";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TabSnapshot {
    pub id: TabId,
    pub title: String,
    pub url: String,
    pub favicon_url: Option<String>,
    pub loading: bool,
    pub is_playing_audio: bool,
    pub has_video: bool,
}

impl From<&Tab> for TabSnapshot {
    fn from(tab: &Tab) -> Self {
        Self {
            id: tab.id,
            title: tab.display_title().to_string(),
            url: tab.url.clone(),
            favicon_url: tab.favicon_url.clone(),
            loading: tab.loading.is_loading(),
            is_playing_audio: tab.is_playing_audio,
            has_video: tab.has_video,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpaceSnapshot {
    pub id: SpaceId,
    pub name: String,
    pub tabs: Vec<TabSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SplitSnapshot {
    pub left: TabId,
    pub right: TabId,
    pub fraction: f64,
    pub active_side: Side,
    pub previewing: bool,
}

/// Everything a frontend needs to draw one window's chrome.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowSnapshot {
    pub id: WindowId,
    pub current_tab: Option<TabId>,
    pub current_space: SpaceId,
    pub sidebar_visible: bool,
    pub sidebar_width: f64,
    pub compositor_version: u64,
    pub split: Option<SplitSnapshot>,
    pub essentials: Vec<TabSnapshot>,
    pub spaces: Vec<SpaceSnapshot>,
}

#[derive(Debug)]
pub struct Browser {
    tabs: HashMap<TabId, Tab>,
    spaces: Vec<Space>,
    essentials: Vec<TabId>,
    windows: BTreeMap<WindowId, WindowState>,
    focused_window: Option<WindowId>,
    next_id: u64,
}

impl Default for Browser {
    fn default() -> Self {
        Self::new()
    }
}

impl Browser {
    pub fn new() -> Self {
        let mut browser = Self {
            tabs: HashMap::new(),
            spaces: Vec::new(),
            essentials: Vec::new(),
            windows: BTreeMap::new(),
            focused_window: None,
            next_id: 1,
        };
        browser.create_space(DEFAULT_SPACE_NAME);
        browser
    }

    fn allocate(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    // ── Lookups ──────────────────────────────────────────────────────────

    /// Resolve across every space and the essentials, not just the
    /// current space.
    pub fn resolve_tab(&self, tab: TabId) -> Option<&Tab> {
        self.tabs.get(&tab)
    }

    pub fn tab_count(&self) -> usize {
        self.tabs.len()
    }

    pub fn window(&self, window: WindowId) -> Option<&WindowState> {
        self.windows.get(&window)
    }

    fn window_mut(&mut self, window: WindowId) -> Result<&mut WindowState, String> {
        self.windows
            .get_mut(&window)
            .ok_or_else(|| format!("Window {} not found", window))
    }

    fn tab_mut(&mut self, tab: TabId) -> Result<&mut Tab, String> {
        self.tabs
            .get_mut(&tab)
            .ok_or_else(|| format!("Tab {} not found", tab))
    }

    fn require_tab(&self, tab: TabId) -> Result<&Tab, String> {
        self.tabs.get(&tab).ok_or_else(|| format!("Tab {} not found", tab))
    }

    pub fn space(&self, space: SpaceId) -> Option<&Space> {
        self.spaces.iter().find(|s| s.id == space)
    }

    fn space_mut(&mut self, space: SpaceId) -> Result<&mut Space, String> {
        self.spaces
            .iter_mut()
            .find(|s| s.id == space)
            .ok_or_else(|| format!("Space {} not found", space))
    }

    pub fn spaces(&self) -> &[Space] {
        &self.spaces
    }

    pub fn essentials(&self) -> &[TabId] {
        &self.essentials
    }

    pub fn focused_window(&self) -> Option<WindowId> {
        self.focused_window
    }

    pub fn window_ids(&self) -> Vec<WindowId> {
        self.windows.keys().copied().collect()
    }

    /// Tabs visible in a window's sidebar: essentials first, then the
    /// current space.
    pub fn visible_tabs(&self, window: WindowId) -> Vec<TabId> {
        let Some(state) = self.windows.get(&window) else {
            return Vec::new();
        };
        let mut tabs = self.essentials.clone();
        if let Some(space) = self.space(state.current_space) {
            tabs.extend(space.tabs.iter().copied());
        }
        tabs
    }

    // ── Windows ──────────────────────────────────────────────────────────

    pub fn open_window(&mut self) -> WindowId {
        let id = WindowId(self.allocate());
        let space = self.spaces.first().map(|s| s.id).unwrap_or(SpaceId(0));
        self.windows.insert(id, WindowState::new(id, space));
        self.focused_window = Some(id);
        log::info!("Opened window {}", id);
        id
    }

    pub fn close_window(&mut self, window: WindowId) -> Result<(), String> {
        self.windows
            .remove(&window)
            .ok_or_else(|| format!("Window {} not found", window))?;
        if self.focused_window == Some(window) {
            self.focused_window = self.windows.keys().next().copied();
        }
        Ok(())
    }

    pub fn focus_window(&mut self, window: WindowId) -> Result<(), String> {
        self.window_mut(window)?;
        self.focused_window = Some(window);
        Ok(())
    }

    pub fn toggle_sidebar(&mut self, window: WindowId) -> Result<bool, String> {
        Ok(self.window_mut(window)?.toggle_sidebar())
    }

    pub fn set_sidebar_width(&mut self, window: WindowId, width: f64) -> Result<f64, String> {
        Ok(self.window_mut(window)?.set_sidebar_width(width))
    }

    // ── Tabs ─────────────────────────────────────────────────────────────

    /// Create a tab without focusing it. Without an explicit membership the
    /// tab joins the window's current space.
    pub fn create_tab(
        &mut self,
        window: WindowId,
        url: &str,
        membership: Option<TabMembership>,
    ) -> Result<TabId, String> {
        let current_space = self.window_mut(window)?.current_space;
        let membership = membership.unwrap_or(TabMembership::Space(current_space));
        if let TabMembership::Space(space) = membership {
            self.space_mut(space)?;
        }

        let id = TabId(self.allocate());
        match membership {
            TabMembership::Space(space) => self.space_mut(space)?.tabs.push(id),
            TabMembership::Essential => self.essentials.push(id),
        }
        self.tabs.insert(id, Tab::new(id, url, membership));
        log::debug!("Created tab {} ({})", id, url);
        Ok(id)
    }

    /// Focus `tab` in `window`, switching spaces if the tab lives elsewhere.
    pub fn select_tab(&mut self, window: WindowId, tab: TabId) -> Result<(), String> {
        let membership = self.require_tab(tab)?.membership;
        let state = self.window_mut(window)?;
        if let TabMembership::Space(space) = membership {
            state.current_space = space;
        }
        state.current_tab = Some(tab);
        if let Some(side) = state.split.side_of(tab) {
            state.split.set_active_side(side);
        }
        Ok(())
    }

    pub fn close_tab(&mut self, tab: TabId) -> Result<(), String> {
        let membership = self.require_tab(tab)?.membership;
        self.tabs.remove(&tab);

        // Neighbour in the same list: next, else previous.
        let siblings: &mut Vec<TabId> = match membership {
            TabMembership::Space(space) => &mut self.space_mut(space)?.tabs,
            TabMembership::Essential => &mut self.essentials,
        };
        let neighbour = match siblings.iter().position(|t| *t == tab) {
            Some(index) => {
                siblings.remove(index);
                siblings
                    .get(index)
                    .or_else(|| index.checked_sub(1).and_then(|i| siblings.get(i)))
                    .copied()
            }
            None => None,
        };

        for state in self.windows.values_mut() {
            if state.current_tab == Some(tab) {
                state.current_tab = neighbour;
                state.bump_version();
            }
        }
        log::debug!("Closed tab {}", tab);

        let windows = self.window_ids();
        for window in windows {
            self.heal_split(window)?;
        }
        Ok(())
    }

    pub fn navigate(&mut self, tab: TabId, url: &str) -> Result<(), String> {
        self.tab_mut(tab)?.navigate(url);
        Ok(())
    }

    pub fn apply_navigation(&mut self, tab: TabId, event: NavigationEvent) -> Result<(), String> {
        self.tab_mut(tab)?.apply(event);
        Ok(())
    }

    pub fn move_tab_to_space(&mut self, tab: TabId, target: TabMembership) -> Result<(), String> {
        let current = self.require_tab(tab)?.membership;
        if current == target {
            return Ok(());
        }
        if let TabMembership::Space(space) = target {
            self.space_mut(space)?;
        }
        match current {
            TabMembership::Space(space) => self.space_mut(space)?.tabs.retain(|t| *t != tab),
            TabMembership::Essential => self.essentials.retain(|t| *t != tab),
        }
        match target {
            TabMembership::Space(space) => self.space_mut(space)?.tabs.push(tab),
            TabMembership::Essential => self.essentials.push(tab),
        }
        self.tab_mut(tab)?.membership = target;
        Ok(())
    }

    // ── Spaces ───────────────────────────────────────────────────────────

    pub fn create_space(&mut self, name: &str) -> SpaceId {
        let id = SpaceId(self.allocate());
        self.spaces.push(Space::new(id, name));
        id
    }

    /// Delete a space, moving its tabs to the first remaining space.
    pub fn delete_space(&mut self, space: SpaceId) -> Result<(), String> {
        if self.spaces.len() <= 1 {
            return Err("Cannot delete the last space".to_string());
        }
        let index = self
            .spaces
            .iter()
            .position(|s| s.id == space)
            .ok_or_else(|| format!("Space {} not found", space))?;
        let removed = self.spaces.remove(index);
        let fallback = self.spaces[0].id;

        for tab in &removed.tabs {
            if let Some(record) = self.tabs.get_mut(tab) {
                record.membership = TabMembership::Space(fallback);
            }
        }
        self.spaces[0].tabs.extend(removed.tabs);
        for state in self.windows.values_mut() {
            if state.current_space == space {
                state.current_space = fallback;
                state.bump_version();
            }
        }
        Ok(())
    }

    pub fn rename_space(&mut self, space: SpaceId, name: &str) -> Result<(), String> {
        self.space_mut(space)?.name = name.to_string();
        Ok(())
    }

    /// Switch the window to `space`. Focus stays on an essential tab;
    /// otherwise it moves to the space's first tab.
    pub fn set_current_space(&mut self, window: WindowId, space: SpaceId) -> Result<(), String> {
        let first = self
            .space(space)
            .ok_or_else(|| format!("Space {} not found", space))?
            .tabs
            .first()
            .copied();
        let keep_focus = {
            let state = self.window(window).ok_or_else(|| format!("Window {} not found", window))?;
            state.current_tab.is_some_and(|tab| {
                self.tabs.get(&tab).is_some_and(|t| {
                    t.membership == TabMembership::Essential || t.membership == TabMembership::Space(space)
                })
            })
        };
        let state = self.window_mut(window)?;
        state.current_space = space;
        if !keep_focus {
            state.current_tab = first;
        }
        state.bump_version();
        Ok(())
    }

    // ── Split view ───────────────────────────────────────────────────────

    pub fn enter_split(&mut self, window: WindowId, left: TabId, right: TabId) -> Result<(), String> {
        self.require_tab(left)?;
        self.require_tab(right)?;
        let state = self.window_mut(window)?;
        state.split.enter(left, right)?;
        state.current_tab = Some(left);
        Ok(())
    }

    /// Collapse to a single pane showing the `keep` side, or the active side
    /// when `None`.
    pub fn exit_split(&mut self, window: WindowId, keep: Option<Side>) -> Result<(), String> {
        let state = self.window_mut(window)?;
        if !state.split.is_split() {
            return Ok(());
        }
        let side = keep.unwrap_or(state.split.active_side());
        let tab = state
            .split
            .pane(side)
            .ok_or_else(|| "Split has no panes".to_string())?;
        state.exit_split(Some(tab));
        Ok(())
    }

    pub fn set_divider_fraction(&mut self, window: WindowId, fraction: f64) -> Result<f64, String> {
        Ok(self.window_mut(window)?.split.set_divider_fraction(fraction))
    }

    pub fn assign_pane(&mut self, window: WindowId, side: Side, tab: TabId) -> Result<(), String> {
        self.require_tab(tab)?;
        let state = self.window_mut(window)?;
        state.split.assign_pane(side, tab)?;
        state.current_tab = Some(tab);
        Ok(())
    }

    pub fn swap_split_sides(&mut self, window: WindowId) -> Result<(), String> {
        self.window_mut(window)?.split.swap_sides();
        Ok(())
    }

    pub fn set_active_side(&mut self, window: WindowId, side: Side) -> Result<(), String> {
        let state = self.window_mut(window)?;
        let tab = state
            .split
            .pane(side)
            .ok_or_else(|| "Window is not in split view".to_string())?;
        state.split.set_active_side(side);
        state.current_tab = Some(tab);
        Ok(())
    }

    pub fn begin_split_preview(&mut self, window: WindowId) -> Result<(), String> {
        self.window_mut(window)?.split.begin_preview();
        Ok(())
    }

    /// End a divider drag and run any heal that was held back during it.
    pub fn end_split_preview(&mut self, window: WindowId) -> Result<HealOutcome, String> {
        let deferred = self.window_mut(window)?.split.end_preview();
        if deferred {
            self.heal_split(window)
        } else {
            Ok(HealOutcome::Unchanged)
        }
    }

    pub fn heal_split(&mut self, window: WindowId) -> Result<HealOutcome, String> {
        let tabs = &self.tabs;
        let state = self
            .windows
            .get_mut(&window)
            .ok_or_else(|| format!("Window {} not found", window))?;
        Ok(state.heal_split(|tab| tabs.contains_key(&tab)))
    }

    // ── Compositor ───────────────────────────────────────────────────────

    pub fn compositor_inputs(&self, window: WindowId, viewport: Viewport) -> Result<CompositorInputs, String> {
        let state = self
            .windows
            .get(&window)
            .ok_or_else(|| format!("Window {} not found", window))?;
        Ok(CompositorInputs {
            panes: state.split.panes(),
            fraction: state.split.fraction(),
            current: state.current_tab.filter(|tab| self.tabs.contains_key(tab)),
            viewport,
            version: state.compositor_version,
        })
    }

    /// Heal the window's split, release surfaces of closed tabs, then let
    /// the compositor catch up. Returns whether it rebuilt.
    pub fn reconcile(
        &mut self,
        window: WindowId,
        viewport: Viewport,
        compositor: &mut Compositor,
        host: &mut dyn SurfaceHost,
    ) -> Result<bool, String> {
        self.heal_split(window)?;
        for tab in compositor.surface_tabs() {
            if !self.tabs.contains_key(&tab) {
                compositor.forget(tab, host);
            }
        }
        let inputs = self.compositor_inputs(window, viewport)?;
        Ok(compositor.reconcile(&inputs, host))
    }

    pub fn snapshot(&self, window: WindowId) -> Result<WindowSnapshot, String> {
        let state = self
            .windows
            .get(&window)
            .ok_or_else(|| format!("Window {} not found", window))?;
        let snapshot_tabs = |ids: &[TabId]| -> Vec<TabSnapshot> {
            ids.iter()
                .filter_map(|id| self.tabs.get(id))
                .map(TabSnapshot::from)
                .collect()
        };
        Ok(WindowSnapshot {
            id: state.id,
            current_tab: state.current_tab,
            current_space: state.current_space,
            sidebar_visible: state.sidebar_visible,
            sidebar_width: state.sidebar_width,
            compositor_version: state.compositor_version,
            split: state.split.panes().map(|(left, right)| SplitSnapshot {
                left,
                right,
                fraction: state.split.fraction(),
                active_side: state.split.active_side(),
                previewing: state.split.is_previewing(),
            }),
            essentials: snapshot_tabs(&self.essentials),
            spaces: self
                .spaces
                .iter()
                .map(|space| SpaceSnapshot {
                    id: space.id,
                    name: space.name.clone(),
                    tabs: snapshot_tabs(&space.tabs),
                })
                .collect(),
        })
    }
}
