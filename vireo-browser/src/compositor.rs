//! Maps window state onto native rendering surfaces.
//!
//! The compositor owns no surfaces itself; it issues operations against a
//! [`SurfaceHost`] and remembers what it last asked for, so an unchanged
//! window costs nothing to reconcile.

use serde::{Deserialize, Serialize};

use crate::tab::TabId;

/// Width of the gutter between split panes, in points.
pub const DIVIDER_THICKNESS: f64 = 6.0;

/// Divider moves smaller than this do not trigger a rebuild.
pub const FRACTION_EPSILON: f64 = 1e-3;

pub const DEFAULT_MAX_WARM_SURFACES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Left and right pane frames for a divider at `fraction`.
pub fn split_frames(viewport: Viewport, fraction: f64) -> (Frame, Frame) {
    let left_width = ((viewport.width * fraction).round() - DIVIDER_THICKNESS / 2.0).max(0.0);
    let right_x = left_width + DIVIDER_THICKNESS;
    let right_width = (viewport.width - right_x).max(0.0);
    (
        Frame {
            x: 0.0,
            y: 0.0,
            width: left_width,
            height: viewport.height,
        },
        Frame {
            x: right_x,
            y: 0.0,
            width: right_width,
            height: viewport.height,
        },
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CompositorInputs {
    pub panes: Option<(TabId, TabId)>,
    pub fraction: f64,
    pub current: Option<TabId>,
    pub viewport: Viewport,
    pub version: u64,
}

impl CompositorInputs {
    pub fn differs_from(&self, other: &CompositorInputs) -> bool {
        self.panes != other.panes
            || self.current != other.current
            || self.viewport != other.viewport
            || self.version != other.version
            || (self.fraction - other.fraction).abs() > FRACTION_EPSILON
    }

    /// Tabs to show, with their frames. Both panes when the focused tab is
    /// one of them; otherwise the focused tab alone.
    pub fn layout(&self) -> Vec<(TabId, Frame)> {
        let Some(current) = self.current else {
            return Vec::new();
        };
        match self.panes {
            Some((left, right)) if current == left || current == right => {
                let (left_frame, right_frame) = split_frames(self.viewport, self.fraction);
                vec![(left, left_frame), (right, right_frame)]
            }
            _ => vec![(
                current,
                Frame {
                    x: 0.0,
                    y: 0.0,
                    width: self.viewport.width,
                    height: self.viewport.height,
                },
            )],
        }
    }
}

/// The platform side: owns the actual web views and the drag overlay.
pub trait SurfaceHost {
    fn create_surface(&mut self, tab: TabId);
    fn attach_surface(&mut self, tab: TabId, frame: Frame);
    fn set_frame(&mut self, tab: TabId, frame: Frame);
    fn detach_surface(&mut self, tab: TabId);
    fn destroy_surface(&mut self, tab: TabId);
    fn raise_overlay(&mut self);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SurfaceOp {
    Create { tab: TabId },
    Attach { tab: TabId, frame: Frame },
    SetFrame { tab: TabId, frame: Frame },
    Detach { tab: TabId },
    Destroy { tab: TabId },
    RaiseOverlay,
}

/// A host that records operations for someone else to replay, e.g. across
/// the FFI boundary.
#[derive(Debug, Default)]
pub struct SurfaceOpLog {
    ops: Vec<SurfaceOp>,
}

impl SurfaceOpLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ops(&self) -> &[SurfaceOp] {
        &self.ops
    }

    pub fn take(&mut self) -> Vec<SurfaceOp> {
        std::mem::take(&mut self.ops)
    }
}

impl SurfaceHost for SurfaceOpLog {
    fn create_surface(&mut self, tab: TabId) {
        self.ops.push(SurfaceOp::Create { tab });
    }

    fn attach_surface(&mut self, tab: TabId, frame: Frame) {
        self.ops.push(SurfaceOp::Attach { tab, frame });
    }

    fn set_frame(&mut self, tab: TabId, frame: Frame) {
        self.ops.push(SurfaceOp::SetFrame { tab, frame });
    }

    fn detach_surface(&mut self, tab: TabId) {
        self.ops.push(SurfaceOp::Detach { tab });
    }

    fn destroy_surface(&mut self, tab: TabId) {
        self.ops.push(SurfaceOp::Destroy { tab });
    }

    fn raise_overlay(&mut self) {
        self.ops.push(SurfaceOp::RaiseOverlay);
    }
}

#[derive(Debug)]
pub struct Compositor {
    last: Option<CompositorInputs>,
    attached: Vec<(TabId, Frame)>,
    /// Surfaces that exist, least recently displayed first.
    created: Vec<TabId>,
    max_warm_surfaces: usize,
    rebuilds: u64,
}

impl Default for Compositor {
    fn default() -> Self {
        Self::new()
    }
}

impl Compositor {
    pub fn new() -> Self {
        Self::with_max_warm_surfaces(DEFAULT_MAX_WARM_SURFACES)
    }

    /// `max_warm` bounds how many detached surfaces are kept alive.
    pub fn with_max_warm_surfaces(max_warm: usize) -> Self {
        Self {
            last: None,
            attached: Vec::new(),
            created: Vec::new(),
            max_warm_surfaces: max_warm,
            rebuilds: 0,
        }
    }

    pub fn attached_tabs(&self) -> Vec<TabId> {
        self.attached.iter().map(|(tab, _)| *tab).collect()
    }

    /// Every tab that currently owns a surface, attached or warm.
    pub fn surface_tabs(&self) -> Vec<TabId> {
        self.created.clone()
    }

    pub fn has_surface(&self, tab: TabId) -> bool {
        self.created.contains(&tab)
    }

    pub fn rebuild_count(&self) -> u64 {
        self.rebuilds
    }

    /// Force the next `reconcile` to rebuild.
    pub fn invalidate(&mut self) {
        self.last = None;
    }

    /// Bring the host in line with `inputs`. Returns `false` when nothing
    /// meaningful changed since the last rebuild.
    pub fn reconcile(&mut self, inputs: &CompositorInputs, host: &mut dyn SurfaceHost) -> bool {
        if let Some(last) = &self.last {
            if !inputs.differs_from(last) {
                return false;
            }
        }
        self.rebuild(inputs, host);
        self.last = Some(*inputs);
        true
    }

    fn rebuild(&mut self, inputs: &CompositorInputs, host: &mut dyn SurfaceHost) {
        let desired = inputs.layout();
        log::debug!(
            "Compositor rebuild #{}: {:?} (version {})",
            self.rebuilds + 1,
            desired.iter().map(|(tab, _)| *tab).collect::<Vec<_>>(),
            inputs.version
        );

        let previous = std::mem::take(&mut self.attached);
        for (tab, _) in &previous {
            if !desired.iter().any(|(t, _)| t == tab) {
                host.detach_surface(*tab);
            }
        }
        for (tab, frame) in &desired {
            if !self.created.contains(tab) {
                host.create_surface(*tab);
            }
            self.touch(*tab);
            if previous.iter().any(|(t, _)| t == tab) {
                host.set_frame(*tab, *frame);
            } else {
                host.attach_surface(*tab, *frame);
            }
        }
        self.attached = desired;

        self.evict_warm(host);
        host.raise_overlay();
        self.rebuilds += 1;
    }

    fn touch(&mut self, tab: TabId) {
        self.created.retain(|t| *t != tab);
        self.created.push(tab);
    }

    fn evict_warm(&mut self, host: &mut dyn SurfaceHost) {
        let warm: Vec<TabId> = self
            .created
            .iter()
            .copied()
            .filter(|tab| !self.attached.iter().any(|(t, _)| t == tab))
            .collect();
        if warm.len() <= self.max_warm_surfaces {
            return;
        }
        for tab in &warm[..warm.len() - self.max_warm_surfaces] {
            log::debug!("Evicting warm surface for tab {}", tab);
            host.destroy_surface(*tab);
            self.created.retain(|t| t != tab);
        }
    }

    /// Release a tab's surface to save memory. The tab itself stays open and
    /// gets a fresh surface the next time it is shown.
    pub fn unload(&mut self, tab: TabId, host: &mut dyn SurfaceHost) -> bool {
        if !self.created.contains(&tab) {
            return false;
        }
        if self.attached.iter().any(|(t, _)| *t == tab) {
            host.detach_surface(tab);
            self.attached.retain(|(t, _)| *t != tab);
            self.last = None;
        }
        host.destroy_surface(tab);
        self.created.retain(|t| *t != tab);
        true
    }

    /// Drop everything known about a closed tab.
    pub fn forget(&mut self, tab: TabId, host: &mut dyn SurfaceHost) {
        if self.unload(tab, host) {
            log::debug!("Destroyed surface of closed tab {}", tab);
        }
    }
}
