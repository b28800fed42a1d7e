//! JSON command/event protocol spoken with frontends.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::registry::Browser;
use crate::split::Side;
use crate::tab::{NavigationEvent, SpaceId, TabId, TabMembership, WindowId};

pub use crate::compositor::SurfaceOp;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrowserCommand {
    OpenWindow,
    CloseWindow {
        window: WindowId,
    },
    FocusWindow {
        window: WindowId,
    },
    CreateTab {
        window: WindowId,
        url: String,
        #[serde(default)]
        membership: Option<TabMembership>,
        #[serde(default = "default_true")]
        select: bool,
    },
    CloseTab {
        tab: TabId,
    },
    SelectTab {
        window: WindowId,
        tab: TabId,
    },
    Navigate {
        tab: TabId,
        url: String,
    },
    ApplyNavigation {
        tab: TabId,
        event: NavigationEvent,
    },
    MoveTabToSpace {
        tab: TabId,
        membership: TabMembership,
    },
    CreateSpace {
        name: String,
    },
    DeleteSpace {
        space: SpaceId,
    },
    RenameSpace {
        space: SpaceId,
        name: String,
    },
    SetCurrentSpace {
        window: WindowId,
        space: SpaceId,
    },
    ToggleSidebar {
        window: WindowId,
    },
    SetSidebarWidth {
        window: WindowId,
        width: f64,
    },
    EnterSplit {
        window: WindowId,
        left: TabId,
        right: TabId,
    },
    ExitSplit {
        window: WindowId,
        #[serde(default)]
        keep: Option<Side>,
    },
    SetDividerFraction {
        window: WindowId,
        fraction: f64,
    },
    AssignPane {
        window: WindowId,
        side: Side,
        tab: TabId,
    },
    SwapSplitSides {
        window: WindowId,
    },
    SetActiveSide {
        window: WindowId,
        side: Side,
    },
    BeginSplitPreview {
        window: WindowId,
    },
    EndSplitPreview {
        window: WindowId,
    },
    HealSplit {
        window: WindowId,
    },
    Snapshot {
        window: WindowId,
    },
}

/// Requests from the core that only the frontend can fulfil.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrowserEvent {
    EvaluateScript {
        request_id: u64,
        tab: TabId,
        script: String,
    },
}

fn to_json<T: Serialize>(value: T) -> Result<Value, String> {
    serde_json::to_value(value).map_err(|e| e.to_string())
}

impl Browser {
    /// Run one frontend command. Unit operations answer `null`.
    pub fn execute(&mut self, command: BrowserCommand) -> Result<Value, String> {
        match command {
            BrowserCommand::OpenWindow => Ok(serde_json::json!({ "window": self.open_window() })),
            BrowserCommand::CloseWindow { window } => self.close_window(window).map(|_| Value::Null),
            BrowserCommand::FocusWindow { window } => self.focus_window(window).map(|_| Value::Null),
            BrowserCommand::CreateTab {
                window,
                url,
                membership,
                select,
            } => {
                let tab = self.create_tab(window, &url, membership)?;
                if select {
                    self.select_tab(window, tab)?;
                }
                Ok(serde_json::json!({ "tab": tab }))
            }
            BrowserCommand::CloseTab { tab } => self.close_tab(tab).map(|_| Value::Null),
            BrowserCommand::SelectTab { window, tab } => self.select_tab(window, tab).map(|_| Value::Null),
            BrowserCommand::Navigate { tab, url } => self.navigate(tab, &url).map(|_| Value::Null),
            BrowserCommand::ApplyNavigation { tab, event } => {
                self.apply_navigation(tab, event).map(|_| Value::Null)
            }
            BrowserCommand::MoveTabToSpace { tab, membership } => {
                self.move_tab_to_space(tab, membership).map(|_| Value::Null)
            }
            BrowserCommand::CreateSpace { name } => {
                Ok(serde_json::json!({ "space": self.create_space(&name) }))
            }
            BrowserCommand::DeleteSpace { space } => self.delete_space(space).map(|_| Value::Null),
            BrowserCommand::RenameSpace { space, name } => {
                self.rename_space(space, &name).map(|_| Value::Null)
            }
            BrowserCommand::SetCurrentSpace { window, space } => {
                self.set_current_space(window, space).map(|_| Value::Null)
            }
            BrowserCommand::ToggleSidebar { window } => {
                let visible = self.toggle_sidebar(window)?;
                Ok(serde_json::json!({ "sidebar_visible": visible }))
            }
            BrowserCommand::SetSidebarWidth { window, width } => {
                let width = self.set_sidebar_width(window, width)?;
                Ok(serde_json::json!({ "sidebar_width": width }))
            }
            BrowserCommand::EnterSplit { window, left, right } => {
                self.enter_split(window, left, right).map(|_| Value::Null)
            }
            BrowserCommand::ExitSplit { window, keep } => self.exit_split(window, keep).map(|_| Value::Null),
            BrowserCommand::SetDividerFraction { window, fraction } => {
                let fraction = self.set_divider_fraction(window, fraction)?;
                Ok(serde_json::json!({ "fraction": fraction }))
            }
            BrowserCommand::AssignPane { window, side, tab } => {
                self.assign_pane(window, side, tab).map(|_| Value::Null)
            }
            BrowserCommand::SwapSplitSides { window } => self.swap_split_sides(window).map(|_| Value::Null),
            BrowserCommand::SetActiveSide { window, side } => {
                self.set_active_side(window, side).map(|_| Value::Null)
            }
            BrowserCommand::BeginSplitPreview { window } => {
                self.begin_split_preview(window).map(|_| Value::Null)
            }
            BrowserCommand::EndSplitPreview { window } => to_json(self.end_split_preview(window)?),
            BrowserCommand::HealSplit { window } => to_json(self.heal_split(window)?),
            BrowserCommand::Snapshot { window } => to_json(self.snapshot(window)?),
        }
    }
}
