pub mod compositor;
pub mod host;
pub mod protocol;
pub mod registry;
pub mod split;
pub mod tab;
pub mod window;

pub use compositor::{Compositor, CompositorInputs, Frame, SurfaceHost, SurfaceOp, SurfaceOpLog, Viewport};
pub use host::SharedBrowser;
pub use protocol::{BrowserCommand, BrowserEvent};
pub use registry::Browser;
pub use split::{HealOutcome, Side, SplitState};
pub use tab::{LoadingState, NavigationEvent, Space, SpaceId, Tab, TabId, TabMembership, WindowId};
pub use window::WindowState;
