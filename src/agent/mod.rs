//! Agent module: the control loop and the traits it drives.

mod desktop_agent;
mod loop_detect;
mod traits;

pub use desktop_agent::{
    AgentOptions, CaptureHook, DesktopAgent, RunHooks, RunReport, RunStatus, StopHandle,
};
pub use loop_detect::{LoopDetector, REPEAT_WARNING_THRESHOLD};
pub use traits::{
    ActionDriver, CaptureService, CoordinateMapper, LinearMapper, PhysicalAction, ScreenSize,
};
