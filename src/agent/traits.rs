//! Collaborator seams consumed by the control loop.
//!
//! Screen capture, pointer/keyboard drivers, and coordinate mapping are
//! platform concerns implemented outside this crate; the loop only depends on
//! these traits.

use async_trait::async_trait;

use crate::actions::Action;

/// Addressable size of the target surface, in physical pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenSize {
    pub width: u32,
    pub height: u32,
}

/// Screenshot source. Returned images are already scaled to the configured
/// normalized coordinate space.
#[async_trait]
pub trait CaptureService: Send + Sync {
    async fn size(&self) -> anyhow::Result<ScreenSize>;
    /// Capture the current screen as encoded PNG bytes.
    async fn capture(&self) -> anyhow::Result<Vec<u8>>;
}

/// An action with its coordinates already mapped to physical pixels.
#[derive(Debug, Clone)]
pub struct PhysicalAction {
    pub action: Action,
    /// Mapped primary point, when the action has one.
    pub point: Option<(i32, i32)>,
    /// Mapped drag endpoint.
    pub end_point: Option<(i32, i32)>,
}

/// Performs the physical pointer/keyboard effects of an action.
///
/// Shell actions never reach the driver; the control loop routes those
/// through the command gate.
#[async_trait]
pub trait ActionDriver: Send + Sync {
    async fn execute(&self, action: &PhysicalAction) -> anyhow::Result<()>;
}

/// Pure mapping from normalized coordinates to physical pixels.
pub trait CoordinateMapper: Send + Sync {
    fn map(&self, x: f64, y: f64, size: ScreenSize) -> (i32, i32);
}

/// Default mapper: linear scaling from the normalized square onto the
/// physical surface, clamped to its bounds.
#[derive(Debug, Clone)]
pub struct LinearMapper {
    pub scale: u32,
}

impl CoordinateMapper for LinearMapper {
    fn map(&self, x: f64, y: f64, size: ScreenSize) -> (i32, i32) {
        let scale = self.scale.max(1) as f64;
        let px = (x / scale * size.width as f64).round();
        let py = (y / scale * size.height as f64).round();
        (
            (px as i32).clamp(0, size.width.saturating_sub(1) as i32),
            (py as i32).clamp(0, size.height.saturating_sub(1) as i32),
        )
    }
}
