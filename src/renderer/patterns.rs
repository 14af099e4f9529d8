//! Small renderers with known output, for demos and tests.

use super::{Color, DrawTarget, FrameRenderer};
use crate::sync::LockExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// What a pattern renderer has been asked to do. Shared with the host.
#[derive(Debug, Default)]
pub struct RenderStats {
    draws: AtomicU64,
    active_requests: AtomicU64,
    resizes: Mutex<Vec<(u32, u32, f32)>>,
}

impl RenderStats {
    pub fn draws(&self) -> u64 {
        self.draws.load(Ordering::SeqCst)
    }

    pub fn active_requests(&self) -> u64 {
        self.active_requests.load(Ordering::SeqCst)
    }

    /// Every `on_resize` call, in order.
    pub fn resizes(&self) -> Vec<(u32, u32, f32)> {
        self.resizes.lock_or_recover().clone()
    }

    fn record_resize(&self, width: u32, height: u32, scale: f32) {
        self.resizes.lock_or_recover().push((width, height, scale));
    }
}

/// Fills the whole surface with one color.
#[derive(Debug, Clone)]
pub struct SolidColor {
    pub color: Color,
    stats: Arc<RenderStats>,
}

impl SolidColor {
    pub fn new(color: Color) -> Self {
        Self {
            color,
            stats: Arc::default(),
        }
    }

    pub fn stats(&self) -> Arc<RenderStats> {
        self.stats.clone()
    }
}

impl FrameRenderer for SolidColor {
    fn draw(&mut self, target: &mut DrawTarget<'_>) -> anyhow::Result<()> {
        self.stats.draws.fetch_add(1, Ordering::SeqCst);
        target.clear(self.color)?;
        Ok(())
    }

    fn on_resize(&mut self, width: u32, height: u32, scale: f32) {
        self.stats.record_resize(width, height, scale);
    }

    fn request_active_frame(&mut self) {
        self.stats.active_requests.fetch_add(1, Ordering::SeqCst);
    }
}

/// Red, green, blue and white quadrants, clockwise from the top-left. Any
/// flip or channel swap on the way to the host shows up as a wrong corner.
#[derive(Debug, Clone, Default)]
pub struct Quadrants {
    stats: Arc<RenderStats>,
}

impl Quadrants {
    pub const TOP_LEFT: Color = Color::new(1.0, 0.0, 0.0, 1.0);
    pub const TOP_RIGHT: Color = Color::new(0.0, 1.0, 0.0, 1.0);
    pub const BOTTOM_LEFT: Color = Color::new(0.0, 0.0, 1.0, 1.0);
    pub const BOTTOM_RIGHT: Color = Color::new(1.0, 1.0, 1.0, 1.0);

    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> Arc<RenderStats> {
        self.stats.clone()
    }

    /// Color expected at `(x, y)` from the top-left of a `width` x `height` frame.
    pub fn expected(x: u32, y: u32, width: u32, height: u32) -> Color {
        match (x < width / 2, y < height / 2) {
            (true, true) => Self::TOP_LEFT,
            (false, true) => Self::TOP_RIGHT,
            (true, false) => Self::BOTTOM_LEFT,
            (false, false) => Self::BOTTOM_RIGHT,
        }
    }
}

impl FrameRenderer for Quadrants {
    fn draw(&mut self, target: &mut DrawTarget<'_>) -> anyhow::Result<()> {
        self.stats.draws.fetch_add(1, Ordering::SeqCst);
        let vp = target.viewport();
        let (hw, hh) = (vp.width / 2, vp.height / 2);

        target.clear(Self::BOTTOM_RIGHT)?;
        target.fill_rect(0, 0, hw, hh, Self::TOP_LEFT)?;
        target.fill_rect(hw as i32, 0, vp.width - hw, hh, Self::TOP_RIGHT)?;
        target.fill_rect(0, hh as i32, hw, vp.height - hh, Self::BOTTOM_LEFT)?;
        Ok(())
    }

    fn on_resize(&mut self, width: u32, height: u32, scale: f32) {
        self.stats.record_resize(width, height, scale);
    }

    fn request_active_frame(&mut self) {
        self.stats.active_requests.fetch_add(1, Ordering::SeqCst);
    }
}
