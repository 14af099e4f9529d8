//! Display lists and display items.
//!
//! A [`RenderList`] is a sequence of [`DisplayItem`] commands replayed into a
//! [`DrawTarget`] every frame. It is the simplest useful [`FrameRenderer`]:
//! hosts and tests build a list, hand it to a surface and change it between
//! frames through a shared `Arc<Mutex<RenderList>>`.
//!
//! # Example
//!
//! ```rust
//! use frame_bridge::renderer::{Color, DisplayItem, RenderList};
//!
//! let mut list = RenderList::new();
//!
//! // Clear background
//! list.add_command(DisplayItem::Clear { color: Color::from_u8(0, 0, 0, 255) });
//!
//! // Draw a white rectangle
//! list.add_command(DisplayItem::Rect {
//!     x: 10.0,
//!     y: 20.0,
//!     w: 100.0,
//!     h: 50.0,
//!     color: Color::from_u8(255, 255, 255, 255),
//! });
//! assert_eq!(list.items.len(), 2);
//! ```

use super::{DrawTarget, FrameRenderer};
use crate::render::Viewport;
use crate::sync::LockExt;
use std::sync::{Arc, Mutex};

/// RGBA color used for drawing commands.
///
/// Channels are represented as `f32` in the range `0.0 ..= 1.0`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Color {
    pub const TRANSPARENT: Color = Color::new(0.0, 0.0, 0.0, 0.0);

    pub const fn new(r: f32, g: f32, b: f32, a: f32) -> Color {
        Color { r, g, b, a }
    }

    /// Creates a new color from `u8` channel values in the range `0 ..= 255`.
    pub fn from_u8(r: u8, g: u8, b: u8, a: u8) -> Color {
        Color {
            r: r as f32 / 255.0,
            g: g as f32 / 255.0,
            b: b as f32 / 255.0,
            a: a as f32 / 255.0,
        }
    }

    pub fn to_array(self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }

    /// The color as 8-bit RGBA, as the device stores it.
    pub fn to_rgba8(self) -> [u8; 4] {
        let q = |c: f32| (c.clamp(0.0, 1.0) * 255.0).round() as u8;
        [q(self.r), q(self.g), q(self.b), q(self.a)]
    }
}

/// A single drawing command.
#[derive(Clone, Debug, PartialEq)]
pub enum DisplayItem {
    /// Clear the current viewport with the given color.
    Clear { color: Color },

    /// Draw a filled rectangle at `(x, y)` with width `w` and height `h`, in
    /// logical pixels from the viewport's top-left corner.
    Rect { x: f32, y: f32, w: f32, h: f32, color: Color },

    /// Restrict drawing to `width` x `height` device pixels at the
    /// framebuffer origin, as a renderer still drawing at an older size would.
    Viewport { width: u32, height: u32 },
}

/// A list of display items to be rendered.
#[derive(Clone, Debug, Default)]
pub struct RenderList {
    /// Sequence of drawing commands to execute.
    pub items: Vec<DisplayItem>,
}

impl RenderList {
    pub fn new() -> Self {
        RenderList { items: Vec::new() }
    }

    pub fn add_command(&mut self, command: DisplayItem) {
        self.items.push(command);
    }

    /// Clears all display items from the list.
    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Wraps the list so it can be edited while a surface renders it.
    pub fn shared(self) -> Arc<Mutex<RenderList>> {
        Arc::new(Mutex::new(self))
    }

    fn replay(&self, target: &mut DrawTarget<'_>) -> anyhow::Result<()> {
        let scale = target.scale();
        for item in &self.items {
            match *item {
                DisplayItem::Clear { color } => target.clear(color)?,
                DisplayItem::Rect { x, y, w, h, color } => {
                    let px = |v: f32| (v * scale).round();
                    target.fill_rect(px(x) as i32, px(y) as i32, px(w).max(0.0) as u32, px(h).max(0.0) as u32, color)?
                }
                DisplayItem::Viewport { width, height } => target.set_viewport(Viewport::new(0, 0, width, height))?,
            }
        }
        Ok(())
    }
}

impl FrameRenderer for RenderList {
    fn draw(&mut self, target: &mut DrawTarget<'_>) -> anyhow::Result<()> {
        self.replay(target)
    }
}

impl FrameRenderer for Arc<Mutex<RenderList>> {
    fn draw(&mut self, target: &mut DrawTarget<'_>) -> anyhow::Result<()> {
        let list = self.lock_or_recover().clone();
        list.replay(target)
    }
}
