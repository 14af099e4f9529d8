//! Viewport definition for rendering.
//!
//! A [`Viewport`] is a rectangle in framebuffer pixels. The renderer draws into
//! one, the transport reads one back, and the scissor rectangle is expressed as
//! one. Coordinates are in the producer's framebuffer space, so whether `y = 0`
//! is the top or the bottom row depends on the device's [`Origin`].
//!
//! # Examples
//!
//! ```
//! use frame_bridge::render::Viewport;
//!
//! let mut vp = Viewport::new(0, 0, 800, 600);
//! vp.resize(1024, 768);
//! assert_eq!(vp.width, 1024);
//! assert_eq!(vp.area(), 1024 * 768);
//! ```
//!
//! Clamping a rendered region to a (possibly smaller) target:
//! ```
//! use frame_bridge::render::Viewport;
//! use frame_bridge::surface::SurfaceSize;
//!
//! let rendered = Viewport::new(0, 0, 1200, 900);
//! let clamped = rendered.clamp_to(SurfaceSize { width: 800, height: 600 });
//! assert_eq!((clamped.width, clamped.height), (800, 600));
//! ```

use crate::surface::{Origin, SurfaceSize};

/// Rectangle in framebuffer pixels.
#[derive(Clone, Eq, PartialEq, Copy, Default, Hash)]
pub struct Viewport {
    /// Horizontal offset in pixels from the origin.
    pub x: i32,

    /// Vertical offset in pixels from the origin.
    pub y: i32,

    /// Width in pixels.
    pub width: u32,

    /// Height in pixels.
    pub height: u32,
}

impl std::fmt::Debug for Viewport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Viewport {{ x: {}, y: {}, width: {}, height: {} }}",
            self.x, self.y, self.width, self.height
        )
    }
}

impl Viewport {
    /// Creates a new [`Viewport`] with the given position and size.
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// A viewport covering the whole of `size`, anchored at the origin.
    pub fn full(size: SurfaceSize) -> Self {
        Self::new(0, 0, size.width, size.height)
    }

    /// Resizes the viewport to the given width and height.
    pub fn resize(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
    }

    /// Moves the viewport's origin to `(x, y)` in pixels.
    pub fn translate(&mut self, x: i32, y: i32) {
        self.x = x;
        self.y = y;
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Converts this viewport to a [`SurfaceSize`].
    pub fn as_size(&self) -> SurfaceSize {
        SurfaceSize {
            width: self.width,
            height: self.height,
        }
    }

    /// Intersects the viewport with `[0, size)`. Negative offsets are cut off.
    pub fn clamp_to(&self, size: SurfaceSize) -> Self {
        let x0 = self.x.max(0) as i64;
        let y0 = self.y.max(0) as i64;
        let x1 = (self.x as i64 + self.width as i64).min(size.width as i64);
        let y1 = (self.y as i64 + self.height as i64).min(size.height as i64);

        if x1 <= x0 || y1 <= y0 {
            return Self::new(x0 as i32, y0 as i32, 0, 0);
        }

        Self::new(x0 as i32, y0 as i32, (x1 - x0) as u32, (y1 - y0) as u32)
    }

    /// Converts a rectangle given with a top-left origin into the coordinate
    /// space of a framebuffer of `height` rows with origin `origin`.
    pub fn from_top_left(&self, origin: Origin, height: u32) -> Self {
        match origin {
            Origin::TopLeft => *self,
            Origin::BottomLeft => Self::new(
                self.x,
                height as i32 - self.y - self.height as i32,
                self.width,
                self.height,
            ),
        }
    }

    /// Returns true if the pixel `(x, y)` lies inside the viewport.
    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.x
            && y >= self.y
            && (x as i64) < self.x as i64 + self.width as i64
            && (y as i64) < self.y as i64 + self.height as i64
    }
}
