//! The renderer seam.
//!
//! A [`FrameRenderer`] draws one frame at a time into a [`DrawTarget`]: the
//! producer's framebuffer, bound, with the viewport and scissor covering the
//! whole surface. A renderer that only fills part of the surface narrows the
//! viewport with [`DrawTarget::set_viewport`]; the transport then moves just
//! that region and presents everything else as cleared.
//!
//! Rectangles handed to [`DrawTarget::fill_rect`] are in top-left coordinates
//! relative to the current viewport, whatever the device's origin.

mod display_list;
mod patterns;

pub use display_list::{Color, DisplayItem, RenderList};
pub use patterns::{Quadrants, RenderStats, SolidColor};

use crate::render::{ClearMask, DeviceError, FramebufferId, GraphicsDevice, Viewport};
use crate::surface::{Origin, RenderSurface, SurfaceSize};

/// Draws frames on the render thread.
pub trait FrameRenderer: Send {
    /// Renders one frame into `target`.
    fn draw(&mut self, target: &mut DrawTarget<'_>) -> anyhow::Result<()>;

    /// Called on the render thread after the surface changed size or density.
    fn on_resize(&mut self, _width: u32, _height: u32, _scale: f32) {}

    /// True while the renderer has work that needs more frames (tiles loading,
    /// animations).
    fn has_pending_work(&self) -> bool {
        false
    }

    /// Keep-alive hook, called after each presented frame while the session
    /// keeps the loop running after start-up.
    fn request_active_frame(&mut self) {}
}

/// The bound render target for one frame.
pub struct DrawTarget<'a> {
    device: &'a mut dyn GraphicsDevice,
    framebuffer: FramebufferId,
    size: SurfaceSize,
    scale: f32,
}

impl<'a> DrawTarget<'a> {
    /// Binds the surface's framebuffer and resets viewport and scissor to the full surface.
    pub(crate) fn bind(device: &'a mut dyn GraphicsDevice, surface: &RenderSurface) -> Result<Self, DeviceError> {
        device.bind_framebuffer(surface.framebuffer())?;
        let mut target = Self {
            device,
            framebuffer: surface.framebuffer(),
            size: surface.size(),
            scale: surface.descriptor().scale(),
        };
        let full = Viewport::full(target.size);
        target.set_viewport(full)?;
        Ok(target)
    }

    /// The raw device, for renderers that issue their own commands.
    pub fn device(&mut self) -> &mut dyn GraphicsDevice {
        &mut *self.device
    }

    pub fn framebuffer(&self) -> FramebufferId {
        self.framebuffer
    }

    pub fn size(&self) -> SurfaceSize {
        self.size
    }

    /// Device pixels per logical pixel.
    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn origin(&self) -> Origin {
        self.device.origin()
    }

    pub fn viewport(&self) -> Viewport {
        self.device.viewport()
    }

    /// Sets the viewport and a matching scissor box.
    pub fn set_viewport(&mut self, viewport: Viewport) -> Result<(), DeviceError> {
        self.device.set_viewport(viewport)?;
        self.device.set_scissor(viewport)
    }

    /// Clears the current viewport.
    pub fn clear(&mut self, color: Color) -> Result<(), DeviceError> {
        let vp = self.device.viewport();
        self.device.set_scissor(vp)?;
        self.device.clear(color.to_array(), ClearMask::all())
    }

    /// Fills a rectangle given in top-left coordinates relative to the viewport.
    pub fn fill_rect(&mut self, x: i32, y: i32, width: u32, height: u32, color: Color) -> Result<(), DeviceError> {
        let vp = self.device.viewport();
        let local = Viewport::new(x, y, width, height).from_top_left(self.origin(), vp.height);
        let rect = Viewport::new(vp.x + local.x, vp.y + local.y, local.width, local.height);

        self.device.set_scissor(rect)?;
        let filled = self.device.clear(color.to_array(), ClearMask::COLOR);
        self.device.set_scissor(vp)?;
        filled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::backends::soft::{SoftDevice, SoftDeviceOptions};
    use crate::surface::{SurfaceConfig, SurfaceDescriptor};
    use crate::transport::GraphicsSurfaceFactory;

    fn factory(w: u32, h: u32) -> GraphicsSurfaceFactory {
        let device = SoftDevice::new(SoftDeviceOptions::default(), Default::default(), Default::default()).unwrap();
        let mut f = GraphicsSurfaceFactory::new(Box::new(device)).unwrap();
        f.create_surface(SurfaceDescriptor::new(w, h, 2.0).unwrap(), SurfaceConfig::D24S8)
            .unwrap();
        f
    }

    #[test]
    fn fill_rect_is_top_left_on_a_bottom_left_device() {
        let mut f = factory(4, 4);
        let fb = f.surface().unwrap().framebuffer();
        {
            let (device, surface) = f.parts_mut().unwrap();
            let mut target = DrawTarget::bind(device, surface).unwrap();
            assert_eq!(target.scale(), 2.0);
            target.clear(Color::from_u8(0, 0, 0, 255)).unwrap();
            target.fill_rect(0, 0, 1, 1, Color::from_u8(255, 0, 0, 255)).unwrap();
        }

        let soft = f.device().as_any().downcast_ref::<SoftDevice>().unwrap();
        let image = soft.color_snapshot(fb).unwrap();
        // Top-left pixel of a bottom-left framebuffer lives in the last row.
        assert_eq!(image.pixel(0, 3), [255, 0, 0, 255]);
        assert_eq!(image.pixel(0, 0), [0, 0, 0, 255]);
    }

    #[test]
    fn narrowed_viewport_offsets_rects() {
        let mut f = factory(8, 8);
        let fb = f.surface().unwrap().framebuffer();
        {
            let (device, surface) = f.parts_mut().unwrap();
            let mut target = DrawTarget::bind(device, surface).unwrap();
            target.set_viewport(Viewport::new(0, 0, 4, 4)).unwrap();
            target.fill_rect(0, 0, 1, 1, Color::from_u8(0, 255, 0, 255)).unwrap();
            assert_eq!(target.viewport(), Viewport::new(0, 0, 4, 4));
        }

        let soft = f.device().as_any().downcast_ref::<SoftDevice>().unwrap();
        let image = soft.color_snapshot(fb).unwrap();
        assert_eq!(image.pixel(0, 3), [0, 255, 0, 255]);
        assert_eq!(image.pixel(0, 7), [0, 0, 0, 0]);
    }
}
