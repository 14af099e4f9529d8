//! CPU-mediated transfer: read the rendered region back and hand the host a
//! buffer in its channel order and row order.
//!
//! Buffers are handed out as `Arc<PixelBuffer>`. A host holding a frame keeps
//! it intact; the next frame goes into the spare buffer when the host has let
//! go of it, or into a fresh one otherwise.

use crate::errors::TransportError;
use crate::render::{with_current_context, DeviceError, GraphicsDevice};
use crate::surface::{ChannelOrder, Origin, RenderSurface, SurfaceSize, BYTES_PER_PIXEL};
use crate::transport::handle::{ExternalHandle, PixelBuffer};
use crate::transport::strategy::{PresentOutcome, TransportStrategy};
use crate::transport::TransportCapability;
use std::sync::Arc;

/// Writes `rendered` RGBA rows (framebuffer row order) into `out`, a
/// `target`-sized buffer in `order`. Rendered rows go to the top rows of the
/// output, reversed when `flip` is set. Everything else is zeroed.
pub fn compose_host_frame(
    rgba: &[u8],
    rendered: SurfaceSize,
    target: SurfaceSize,
    flip: bool,
    order: ChannelOrder,
    out: &mut Vec<u8>,
) {
    out.clear();
    out.resize(target.byte_len(), 0);

    let rows = rendered.height.min(target.height) as usize;
    let copy = rendered.width.min(target.width) as usize * BYTES_PER_PIXEL;
    let src_stride = rendered.stride();
    let dst_stride = target.stride();

    for r in 0..rows {
        let src_row = if flip { rendered.height as usize - 1 - r } else { r };
        let src = &rgba[src_row * src_stride..src_row * src_stride + copy];
        let dst = &mut out[r * dst_stride..r * dst_stride + copy];
        dst.copy_from_slice(src);
        ChannelOrder::Rgba.convert_row(order, dst);
    }
}

pub struct FallbackCopyPath {
    host_order: ChannelOrder,
    host_origin: Origin,
    front: Option<Arc<PixelBuffer>>,
    back: Option<Arc<PixelBuffer>>,
}

impl FallbackCopyPath {
    pub(crate) fn new(host_order: ChannelOrder, host_origin: Origin) -> Self {
        Self {
            host_order,
            host_origin,
            front: None,
            back: None,
        }
    }

    /// A buffer to write the next frame into, reusing the spare when no one else holds it.
    fn take_back_buffer(&mut self) -> PixelBuffer {
        match self.back.take().map(Arc::try_unwrap) {
            Some(Ok(buffer)) => buffer,
            _ => PixelBuffer {
                width: 0,
                height: 0,
                stride: 0,
                order: self.host_order,
                frame_id: 0,
                pixels: Vec::new(),
            },
        }
    }

    fn read(
        &mut self,
        device: &mut dyn GraphicsDevice,
        surface: &RenderSurface,
        frame_id: u64,
    ) -> Result<PresentOutcome, DeviceError> {
        let rendered = surface.rendered();
        let rgba = if rendered.is_empty() {
            Vec::new()
        } else {
            device.read_pixels(surface.framebuffer(), rendered)?
        };

        let target = surface.size();
        let flip = device.origin() != self.host_origin;
        let mut buffer = self.take_back_buffer();
        compose_host_frame(&rgba, rendered.as_size(), target, flip, self.host_order, &mut buffer.pixels);
        buffer.width = target.width;
        buffer.height = target.height;
        buffer.stride = target.stride();
        buffer.order = self.host_order;
        buffer.frame_id = frame_id;

        let buffer = Arc::new(buffer);
        self.back = self.front.replace(buffer.clone());
        Ok(PresentOutcome::Presented {
            rendered,
            frame: ExternalHandle::CpuPixels(buffer),
        })
    }
}

impl TransportStrategy for FallbackCopyPath {
    fn capability(&self) -> TransportCapability {
        TransportCapability::CpuMediated
    }

    fn attach(&mut self, _device: &mut dyn GraphicsDevice, surface: &RenderSurface) -> Result<(), TransportError> {
        log::debug!("CpuMediated: attached at {}", surface.size());
        Ok(())
    }

    fn resize(&mut self, _device: &mut dyn GraphicsDevice, _surface: &RenderSurface) -> Result<(), TransportError> {
        // Buffers are sized per frame.
        self.back = None;
        Ok(())
    }

    fn present(
        &mut self,
        device: &mut dyn GraphicsDevice,
        surface: &RenderSurface,
        frame_id: u64,
    ) -> Result<PresentOutcome, TransportError> {
        with_current_context(device, |device| {
            self.read(device, surface, frame_id).map_err(|e| match e {
                DeviceError::Lost => TransportError::DeviceLost,
                other => TransportError::RuntimeTransportFailure {
                    capability: TransportCapability::CpuMediated,
                    reason: other.to_string(),
                },
            })
        })
    }

    fn release(&mut self, _device: &mut dyn GraphicsDevice) {
        self.front = None;
        self.back = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::backends::soft::SoftPlatform;
    use crate::render::{ClearMask, Viewport};
    use crate::surface::{SurfaceConfig, SurfaceDescriptor};
    use crate::transport::factory::GraphicsSurfaceFactory;

    fn rgba_rows(rows: &[[u8; 4]], width: usize) -> Vec<u8> {
        rows.iter().flat_map(|px| px.repeat(width)).collect()
    }

    #[test]
    fn flips_and_swizzles() {
        // Two rows in GL order: bottom red, top green.
        let src = rgba_rows(&[[255, 0, 0, 255], [0, 255, 0, 255]], 2);
        let mut out = Vec::new();
        let size = SurfaceSize::new(2, 2);
        compose_host_frame(&src, size, size, true, ChannelOrder::Bgra, &mut out);

        // Host row 0 is the top row: green, in BGRA.
        assert_eq!(&out[0..4], &[0, 255, 0, 255]);
        // Host row 1: red, in BGRA.
        assert_eq!(&out[8..12], &[0, 0, 255, 255]);
    }

    #[test]
    fn partial_render_clears_border() {
        let src = rgba_rows(&[[9, 9, 9, 9]], 2);
        let mut out = vec![7; 3];
        compose_host_frame(
            &src,
            SurfaceSize::new(2, 1),
            SurfaceSize::new(4, 3),
            false,
            ChannelOrder::Rgba,
            &mut out,
        );
        assert_eq!(out.len(), 4 * 3 * 4);
        assert_eq!(&out[0..8], &[9; 8]);
        // Right of the rendered region, and every row below it.
        assert!(out[8..16].iter().all(|&b| b == 0));
        assert!(out[16..].iter().all(|&b| b == 0));
    }

    #[test]
    fn rendered_larger_than_target_is_cropped() {
        let src = rgba_rows(&[[1, 2, 3, 4], [5, 6, 7, 8], [9, 10, 11, 12]], 3);
        let mut out = Vec::new();
        compose_host_frame(
            &src,
            SurfaceSize::new(3, 3),
            SurfaceSize::new(2, 2),
            false,
            ChannelOrder::Rgba,
            &mut out,
        );
        assert_eq!(out, vec![1, 2, 3, 4, 1, 2, 3, 4, 5, 6, 7, 8, 5, 6, 7, 8]);
    }

    #[test]
    fn present_hands_back_the_frame() {
        let (platform, _handles) = SoftPlatform::new().build();
        let mut factory = GraphicsSurfaceFactory::new((platform.device)().unwrap()).unwrap();
        factory
            .create_surface(SurfaceDescriptor::new(2, 2, 1.0).unwrap(), SurfaceConfig::D24S8)
            .unwrap();
        let (device, surface) = factory.parts_mut().unwrap();
        device.bind_framebuffer(surface.framebuffer()).unwrap();
        device.clear([0.0, 1.0, 0.0, 1.0], ClearMask::COLOR).unwrap();
        surface.set_rendered(Viewport::full(surface.size()));

        let mut path = FallbackCopyPath::new(ChannelOrder::Rgba, Origin::TopLeft);
        let PresentOutcome::Presented { frame, .. } = path.present(device, surface, 4).unwrap() else {
            panic!("frame 4 was skipped");
        };
        let ExternalHandle::CpuPixels(buffer) = frame else {
            panic!("expected CPU pixels");
        };
        assert_eq!(buffer.frame_id, 4);
        assert_eq!(buffer.size(), SurfaceSize::new(2, 2));
        assert_eq!(buffer.pixel(1, 1), [0, 255, 0, 255]);
    }
}
