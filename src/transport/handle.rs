//! What the host samples, and the slot the render thread publishes it through.

use crate::render::SharedResourceHandle;
use crate::surface::{ChannelOrder, SurfaceSize};
use crate::sync::LockExt;
use std::sync::{Arc, Mutex};

/// Host-visible pixels of one frame. Immutable once published.
#[derive(Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    pub width: u32,
    pub height: u32,
    /// Bytes per row.
    pub stride: usize,
    pub order: ChannelOrder,
    pub frame_id: u64,
    /// `height * stride` bytes, top row first.
    pub pixels: Vec<u8>,
}

impl PixelBuffer {
    pub fn size(&self) -> SurfaceSize {
        SurfaceSize::new(self.width, self.height)
    }

    /// Pixel at `(x, y)` from the top-left, in the buffer's channel order.
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let o = y as usize * self.stride + x as usize * 4;
        [self.pixels[o], self.pixels[o + 1], self.pixels[o + 2], self.pixels[o + 3]]
    }
}

impl std::fmt::Debug for PixelBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PixelBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("order", &self.order)
            .field("frame_id", &self.frame_id)
            .field("len", &self.pixels.len())
            .finish()
    }
}

/// Handle the host can composite. Re-query it for every sample: zero-copy
/// handles change generation on resize, CPU buffers are replaced per frame.
#[derive(Clone, Debug, PartialEq)]
pub enum ExternalHandle {
    /// GPU memory shared with the host, sampled in place.
    SharedResource {
        handle: SharedResourceHandle,
        width: u32,
        height: u32,
        frame_id: u64,
    },

    /// CPU pixels in the host's channel order and origin.
    CpuPixels(Arc<PixelBuffer>),
}

impl ExternalHandle {
    pub(crate) fn shared(handle: SharedResourceHandle, frame_id: u64) -> Self {
        let size = handle.size;
        ExternalHandle::SharedResource {
            handle,
            width: size.width,
            height: size.height,
            frame_id,
        }
    }

    pub fn frame_id(&self) -> u64 {
        match self {
            ExternalHandle::SharedResource { frame_id, .. } => *frame_id,
            ExternalHandle::CpuPixels(buffer) => buffer.frame_id,
        }
    }

    pub fn size(&self) -> SurfaceSize {
        match self {
            ExternalHandle::SharedResource { width, height, .. } => SurfaceSize::new(*width, *height),
            ExternalHandle::CpuPixels(buffer) => buffer.size(),
        }
    }
}

#[derive(Default)]
struct SlotState {
    current: Option<ExternalHandle>,
    epoch: u64,
    closed: bool,
}

/// Latest published frame. Written from the flush completion of each frame,
/// read by the host. The lock is only held to swap or clone a handle.
///
/// Frames are published against the epoch that was current when they were
/// presented. Retiring bumps the epoch, so a completion that arrives after
/// the frame's resources were released cannot resurrect it.
#[derive(Default)]
pub(crate) struct FrameSlot {
    state: Mutex<SlotState>,
}

impl FrameSlot {
    pub fn epoch(&self) -> u64 {
        self.state.lock_or_recover().epoch
    }

    /// Makes `frame` the host-visible frame. Returns false if the slot is
    /// closed, `epoch` was retired, or a newer frame is already visible.
    pub fn publish(&self, frame: ExternalHandle, epoch: u64) -> bool {
        let mut state = self.state.lock_or_recover();
        if state.closed || state.epoch != epoch {
            return false;
        }
        if state.current.as_ref().is_some_and(|c| c.frame_id() >= frame.frame_id()) {
            return false;
        }
        state.current = Some(frame);
        true
    }

    /// Drops the visible frame and refuses frames presented before this call.
    pub fn retire(&self) {
        let mut state = self.state.lock_or_recover();
        state.epoch += 1;
        state.current = None;
    }

    /// Drops the visible frame and refuses everything from now on.
    pub fn close(&self) {
        let mut state = self.state.lock_or_recover();
        state.closed = true;
        state.current = None;
    }

    pub fn external_handle(&self) -> Option<ExternalHandle> {
        self.state.lock_or_recover().current.clone()
    }

    pub fn shared_resource_handle(&self) -> Option<SharedResourceHandle> {
        match &self.state.lock_or_recover().current {
            Some(ExternalHandle::SharedResource { handle, .. }) => Some(handle.clone()),
            _ => None,
        }
    }

    pub fn pixel_buffer(&self) -> Option<Arc<PixelBuffer>> {
        match &self.state.lock_or_recover().current {
            Some(ExternalHandle::CpuPixels(buffer)) => Some(buffer.clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::SharedResourceKind;

    fn buffer(frame_id: u64) -> Arc<PixelBuffer> {
        Arc::new(PixelBuffer {
            width: 1,
            height: 1,
            stride: 4,
            order: ChannelOrder::Bgra,
            frame_id,
            pixels: vec![frame_id as u8; 4],
        })
    }

    fn pixels(frame_id: u64) -> ExternalHandle {
        ExternalHandle::CpuPixels(buffer(frame_id))
    }

    #[test]
    fn published_buffers_survive_replacement() {
        let slot = FrameSlot::default();
        assert!(slot.publish(pixels(1), 0));
        let held = slot.pixel_buffer().unwrap();
        assert!(slot.publish(pixels(2), 0));

        assert_eq!(held.frame_id, 1);
        assert_eq!(held.pixels, vec![1; 4]);
        assert_eq!(slot.pixel_buffer().unwrap().frame_id, 2);
        assert!(slot.shared_resource_handle().is_none());
    }

    #[test]
    fn shared_handle_replaces_pixels() {
        let slot = FrameSlot::default();
        slot.publish(pixels(1), 0);
        let handle = SharedResourceHandle {
            raw: 7,
            kind: SharedResourceKind::NativeSurface,
            size: SurfaceSize::new(4, 2),
            order: ChannelOrder::Bgra,
            generation: 3,
            sync: None,
        };
        assert!(slot.publish(ExternalHandle::shared(handle.clone(), 9), 0));

        assert!(slot.pixel_buffer().is_none());
        assert_eq!(slot.shared_resource_handle(), Some(handle));
        let external = slot.external_handle().unwrap();
        assert_eq!(external.frame_id(), 9);
        assert_eq!(external.size(), SurfaceSize::new(4, 2));

        slot.close();
        assert!(slot.external_handle().is_none());
        assert!(!slot.publish(pixels(10), 0));
        assert!(slot.external_handle().is_none());
    }

    #[test]
    fn older_frames_never_replace_newer_ones() {
        let slot = FrameSlot::default();
        assert!(slot.publish(pixels(3), 0));
        assert!(!slot.publish(pixels(2), 0));
        assert!(!slot.publish(pixels(3), 0));
        assert_eq!(slot.external_handle().unwrap().frame_id(), 3);
    }

    #[test]
    fn retired_epochs_are_refused() {
        let slot = FrameSlot::default();
        let epoch = slot.epoch();
        assert!(slot.publish(pixels(1), epoch));

        slot.retire();
        assert!(slot.external_handle().is_none());
        assert!(!slot.publish(pixels(2), epoch));
        assert!(slot.publish(pixels(2), slot.epoch()));
        assert_eq!(slot.external_handle().unwrap().frame_id(), 2);
    }
}
