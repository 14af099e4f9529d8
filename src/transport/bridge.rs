//! Zero-copy transfer: blit the render attachment into a resource the host
//! samples in place.
//!
//! Per frame, with the producer context current:
//! 1. take write access to the shared resource (keyed mutex if configured,
//!    then the interop lock),
//! 2. blit the rendered region into it, flipping rows when the producer and
//!    host origins differ,
//! 3. give access back.
//!
//! Publication to the host slot and the notification come later, from the
//! flush's completion callback. Releasing or recreating the shared resource
//! retires whatever the slot still shows from it. A
//! failure in steps 1-3 is reported once and the bridge stays disabled; the
//! session moves to the CPU tier from the next frame.

use crate::errors::TransportError;
use crate::render::{
    with_current_context, BlitRect, ClearMask, DeviceError, FramebufferId, GraphicsDevice, SharedResourceHandle,
    SyncMode, Viewport,
};
use crate::surface::{ChannelOrder, Origin, RenderSurface, SurfaceSize};
use crate::transport::handle::{ExternalHandle, FrameSlot};
use crate::transport::strategy::{PresentOutcome, TransportStrategy};
use crate::transport::TransportCapability;
use std::sync::Arc;

/// A shared resource wrapped in a complete framebuffer.
#[derive(Clone, Debug)]
pub(crate) struct SharedAttachment {
    pub handle: SharedResourceHandle,
    pub framebuffer: FramebufferId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WriteAccess {
    Granted,
    TimedOut,
}

/// Where a zero-copy tier gets its shared resource from.
pub(crate) trait SharedTarget {
    fn capability(&self) -> TransportCapability;

    fn sync_mode(&self) -> Option<SyncMode>;

    /// Creates a shared resource of `size` and a complete framebuffer around
    /// it. On failure nothing is left allocated.
    fn allocate(
        &mut self,
        device: &mut dyn GraphicsDevice,
        size: SurfaceSize,
        order: ChannelOrder,
        generation: u64,
    ) -> Result<SharedAttachment, DeviceError>;

    fn begin_write(&mut self, device: &mut dyn GraphicsDevice) -> Result<WriteAccess, DeviceError>;

    fn end_write(&mut self, device: &mut dyn GraphicsDevice) -> Result<(), DeviceError>;

    /// Releases the current resource, sync token first. Idempotent.
    fn release(&mut self, device: &mut dyn GraphicsDevice);

    /// Releases everything including the provider's own device.
    fn shutdown(&mut self, device: &mut dyn GraphicsDevice);
}

pub struct FrameTransportBridge {
    target: Box<dyn SharedTarget>,
    attachment: Option<SharedAttachment>,
    host_order: ChannelOrder,
    host_origin: Origin,
    slot: Arc<FrameSlot>,
    generation: u64,
    failed: bool,
}

impl FrameTransportBridge {
    pub(crate) fn new(
        target: Box<dyn SharedTarget>,
        host_order: ChannelOrder,
        host_origin: Origin,
        slot: Arc<FrameSlot>,
    ) -> Self {
        Self {
            target,
            attachment: None,
            host_order,
            host_origin,
            slot,
            generation: 0,
            failed: false,
        }
    }

    pub fn shared_resource_handle(&self) -> Option<&SharedResourceHandle> {
        self.attachment.as_ref().map(|a| &a.handle)
    }

    fn failure(&mut self, reason: impl std::fmt::Display) -> TransportError {
        self.failed = true;
        TransportError::RuntimeTransportFailure {
            capability: self.target.capability(),
            reason: reason.to_string(),
        }
    }

    fn device_failure(&mut self, err: DeviceError) -> TransportError {
        match err {
            DeviceError::Lost => TransportError::DeviceLost,
            other => self.failure(other),
        }
    }

    fn allocate(&mut self, device: &mut dyn GraphicsDevice, surface: &RenderSurface) -> Result<(), TransportError> {
        self.generation += 1;
        let attachment = self
            .target
            .allocate(device, surface.size(), self.host_order, self.generation)
            .map_err(|e| self.device_failure(e))?;
        log::debug!(
            "{}: shared resource {} on {:?}",
            self.target.capability(),
            attachment.handle,
            attachment.framebuffer
        );
        self.attachment = Some(attachment);
        Ok(())
    }

    /// Destination of the blit. Rendered content lands in the top-left of the
    /// host's view; rows are flipped when the origins differ.
    fn destination(&self, device: &dyn GraphicsDevice, rendered: Viewport) -> BlitRect {
        let dst = BlitRect::from_viewport(Viewport::new(0, 0, rendered.width, rendered.height));
        if device.origin() != self.host_origin {
            dst.flipped()
        } else {
            dst
        }
    }

    fn transfer(
        &mut self,
        device: &mut dyn GraphicsDevice,
        surface: &RenderSurface,
        attachment: SharedAttachment,
        frame_id: u64,
    ) -> Result<PresentOutcome, TransportError> {
        let shared_fb = attachment.framebuffer;
        let rendered = surface.rendered();
        if rendered.is_empty() {
            return Ok(PresentOutcome::Skipped("nothing rendered yet".into()));
        }

        match self.target.begin_write(device) {
            Ok(WriteAccess::Granted) => {}
            Ok(WriteAccess::TimedOut) => return Ok(PresentOutcome::Skipped("sync acquire timed out".into())),
            Err(e) => return Err(self.device_failure(e)),
        }

        let copied = self.copy(device, surface, shared_fb, rendered);
        let released = self.target.end_write(device);

        copied.map_err(|e| self.device_failure(e))?;
        released.map_err(|e| self.device_failure(e))?;
        Ok(PresentOutcome::Presented {
            rendered,
            frame: ExternalHandle::shared(attachment.handle, frame_id),
        })
    }

    fn copy(
        &mut self,
        device: &mut dyn GraphicsDevice,
        surface: &RenderSurface,
        shared_fb: FramebufferId,
        rendered: Viewport,
    ) -> Result<(), DeviceError> {
        if rendered.as_size() != surface.size() {
            // Partial frame: whatever lies outside the rendered region must read as cleared.
            let bound = device.bound_framebuffer();
            let scissor = device.scissor();
            device.bind_framebuffer(shared_fb)?;
            device.set_scissor(Viewport::full(surface.size()))?;
            let cleared = device.clear([0.0; 4], ClearMask::COLOR);
            device.set_scissor(scissor)?;
            device.bind_framebuffer(bound)?;
            cleared?;
        }

        let dst = self.destination(device, rendered);
        device.blit(surface.framebuffer(), BlitRect::from_viewport(rendered), shared_fb, dst)
    }
}

impl TransportStrategy for FrameTransportBridge {
    fn capability(&self) -> TransportCapability {
        self.target.capability()
    }

    fn attach(&mut self, device: &mut dyn GraphicsDevice, surface: &RenderSurface) -> Result<(), TransportError> {
        with_current_context(device, |device| self.allocate(device, surface))
    }

    fn resize(&mut self, device: &mut dyn GraphicsDevice, surface: &RenderSurface) -> Result<(), TransportError> {
        with_current_context(device, |device| {
            if let Some(old) = self.attachment.take() {
                log::debug!("{}: releasing {} for resize", self.target.capability(), old.handle);
                self.slot.retire();
            }
            self.target.release(device);
            self.allocate(device, surface)
        })
    }

    fn present(
        &mut self,
        device: &mut dyn GraphicsDevice,
        surface: &RenderSurface,
        frame_id: u64,
    ) -> Result<PresentOutcome, TransportError> {
        if self.failed {
            return Err(TransportError::RuntimeTransportFailure {
                capability: self.target.capability(),
                reason: "disabled after an earlier failure".into(),
            });
        }
        let Some(attachment) = self.attachment.clone() else {
            return Err(self.failure("no shared resource attached"));
        };

        with_current_context(device, |device| self.transfer(device, surface, attachment, frame_id))
    }

    fn release(&mut self, device: &mut dyn GraphicsDevice) {
        if self.attachment.take().is_some() {
            self.slot.retire();
        }
        self.target.shutdown(device);
    }

    fn sync_mode(&self) -> Option<SyncMode> {
        self.target.sync_mode()
    }
}
