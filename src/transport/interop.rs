//! Shared target for the cross-API interop tier.

use crate::render::{
    ColorTarget, DeviceError, FramebufferId, GraphicsDevice, InteropObject, InteropProvider, SharedResourceHandle,
    SyncAcquire, SyncMode,
};
use crate::surface::{ChannelOrder, SurfaceSize};
use crate::transport::bridge::{SharedAttachment, SharedTarget, WriteAccess};
use crate::transport::{InteropAttachment, TransportCapability};
use std::time::Duration;

struct Registration {
    handle: SharedResourceHandle,
    color: ColorTarget,
    object: InteropObject,
    framebuffer: FramebufferId,
}

/// Pieces of a registration under construction, so a failed step can undo
/// exactly what the earlier steps made.
#[derive(Default)]
struct Partial {
    handle: Option<SharedResourceHandle>,
    color: Option<ColorTarget>,
    object: Option<InteropObject>,
    locked: bool,
    framebuffer: Option<FramebufferId>,
}

pub(crate) struct InteropTarget {
    provider: Box<dyn InteropProvider>,
    attachment: InteropAttachment,
    sync_mode: SyncMode,
    sync_timeout: Duration,
    current: Option<Registration>,
    locked: bool,
    holding_sync: bool,
}

impl InteropTarget {
    pub fn new(
        provider: Box<dyn InteropProvider>,
        attachment: InteropAttachment,
        sync_mode: SyncMode,
        sync_timeout: Duration,
    ) -> Self {
        Self {
            provider,
            attachment,
            sync_mode,
            sync_timeout,
            current: None,
            locked: false,
            holding_sync: false,
        }
    }

    pub fn with_attachment(mut self, attachment: InteropAttachment) -> Self {
        self.attachment = attachment;
        self
    }

    /// Gives the provider back, releasing nothing. Used after a failed probe.
    pub fn into_provider(self) -> Box<dyn InteropProvider> {
        self.provider
    }

    fn build(
        &mut self,
        device: &mut dyn GraphicsDevice,
        size: SurfaceSize,
        order: ChannelOrder,
        generation: u64,
        partial: &mut Partial,
    ) -> Result<(), DeviceError> {
        self.provider.open(device)?;
        let keyed = self.sync_mode == SyncMode::KeyedMutex;
        let handle = partial
            .handle
            .insert(self.provider.create_shared_texture(size, order, keyed, generation)?)
            .clone();

        let color = match self.attachment {
            InteropAttachment::Texture => ColorTarget::Texture(device.gen_texture()?),
            InteropAttachment::Renderbuffer => ColorTarget::Renderbuffer(device.gen_renderbuffer()?),
        };
        partial.color = Some(color);

        let object = self.provider.register(device, &handle, color)?;
        partial.object = Some(object);

        self.provider.lock(object)?;
        partial.locked = true;

        let fb = device.gen_framebuffer()?;
        partial.framebuffer = Some(fb);
        device.attach_color(fb, color)?;
        device.set_draw_buffers(fb)?;
        let status = device.check_framebuffer(fb);

        self.provider.unlock(object)?;
        partial.locked = false;

        if !status.is_complete() {
            return Err(DeviceError::InvalidOperation(format!(
                "shared framebuffer incomplete: {status:?}"
            )));
        }
        Ok(())
    }

    fn discard(&mut self, device: &mut dyn GraphicsDevice, partial: Partial) {
        if let Some(object) = partial.object {
            if partial.locked {
                let _ = self.provider.unlock(object);
            }
            self.provider.unregister(device, object);
        }
        if let Some(fb) = partial.framebuffer {
            device.delete_framebuffer(fb);
        }
        match partial.color {
            Some(ColorTarget::Texture(tex)) => device.delete_texture(tex),
            Some(ColorTarget::Renderbuffer(rb)) => device.delete_renderbuffer(rb),
            None => {}
        }
        if let Some(handle) = partial.handle {
            self.provider.release_shared_texture(&handle);
        }
    }
}

impl SharedTarget for InteropTarget {
    fn capability(&self) -> TransportCapability {
        TransportCapability::CrossApiInterop(self.attachment)
    }

    fn sync_mode(&self) -> Option<SyncMode> {
        Some(self.sync_mode)
    }

    fn allocate(
        &mut self,
        device: &mut dyn GraphicsDevice,
        size: SurfaceSize,
        order: ChannelOrder,
        generation: u64,
    ) -> Result<SharedAttachment, DeviceError> {
        self.release(device);

        let mut partial = Partial::default();
        if let Err(e) = self.build(device, size, order, generation, &mut partial) {
            self.discard(device, partial);
            return Err(e);
        }

        match partial {
            Partial {
                handle: Some(handle),
                color: Some(color),
                object: Some(object),
                framebuffer: Some(framebuffer),
                ..
            } => {
                let attachment = SharedAttachment {
                    handle: handle.clone(),
                    framebuffer,
                };
                self.current = Some(Registration {
                    handle,
                    color,
                    object,
                    framebuffer,
                });
                Ok(attachment)
            }
            partial => {
                self.discard(device, partial);
                Err(DeviceError::InvalidOperation("interop registration incomplete".into()))
            }
        }
    }

    fn begin_write(&mut self, _device: &mut dyn GraphicsDevice) -> Result<WriteAccess, DeviceError> {
        let registration = self
            .current
            .as_ref()
            .ok_or_else(|| DeviceError::InvalidOperation("no shared texture registered".into()))?;

        if let Some(token) = registration.handle.sync.filter(|_| self.sync_mode == SyncMode::KeyedMutex) {
            match self
                .provider
                .acquire_sync(&registration.handle, token.producer_key, self.sync_timeout)?
            {
                SyncAcquire::Acquired => self.holding_sync = true,
                SyncAcquire::TimedOut => return Ok(WriteAccess::TimedOut),
            }
        }

        if let Err(e) = self.provider.lock(registration.object) {
            if self.holding_sync {
                if let Some(token) = registration.handle.sync {
                    let _ = self.provider.release_sync(&registration.handle, token.producer_key);
                }
                self.holding_sync = false;
            }
            return Err(e);
        }
        self.locked = true;
        Ok(WriteAccess::Granted)
    }

    fn end_write(&mut self, _device: &mut dyn GraphicsDevice) -> Result<(), DeviceError> {
        let Some(registration) = self.current.as_ref() else {
            return Ok(());
        };

        let mut result = Ok(());
        if self.locked {
            self.locked = false;
            result = self.provider.unlock(registration.object);
        }
        if self.holding_sync {
            self.holding_sync = false;
            if let Some(token) = registration.handle.sync {
                let released = self.provider.release_sync(&registration.handle, token.consumer_key);
                result = result.and(released);
            }
        }
        result
    }

    fn release(&mut self, device: &mut dyn GraphicsDevice) {
        let Some(registration) = self.current.take() else {
            return;
        };

        if self.holding_sync {
            if let Some(token) = registration.handle.sync {
                let _ = self.provider.release_sync(&registration.handle, token.consumer_key);
            }
            self.holding_sync = false;
        }
        let locked = std::mem::take(&mut self.locked);
        self.discard(
            device,
            Partial {
                handle: Some(registration.handle),
                color: Some(registration.color),
                object: Some(registration.object),
                locked,
                framebuffer: Some(registration.framebuffer),
            },
        );
    }

    fn shutdown(&mut self, device: &mut dyn GraphicsDevice) {
        self.release(device);
        self.provider.close(device);
    }
}
