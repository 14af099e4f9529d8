//! Shared target for the native shared-memory tier.

use crate::render::{
    ColorTarget, DeviceError, FramebufferId, GraphicsDevice, NativeSurfaceProvider, SharedResourceHandle, SyncMode,
    TextureId,
};
use crate::surface::{ChannelOrder, SurfaceSize};
use crate::transport::bridge::{SharedAttachment, SharedTarget, WriteAccess};
use crate::transport::TransportCapability;

struct Imported {
    handle: SharedResourceHandle,
    texture: TextureId,
    framebuffer: FramebufferId,
}

/// Native surfaces need no per-frame lock: ordering against the host comes
/// from the flush fence the notification waits on.
pub(crate) struct NativeTarget {
    provider: Box<dyn NativeSurfaceProvider>,
    current: Option<Imported>,
}

impl NativeTarget {
    pub fn new(provider: Box<dyn NativeSurfaceProvider>) -> Self {
        Self { provider, current: None }
    }

    pub fn into_provider(self) -> Box<dyn NativeSurfaceProvider> {
        self.provider
    }
}

impl SharedTarget for NativeTarget {
    fn capability(&self) -> TransportCapability {
        TransportCapability::NativeSharedMemory
    }

    fn sync_mode(&self) -> Option<SyncMode> {
        None
    }

    fn allocate(
        &mut self,
        device: &mut dyn GraphicsDevice,
        size: SurfaceSize,
        order: ChannelOrder,
        generation: u64,
    ) -> Result<SharedAttachment, DeviceError> {
        self.release(device);

        let handle = self.provider.create(size, order, generation)?;
        let texture = match self.provider.import(device, &handle) {
            Ok(texture) => texture,
            Err(e) => {
                self.provider.release(device, &handle, None);
                return Err(e);
            }
        };

        let framebuffer = match device.gen_framebuffer() {
            Ok(fb) => fb,
            Err(e) => {
                self.provider.release(device, &handle, Some(texture));
                return Err(e);
            }
        };

        let status = device
            .attach_color(framebuffer, ColorTarget::Texture(texture))
            .and_then(|_| device.set_draw_buffers(framebuffer))
            .map(|_| device.check_framebuffer(framebuffer));
        match status {
            Ok(status) if status.is_complete() => {}
            other => {
                device.delete_framebuffer(framebuffer);
                self.provider.release(device, &handle, Some(texture));
                return Err(match other {
                    Err(e) => e,
                    Ok(status) => DeviceError::InvalidOperation(format!("native framebuffer incomplete: {status:?}")),
                });
            }
        }

        self.current = Some(Imported {
            handle: handle.clone(),
            texture,
            framebuffer,
        });
        Ok(SharedAttachment { handle, framebuffer })
    }

    fn begin_write(&mut self, _device: &mut dyn GraphicsDevice) -> Result<WriteAccess, DeviceError> {
        if self.current.is_none() {
            return Err(DeviceError::InvalidOperation("no native surface imported".into()));
        }
        Ok(WriteAccess::Granted)
    }

    fn end_write(&mut self, _device: &mut dyn GraphicsDevice) -> Result<(), DeviceError> {
        Ok(())
    }

    fn release(&mut self, device: &mut dyn GraphicsDevice) {
        if let Some(imported) = self.current.take() {
            device.delete_framebuffer(imported.framebuffer);
            self.provider.release(device, &imported.handle, Some(imported.texture));
        }
    }

    fn shutdown(&mut self, device: &mut dyn GraphicsDevice) {
        self.release(device);
    }
}
