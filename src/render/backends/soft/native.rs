use super::image::{SharedStore, SoftImage};
use super::SoftDevice;
use crate::render::{
    ColorTarget, DeviceError, GraphicsDevice, NativeSurfaceProvider, SharedResourceHandle, SharedResourceKind,
    TextureId,
};
use crate::surface::{ChannelOrder, SurfaceSize};
use std::sync::Arc;

/// Extension string the soft device advertises when native surfaces are present.
pub const NATIVE_EXTENSION: &str = "SOFT_native_surface";

/// Native shared surfaces of the soft backend. An imported surface is a device
/// texture whose storage is the host-visible memory itself.
pub struct SoftNative {
    store: Arc<SharedStore>,
}

impl SoftNative {
    pub(crate) fn new(store: Arc<SharedStore>) -> Self {
        Self { store }
    }
}

impl NativeSurfaceProvider for SoftNative {
    fn name(&self) -> &str {
        "soft-native"
    }

    fn is_available(&self, device: &dyn GraphicsDevice) -> bool {
        device
            .as_any()
            .downcast_ref::<SoftDevice>()
            .map(|d| d.has_extension(NATIVE_EXTENSION))
            .unwrap_or(false)
    }

    fn create(&mut self, size: SurfaceSize, order: ChannelOrder, generation: u64) -> Result<SharedResourceHandle, DeviceError> {
        let raw = self.store.insert(SoftImage::new(size, order), false);
        Ok(SharedResourceHandle {
            raw,
            kind: SharedResourceKind::NativeSurface,
            size,
            order,
            generation,
            sync: None,
        })
    }

    fn import(&mut self, device: &mut dyn GraphicsDevice, handle: &SharedResourceHandle) -> Result<TextureId, DeviceError> {
        let image = self
            .store
            .get(handle.raw)
            .ok_or_else(|| DeviceError::UnknownObject(format!("native surface {handle}")))?;
        let soft = device
            .as_any_mut()
            .downcast_mut::<SoftDevice>()
            .ok_or_else(|| DeviceError::Unsupported("soft native surface used with a non-soft device".into()))?;

        let tex = soft.gen_texture()?;
        if let Err(e) = soft.bind_storage(ColorTarget::Texture(tex), image) {
            soft.delete_texture(tex);
            return Err(e);
        }
        Ok(tex)
    }

    fn release(&mut self, device: &mut dyn GraphicsDevice, handle: &SharedResourceHandle, texture: Option<TextureId>) {
        if let Some(texture) = texture {
            device.delete_texture(texture);
        }
        self.store.remove(handle.raw);
    }
}
