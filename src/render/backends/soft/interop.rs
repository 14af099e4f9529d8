use super::image::{SharedStore, SoftImage};
use super::{SoftDevice, SoftFaults};
use crate::render::{
    AdapterInfo, ColorTarget, DeviceError, GraphicsDevice, InteropObject, InteropProvider, SharedResourceHandle,
    SharedResourceKind, SyncAcquire, SyncToken,
};
use crate::surface::{ChannelOrder, SurfaceSize};
use crate::sync::LockExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Extension string the soft device advertises when interop is present.
pub const INTEROP_EXTENSION: &str = "SOFT_shared_texture_interop";

#[derive(Debug, Clone)]
pub struct SoftInteropOptions {
    /// Adapter of the foreign device. Compared against the producer's.
    pub adapter: AdapterInfo,
    /// Whether the producer device advertises the extension at all.
    pub extension_present: bool,
    pub accept_texture: bool,
    pub accept_renderbuffer: bool,
    /// Fails opening the interop device.
    pub fail_open: bool,
}

impl Default for SoftInteropOptions {
    fn default() -> Self {
        Self {
            adapter: AdapterInfo::new("Soft Rasterizer", "frame-bridge"),
            extension_present: true,
            accept_texture: true,
            accept_renderbuffer: true,
            fail_open: false,
        }
    }
}

struct Registration {
    raw: u64,
    target: ColorTarget,
    locked: bool,
}

/// Interop provider of the soft backend. Shared textures live in host-visible
/// memory; registration makes the producer's object use that memory directly.
pub struct SoftInterop {
    options: SoftInteropOptions,
    store: Arc<SharedStore>,
    faults: Arc<SoftFaults>,
    open: bool,
    next_object: u64,
    objects: HashMap<u64, Registration>,
}

impl SoftInterop {
    pub(crate) fn new(options: SoftInteropOptions, store: Arc<SharedStore>, faults: Arc<SoftFaults>) -> Self {
        Self {
            options,
            store,
            faults,
            open: false,
            next_object: 1,
            objects: HashMap::new(),
        }
    }

    fn set_flags(&self, raw: u64, registered: Option<bool>, locked: Option<bool>) {
        if let Some(image) = self.store.get(raw) {
            let mut image = image.lock_or_recover();
            if let Some(r) = registered {
                image.registered = r;
            }
            if let Some(l) = locked {
                image.locked = l;
            }
        }
    }
}

fn soft(device: &mut dyn GraphicsDevice) -> Result<&mut SoftDevice, DeviceError> {
    device
        .as_any_mut()
        .downcast_mut::<SoftDevice>()
        .ok_or_else(|| DeviceError::Unsupported("soft interop used with a non-soft device".into()))
}

impl InteropProvider for SoftInterop {
    fn name(&self) -> &str {
        "soft-interop"
    }

    fn adapter_info(&self) -> AdapterInfo {
        self.options.adapter.clone()
    }

    fn is_available(&self, device: &dyn GraphicsDevice) -> bool {
        device
            .as_any()
            .downcast_ref::<SoftDevice>()
            .map(|d| d.has_extension(INTEROP_EXTENSION))
            .unwrap_or(false)
    }

    fn open(&mut self, device: &mut dyn GraphicsDevice) -> Result<(), DeviceError> {
        if self.open {
            return Ok(());
        }
        soft(device)?;
        if self.options.fail_open {
            return Err(DeviceError::Unsupported("interop device could not be opened".into()));
        }
        self.open = true;
        Ok(())
    }

    fn close(&mut self, _device: &mut dyn GraphicsDevice) {
        self.open = false;
    }

    fn create_shared_texture(
        &mut self,
        size: SurfaceSize,
        order: ChannelOrder,
        keyed_mutex: bool,
        generation: u64,
    ) -> Result<SharedResourceHandle, DeviceError> {
        if !self.open {
            return Err(DeviceError::InvalidOperation("interop device not open".into()));
        }
        let raw = self.store.insert(SoftImage::new(size, order), keyed_mutex);
        Ok(SharedResourceHandle {
            raw,
            kind: SharedResourceKind::InteropTexture,
            size,
            order,
            generation,
            sync: keyed_mutex.then(SyncToken::default),
        })
    }

    fn release_shared_texture(&mut self, handle: &SharedResourceHandle) {
        self.store.remove(handle.raw);
    }

    fn register(
        &mut self,
        device: &mut dyn GraphicsDevice,
        handle: &SharedResourceHandle,
        target: ColorTarget,
    ) -> Result<InteropObject, DeviceError> {
        if !self.open {
            return Err(DeviceError::InvalidOperation("interop device not open".into()));
        }
        let accepted = match target {
            ColorTarget::Texture(_) => self.options.accept_texture,
            ColorTarget::Renderbuffer(_) => self.options.accept_renderbuffer,
        };
        if !accepted {
            return Err(DeviceError::Unsupported(format!("driver refused to register {target:?}")));
        }

        let image = self
            .store
            .get(handle.raw)
            .ok_or_else(|| DeviceError::UnknownObject(format!("shared resource {handle}")))?;
        soft(device)?.bind_storage(target, image.clone())?;
        image.lock_or_recover().registered = true;

        let id = self.next_object;
        self.next_object += 1;
        self.objects.insert(
            id,
            Registration {
                raw: handle.raw,
                target,
                locked: false,
            },
        );
        Ok(InteropObject(id))
    }

    fn unregister(&mut self, device: &mut dyn GraphicsDevice, object: InteropObject) {
        let Some(registration) = self.objects.remove(&object.0) else {
            return;
        };
        if let Ok(device) = soft(device) {
            device.unbind_storage(registration.target);
        }
        self.set_flags(registration.raw, Some(false), Some(false));
    }

    fn lock(&mut self, object: InteropObject) -> Result<(), DeviceError> {
        if self.faults.interop_lock_fails() {
            return Err(DeviceError::InvalidOperation("interop lock failed".into()));
        }
        let registration = self
            .objects
            .get_mut(&object.0)
            .ok_or_else(|| DeviceError::UnknownObject(format!("{object:?}")))?;
        if registration.locked {
            return Err(DeviceError::InvalidOperation(format!("{object:?} already locked")));
        }
        registration.locked = true;
        let raw = registration.raw;
        self.set_flags(raw, None, Some(true));
        Ok(())
    }

    fn unlock(&mut self, object: InteropObject) -> Result<(), DeviceError> {
        let registration = self
            .objects
            .get_mut(&object.0)
            .ok_or_else(|| DeviceError::UnknownObject(format!("{object:?}")))?;
        if !registration.locked {
            return Err(DeviceError::InvalidOperation(format!("{object:?} is not locked")));
        }
        registration.locked = false;
        let raw = registration.raw;
        self.set_flags(raw, None, Some(false));
        Ok(())
    }

    fn acquire_sync(&mut self, handle: &SharedResourceHandle, key: u64, timeout: Duration) -> Result<SyncAcquire, DeviceError> {
        self.store.acquire(handle.raw, key, timeout)
    }

    fn release_sync(&mut self, handle: &SharedResourceHandle, key: u64) -> Result<(), DeviceError> {
        self.store.release(handle.raw, key)
    }
}
