//! Shared-resource providers: the foreign API a zero-copy tier hands frames to.

use crate::render::{AdapterInfo, ColorTarget, DeviceError, DeviceFactory, GraphicsDevice, TextureId};
use crate::surface::{ChannelOrder, SurfaceSize};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SharedResourceKind {
    /// Platform shared surface (IOSurface, AHardwareBuffer, dma-buf).
    NativeSurface,
    /// Texture owned by a foreign API and registered through an interop extension.
    InteropTexture,
}

/// Keyed-mutex token on a shared resource. The producer writes while holding
/// `producer_key` and hands over by releasing with `consumer_key`. The host
/// does the reverse.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SyncToken {
    pub producer_key: u64,
    pub consumer_key: u64,
}

impl Default for SyncToken {
    fn default() -> Self {
        Self {
            producer_key: 0,
            consumer_key: 1,
        }
    }
}

/// Opaque reference to memory both sides can resolve.
///
/// A new generation is created on every resize. Hosts should re-query the
/// handle each time they sample rather than caching it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SharedResourceHandle {
    pub raw: u64,
    pub kind: SharedResourceKind,
    pub size: SurfaceSize,
    pub order: ChannelOrder,
    pub generation: u64,
    pub sync: Option<SyncToken>,
}

impl Display for SharedResourceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}#{:x} {} gen {}", self.kind, self.raw, self.size, self.generation)
    }
}

/// How producer and host serialize access to a shared texture.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncMode {
    /// Interop object lock around each write. Always on for interop.
    #[default]
    InteropLock,
    /// Additionally a keyed mutex on the shared texture. The host must acquire
    /// key 1 before sampling and release with key 0 afterwards.
    KeyedMutex,
}

/// Interop registration of a shared texture with a device object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InteropObject(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncAcquire {
    Acquired,
    TimedOut,
}

/// A foreign graphics API plus the driver extension that lets the producer
/// device render into its textures.
pub trait InteropProvider: Send {
    fn name(&self) -> &str;

    /// Adapter the foreign API's device runs on.
    fn adapter_info(&self) -> AdapterInfo;

    /// Whether the producer device exposes the interop extension.
    fn is_available(&self, device: &dyn GraphicsDevice) -> bool;

    /// Opens the interop device. Idempotent.
    fn open(&mut self, device: &mut dyn GraphicsDevice) -> Result<(), DeviceError>;
    fn close(&mut self, device: &mut dyn GraphicsDevice);

    fn create_shared_texture(
        &mut self,
        size: SurfaceSize,
        order: ChannelOrder,
        keyed_mutex: bool,
        generation: u64,
    ) -> Result<SharedResourceHandle, DeviceError>;
    fn release_shared_texture(&mut self, handle: &SharedResourceHandle);

    /// Binds the shared texture's storage to a device texture or renderbuffer name.
    fn register(
        &mut self,
        device: &mut dyn GraphicsDevice,
        handle: &SharedResourceHandle,
        target: ColorTarget,
    ) -> Result<InteropObject, DeviceError>;
    fn unregister(&mut self, device: &mut dyn GraphicsDevice, object: InteropObject);

    fn lock(&mut self, object: InteropObject) -> Result<(), DeviceError>;
    fn unlock(&mut self, object: InteropObject) -> Result<(), DeviceError>;

    fn acquire_sync(&mut self, handle: &SharedResourceHandle, key: u64, timeout: Duration)
        -> Result<SyncAcquire, DeviceError>;
    fn release_sync(&mut self, handle: &SharedResourceHandle, key: u64) -> Result<(), DeviceError>;
}

/// Platform shared surfaces that import directly as a device texture.
pub trait NativeSurfaceProvider: Send {
    fn name(&self) -> &str;

    fn is_available(&self, device: &dyn GraphicsDevice) -> bool;

    fn create(&mut self, size: SurfaceSize, order: ChannelOrder, generation: u64)
        -> Result<SharedResourceHandle, DeviceError>;

    /// Imports the surface as a storage-backed device texture.
    fn import(&mut self, device: &mut dyn GraphicsDevice, handle: &SharedResourceHandle) -> Result<TextureId, DeviceError>;

    /// Releases the surface and, if it was imported, its device texture.
    fn release(&mut self, device: &mut dyn GraphicsDevice, handle: &SharedResourceHandle, texture: Option<TextureId>);
}

/// Host-side access to shared resources, for hosts that sample on the CPU
/// (and for tests).
pub trait SharedSurfaceReader: Send + Sync {
    /// Tightly packed rows, top row first, in the handle's channel order.
    fn read(&self, handle: &SharedResourceHandle) -> Result<Vec<u8>, DeviceError>;
}

/// Everything needed to bring up the producer side of a surface.
pub struct GraphicsPlatform {
    /// Runs on the render thread.
    pub device: DeviceFactory,
    pub interop: Option<Box<dyn InteropProvider>>,
    pub native: Option<Box<dyn NativeSurfaceProvider>>,
}

impl GraphicsPlatform {
    pub fn new(device: DeviceFactory) -> Self {
        Self {
            device,
            interop: None,
            native: None,
        }
    }

    pub fn with_interop(mut self, provider: Box<dyn InteropProvider>) -> Self {
        self.interop = Some(provider);
        self
    }

    pub fn with_native(mut self, provider: Box<dyn NativeSurfaceProvider>) -> Self {
        self.native = Some(provider);
        self
    }
}

impl std::fmt::Debug for GraphicsPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphicsPlatform")
            .field("interop", &self.interop.as_ref().map(|p| p.name().to_string()))
            .field("native", &self.native.as_ref().map(|p| p.name().to_string()))
            .finish()
    }
}
