//! The producer's graphics API as seen by the transport.
//!
//! [`GraphicsDevice`] is thread-affine: it is created on the render thread and
//! every call happens there. Object names ([`FramebufferId`], [`TextureId`],
//! [`RenderbufferId`]) are allocated without storage and given storage
//! separately, so a resize can reallocate storage while every name stays the
//! same.

use crate::render::Viewport;
use crate::surface::{ChannelOrder, DepthStencilFormat, Origin, SurfaceSize};
use std::any::Any;
use std::fmt::Display;
use std::time::Duration;

/// Framebuffer name. `FramebufferId::DEFAULT` is the window-system framebuffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FramebufferId(pub u32);

impl FramebufferId {
    pub const DEFAULT: FramebufferId = FramebufferId(0);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RenderbufferId(pub u32);

/// Completion fence of a flushed batch of GPU work.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct FenceId(pub u64);

/// Identifies a graphics context. What "current" means is up to the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ContextToken(pub u64);

/// Where a framebuffer's color attachment points.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ColorTarget {
    Texture(TextureId),
    Renderbuffer(RenderbufferId),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FramebufferStatus {
    Complete,
    IncompleteAttachment,
    MissingAttachment,
    IncompleteDimensions,
    IncompleteDrawBuffer,
    Unsupported,
}

impl FramebufferStatus {
    pub fn is_complete(&self) -> bool {
        matches!(self, FramebufferStatus::Complete)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceStatus {
    Ok,
    Lost,
}

/// Blit rectangle. `y0 > y1` flips the copy vertically.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlitRect {
    pub x0: i32,
    pub y0: i32,
    pub x1: i32,
    pub y1: i32,
}

impl BlitRect {
    pub fn new(x0: i32, y0: i32, x1: i32, y1: i32) -> Self {
        Self { x0, y0, x1, y1 }
    }

    pub fn from_viewport(vp: Viewport) -> Self {
        Self::new(vp.x, vp.y, vp.x + vp.width as i32, vp.y + vp.height as i32)
    }

    /// Same rectangle with the rows reversed.
    pub fn flipped(&self) -> Self {
        Self::new(self.x0, self.y1, self.x1, self.y0)
    }

    pub fn width(&self) -> u32 {
        (self.x1 - self.x0).unsigned_abs()
    }

    pub fn height(&self) -> u32 {
        (self.y1 - self.y0).unsigned_abs()
    }

    pub fn is_flipped_y(&self) -> bool {
        self.y0 > self.y1
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum DepthFunc {
    Less,
    #[default]
    LessOrEqual,
    Always,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CullFace {
    Front,
    Back,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrontFace {
    Clockwise,
    CounterClockwise,
}

/// Fixed-function state the factory establishes on a fresh or resized surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderState {
    pub viewport: Viewport,
    pub scissor: Viewport,
    pub scissor_test: bool,
    pub depth_test: bool,
    pub depth_func: DepthFunc,
    pub cull_face: Option<CullFace>,
    pub front_face: FrontFace,
}

impl RenderState {
    /// Full-surface viewport and scissor, depth `<=`, back faces culled with
    /// clockwise winding, scissor test on.
    pub fn for_surface(size: SurfaceSize) -> Self {
        Self {
            viewport: Viewport::full(size),
            scissor: Viewport::full(size),
            scissor_test: true,
            depth_test: true,
            depth_func: DepthFunc::LessOrEqual,
            cull_face: Some(CullFace::Back),
            front_face: FrontFace::Clockwise,
        }
    }
}

bitflags::bitflags! {
    /// Buffers cleared by [`GraphicsDevice::clear`].
    pub struct ClearMask: u32 {
        const COLOR = 0b001;
        const DEPTH = 0b010;
        const STENCIL = 0b100;
    }
}

/// GPU adapter identity, used to check that both sides share a GPU.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AdapterInfo {
    pub name: String,
    pub vendor: String,
}

impl AdapterInfo {
    pub fn new(name: impl Into<String>, vendor: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vendor: vendor.into(),
        }
    }

    /// Driver strings rarely agree verbatim ("NVIDIA GeForce RTX 3070/PCIe/SSE2"
    /// against "NVIDIA GeForce RTX 3070"), so names match case-insensitively if
    /// either contains the other. An unknown name matches anything.
    pub fn matches(&self, other: &AdapterInfo) -> bool {
        let a = self.name.trim().to_lowercase();
        let b = other.name.trim().to_lowercase();
        if a.is_empty() || b.is_empty() {
            return true;
        }
        a.contains(&b) || b.contains(&a)
    }
}

impl Display for AdapterInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.vendor.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{} ({})", self.name, self.vendor)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("context is not current")]
    ContextNotCurrent,

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("unknown object: {0}")]
    UnknownObject(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("device lost")]
    Lost,
}

/// Called once when the GPU work behind a fence has completed. May run on any thread.
pub type CompletionCallback = Box<dyn FnOnce(FenceId) + Send + 'static>;

/// The producer's graphics API. All calls happen on the thread that created it.
pub trait GraphicsDevice {
    fn name(&self) -> &str;

    fn adapter_info(&self) -> AdapterInfo;

    /// Row order of this device's framebuffers.
    fn origin(&self) -> Origin;

    fn status(&self) -> DeviceStatus;

    /// The device's own context.
    fn context(&self) -> ContextToken;

    /// The context current on the calling thread, whichever device it belongs to.
    fn current_context(&self) -> Option<ContextToken>;

    fn make_current(&mut self) -> Result<(), DeviceError>;

    /// Makes `previous` current again (or nothing, for `None`).
    fn restore_context(&mut self, previous: Option<ContextToken>) -> Result<(), DeviceError>;

    /// Destroys the context. Pending work is finished first. Later calls fail.
    fn destroy_context(&mut self);

    fn gen_framebuffer(&mut self) -> Result<FramebufferId, DeviceError>;
    fn delete_framebuffer(&mut self, fb: FramebufferId);

    /// Creates a texture name with no storage.
    fn gen_texture(&mut self) -> Result<TextureId, DeviceError>;

    /// Allocates (or reallocates) the storage of `tex`. Contents become undefined.
    fn texture_storage(&mut self, tex: TextureId, size: SurfaceSize, order: ChannelOrder) -> Result<(), DeviceError>;
    fn delete_texture(&mut self, tex: TextureId);

    /// Creates a renderbuffer name with no storage.
    fn gen_renderbuffer(&mut self) -> Result<RenderbufferId, DeviceError>;
    fn renderbuffer_storage(
        &mut self,
        rb: RenderbufferId,
        size: SurfaceSize,
        format: DepthStencilFormat,
    ) -> Result<(), DeviceError>;
    fn delete_renderbuffer(&mut self, rb: RenderbufferId);

    fn attach_color(&mut self, fb: FramebufferId, target: ColorTarget) -> Result<(), DeviceError>;

    /// Attaches (or with `None`, detaches) the depth/stencil renderbuffer.
    fn attach_depth_stencil(&mut self, fb: FramebufferId, rb: Option<RenderbufferId>) -> Result<(), DeviceError>;

    /// Declares color attachment 0 as the draw and read buffer of `fb`.
    fn set_draw_buffers(&mut self, fb: FramebufferId) -> Result<(), DeviceError>;

    fn check_framebuffer(&mut self, fb: FramebufferId) -> FramebufferStatus;

    fn bind_framebuffer(&mut self, fb: FramebufferId) -> Result<(), DeviceError>;
    fn bound_framebuffer(&self) -> FramebufferId;

    fn apply_state(&mut self, state: &RenderState) -> Result<(), DeviceError>;
    fn set_viewport(&mut self, viewport: Viewport) -> Result<(), DeviceError>;
    fn viewport(&self) -> Viewport;
    fn set_scissor(&mut self, scissor: Viewport) -> Result<(), DeviceError>;
    fn scissor(&self) -> Viewport;

    /// Clears the bound framebuffer, restricted to the scissor box when the
    /// scissor test is on. Color components are in `[0, 1]`, RGBA.
    fn clear(&mut self, color: [f32; 4], mask: ClearMask) -> Result<(), DeviceError>;

    /// Copies color from `src_fb` to `dst_fb`. Rectangles may be flipped.
    fn blit(&mut self, src_fb: FramebufferId, src: BlitRect, dst_fb: FramebufferId, dst: BlitRect)
        -> Result<(), DeviceError>;

    /// Reads `rect` of `fb` as tightly packed RGBA rows in framebuffer row order.
    fn read_pixels(&mut self, fb: FramebufferId, rect: Viewport) -> Result<Vec<u8>, DeviceError>;

    /// Submits pending work. `on_complete` runs once the GPU has finished it.
    fn flush(&mut self, on_complete: CompletionCallback) -> Result<FenceId, DeviceError>;

    /// Blocks until all submitted work has completed.
    fn finish(&mut self) -> Result<(), DeviceError>;

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Runs `f` with the device's context current, then restores whatever was
/// current before, even if `f` fails.
pub fn with_current_context<R, E>(
    device: &mut dyn GraphicsDevice,
    f: impl FnOnce(&mut dyn GraphicsDevice) -> Result<R, E>,
) -> Result<R, E>
where
    E: From<DeviceError>,
{
    let previous = device.current_context();
    let switch = previous != Some(device.context());
    if switch {
        device.make_current()?;
    }

    let result = f(&mut *device);

    if switch {
        if let Err(e) = device.restore_context(previous) {
            log::warn!("{}: failed to restore previous context: {}", device.name(), e);
        }
    }
    result
}

/// Factory that builds the producer device. Runs on the render thread.
pub type DeviceFactory = Box<dyn FnOnce() -> Result<Box<dyn GraphicsDevice>, DeviceError> + Send + 'static>;
