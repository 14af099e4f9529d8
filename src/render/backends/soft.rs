//! Soft backend: a CPU-memory implementation of the producer device, of a
//! cross-API interop provider and of a native shared-surface provider.
//!
//! It behaves like an OpenGL producer (bottom-left origin, RGBA storage,
//! storage-less object names, per-thread current context) so the transport's
//! flips and swizzles run for real. Every capability can be switched off or
//! made to fail through [`SoftFaults`] and the option structs.
//!
//! ```
//! use frame_bridge::render::backends::soft::{SoftInteropOptions, SoftPlatform};
//!
//! let (platform, handles) = SoftPlatform::new()
//!     .with_interop(SoftInteropOptions::default())
//!     .build();
//! assert!(platform.interop.is_some());
//! assert_eq!(handles.host.live_resources(), 0);
//! ```

mod image;
mod interop;
mod native;

pub use image::{SharedImage, SoftHostView, SoftImage};
pub use interop::{SoftInterop, SoftInteropOptions, INTEROP_EXTENSION};
pub use native::{SoftNative, NATIVE_EXTENSION};

use crate::render::{
    AdapterInfo, BlitRect, ClearMask, ColorTarget, CompletionCallback, ContextToken, DeviceError, DeviceStatus,
    FenceId, FramebufferId, FramebufferStatus, GraphicsDevice, GraphicsPlatform, RenderState, RenderbufferId,
    TextureId, Viewport,
};
use crate::surface::{ChannelOrder, DepthStencilFormat, Origin, SurfaceSize};
use crate::sync::LockExt;
use image::SharedStore;
use std::any::Any;
use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

thread_local! {
    static CURRENT_CONTEXT: Cell<Option<u64>> = Cell::new(None);
}

static NEXT_CONTEXT: AtomicU64 = AtomicU64::new(1);

/// When the soft "GPU" signals completion of flushed work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuCompletion {
    /// Inside `flush`, on the render thread.
    Immediate,
    /// On a separate completion thread after the given latency.
    Deferred(Duration),
}

#[derive(Debug, Clone)]
pub struct SoftDeviceOptions {
    pub name: String,
    pub adapter: AdapterInfo,
    pub origin: Origin,
    pub max_texture_size: u32,
    /// Depth/stencil formats the device refuses to allocate.
    pub rejected_depth_formats: Vec<DepthStencilFormat>,
    pub completion: GpuCompletion,
    pub extensions: Vec<String>,
    /// Makes device creation fail, as a context that cannot be created.
    pub fail_creation: bool,
}

impl Default for SoftDeviceOptions {
    fn default() -> Self {
        Self {
            name: "soft".to_string(),
            adapter: AdapterInfo::new("Soft Rasterizer", "frame-bridge"),
            origin: Origin::BottomLeft,
            max_texture_size: 16384,
            rejected_depth_formats: Vec::new(),
            completion: GpuCompletion::Immediate,
            extensions: Vec::new(),
            fail_creation: false,
        }
    }
}

/// Runtime fault switches and counters, shared with whoever drives the test.
#[derive(Debug, Default)]
pub struct SoftFaults {
    device_lost: AtomicBool,
    fail_blits: AtomicBool,
    fail_interop_lock: AtomicBool,
    incomplete_checks: AtomicU32,
    blits: AtomicU64,
    storage_allocations: AtomicU64,
}

impl SoftFaults {
    pub fn lose_device(&self) {
        self.device_lost.store(true, Ordering::SeqCst);
    }

    pub fn is_device_lost(&self) -> bool {
        self.device_lost.load(Ordering::SeqCst)
    }

    pub fn set_fail_blits(&self, fail: bool) {
        self.fail_blits.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_interop_lock(&self, fail: bool) {
        self.fail_interop_lock.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn interop_lock_fails(&self) -> bool {
        self.fail_interop_lock.load(Ordering::SeqCst)
    }

    /// The next `n` completeness checks report an unsupported framebuffer.
    pub fn fail_next_completeness_checks(&self, n: u32) {
        self.incomplete_checks.store(n, Ordering::SeqCst);
    }

    fn take_incomplete(&self) -> bool {
        self.incomplete_checks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    pub fn blit_count(&self) -> u64 {
        self.blits.load(Ordering::SeqCst)
    }

    /// Texture storage (re)allocations, including the initial ones.
    pub fn storage_allocations(&self) -> u64 {
        self.storage_allocations.load(Ordering::SeqCst)
    }
}

/// Submitted and completed fences of one soft device.
#[derive(Debug, Default)]
pub struct SoftTimeline {
    submitted: AtomicU64,
    completed: Mutex<u64>,
    cond: Condvar,
}

impl SoftTimeline {
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> u64 {
        *self.completed.lock_or_recover()
    }

    pub fn is_signaled(&self, fence: FenceId) -> bool {
        self.completed() >= fence.0
    }

    fn submit(&self) -> FenceId {
        FenceId(self.submitted.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn signal(&self, fence: FenceId) {
        let mut completed = self.completed.lock_or_recover();
        *completed = (*completed).max(fence.0);
        self.cond.notify_all();
    }

    fn wait_for(&self, fence: u64) {
        let mut completed = self.completed.lock_or_recover();
        while *completed < fence {
            completed = self.cond.wait(completed).unwrap_or_else(|e| e.into_inner());
        }
    }
}

type GpuJob = (FenceId, CompletionCallback);

struct CompletionQueue {
    tx: mpsc::Sender<GpuJob>,
    worker: JoinHandle<()>,
}

impl CompletionQueue {
    fn spawn(latency: Duration, timeline: Arc<SoftTimeline>) -> Result<Self, DeviceError> {
        let (tx, rx) = mpsc::channel::<GpuJob>();
        let worker = std::thread::Builder::new()
            .name("soft-gpu".to_string())
            .spawn(move || {
                while let Ok((fence, callback)) = rx.recv() {
                    std::thread::sleep(latency);
                    timeline.signal(fence);
                    callback(fence);
                }
            })
            .map_err(|e| DeviceError::OutOfMemory(format!("completion thread: {e}")))?;
        Ok(Self { tx, worker })
    }

    fn shutdown(self) {
        drop(self.tx);
        if self.worker.join().is_err() {
            log::warn!("soft: completion thread panicked");
        }
    }
}

#[derive(Debug, Default)]
struct SoftFramebuffer {
    color: Option<ColorTarget>,
    depth_stencil: Option<RenderbufferId>,
    draw_buffers: bool,
}

enum SoftRenderbuffer {
    Empty,
    DepthStencil { size: SurfaceSize, format: DepthStencilFormat },
    Color(SharedImage),
}

/// CPU-memory producer device.
pub struct SoftDevice {
    options: SoftDeviceOptions,
    context: ContextToken,
    alive: bool,
    faults: Arc<SoftFaults>,
    timeline: Arc<SoftTimeline>,
    queue: Option<CompletionQueue>,
    next_name: u32,
    framebuffers: HashMap<u32, SoftFramebuffer>,
    textures: HashMap<u32, Option<SharedImage>>,
    renderbuffers: HashMap<u32, SoftRenderbuffer>,
    bound: FramebufferId,
    state: RenderState,
}

impl SoftDevice {
    pub fn new(options: SoftDeviceOptions, faults: Arc<SoftFaults>, timeline: Arc<SoftTimeline>) -> Result<Self, DeviceError> {
        if options.fail_creation {
            return Err(DeviceError::Unsupported(format!("{}: no usable pixel format", options.name)));
        }

        Ok(Self {
            options,
            context: ContextToken(NEXT_CONTEXT.fetch_add(1, Ordering::SeqCst)),
            alive: true,
            faults,
            timeline,
            queue: None,
            next_name: 1,
            framebuffers: HashMap::new(),
            textures: HashMap::new(),
            renderbuffers: HashMap::new(),
            bound: FramebufferId::DEFAULT,
            state: RenderState::for_surface(SurfaceSize::default()),
        })
    }

    pub fn has_extension(&self, name: &str) -> bool {
        self.options.extensions.iter().any(|e| e == name)
    }

    pub fn faults(&self) -> &Arc<SoftFaults> {
        &self.faults
    }

    pub fn framebuffer_count(&self) -> usize {
        self.framebuffers.len()
    }

    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    pub fn renderbuffer_count(&self) -> usize {
        self.renderbuffers.len()
    }

    pub fn render_state(&self) -> RenderState {
        self.state
    }

    /// Copy of the color storage attached to `fb`.
    pub fn color_snapshot(&self, fb: FramebufferId) -> Result<SoftImage, DeviceError> {
        Ok(self.color_image(fb)?.lock_or_recover().clone())
    }

    /// Backs a texture or renderbuffer name with externally owned storage.
    pub(crate) fn bind_storage(&mut self, target: ColorTarget, image: SharedImage) -> Result<(), DeviceError> {
        self.check()?;
        match target {
            ColorTarget::Texture(tex) => {
                let slot = self
                    .textures
                    .get_mut(&tex.0)
                    .ok_or_else(|| DeviceError::UnknownObject(format!("{tex:?}")))?;
                *slot = Some(image);
            }
            ColorTarget::Renderbuffer(rb) => {
                let slot = self
                    .renderbuffers
                    .get_mut(&rb.0)
                    .ok_or_else(|| DeviceError::UnknownObject(format!("{rb:?}")))?;
                *slot = SoftRenderbuffer::Color(image);
            }
        }
        Ok(())
    }

    pub(crate) fn unbind_storage(&mut self, target: ColorTarget) {
        match target {
            ColorTarget::Texture(tex) => {
                if let Some(slot) = self.textures.get_mut(&tex.0) {
                    *slot = None;
                }
            }
            ColorTarget::Renderbuffer(rb) => {
                if let Some(slot) = self.renderbuffers.get_mut(&rb.0) {
                    *slot = SoftRenderbuffer::Empty;
                }
            }
        }
    }

    fn check(&self) -> Result<(), DeviceError> {
        if !self.alive {
            return Err(DeviceError::InvalidOperation("context destroyed".into()));
        }
        if self.faults.is_device_lost() {
            return Err(DeviceError::Lost);
        }
        if CURRENT_CONTEXT.with(|c| c.get()) != Some(self.context.0) {
            return Err(DeviceError::ContextNotCurrent);
        }
        Ok(())
    }

    fn gen_name(&mut self) -> u32 {
        let name = self.next_name;
        self.next_name += 1;
        name
    }

    fn check_size(&self, size: SurfaceSize) -> Result<(), DeviceError> {
        let max = self.options.max_texture_size;
        if size.width == 0 || size.height == 0 || size.width > max || size.height > max {
            return Err(DeviceError::OutOfMemory(format!("{size} exceeds limits (max {max})")));
        }
        Ok(())
    }

    fn color_image(&self, fb: FramebufferId) -> Result<SharedImage, DeviceError> {
        let framebuffer = self
            .framebuffers
            .get(&fb.0)
            .ok_or_else(|| DeviceError::UnknownObject(format!("{fb:?}")))?;
        match framebuffer.color {
            Some(ColorTarget::Texture(tex)) => self
                .textures
                .get(&tex.0)
                .and_then(|t| t.clone())
                .ok_or_else(|| DeviceError::InvalidOperation(format!("{tex:?} has no storage"))),
            Some(ColorTarget::Renderbuffer(rb)) => match self.renderbuffers.get(&rb.0) {
                Some(SoftRenderbuffer::Color(image)) => Ok(image.clone()),
                _ => Err(DeviceError::InvalidOperation(format!("{rb:?} has no color storage"))),
            },
            None => Err(DeviceError::InvalidOperation(format!("{fb:?} has no color attachment"))),
        }
    }

    fn status_of(&self, fb: FramebufferId) -> FramebufferStatus {
        let Some(framebuffer) = self.framebuffers.get(&fb.0) else {
            return FramebufferStatus::Unsupported;
        };

        let color_size = match framebuffer.color {
            None => return FramebufferStatus::MissingAttachment,
            Some(ColorTarget::Texture(tex)) => match self.textures.get(&tex.0) {
                Some(Some(image)) => image.lock_or_recover().size,
                _ => return FramebufferStatus::IncompleteAttachment,
            },
            Some(ColorTarget::Renderbuffer(rb)) => match self.renderbuffers.get(&rb.0) {
                Some(SoftRenderbuffer::Color(image)) => image.lock_or_recover().size,
                _ => return FramebufferStatus::IncompleteAttachment,
            },
        };

        if let Some(rb) = framebuffer.depth_stencil {
            match self.renderbuffers.get(&rb.0) {
                Some(SoftRenderbuffer::DepthStencil { size, .. }) if *size != color_size => {
                    return FramebufferStatus::IncompleteDimensions;
                }
                Some(SoftRenderbuffer::DepthStencil { .. }) => {}
                _ => return FramebufferStatus::IncompleteAttachment,
            }
        }

        if !framebuffer.draw_buffers {
            return FramebufferStatus::IncompleteDrawBuffer;
        }
        FramebufferStatus::Complete
    }

    fn require_complete(&self, fb: FramebufferId) -> Result<(), DeviceError> {
        match self.status_of(fb) {
            FramebufferStatus::Complete => Ok(()),
            status => Err(DeviceError::InvalidOperation(format!("{fb:?} is incomplete: {status:?}"))),
        }
    }
}

fn to_u8(c: f32) -> u8 {
    (c.clamp(0.0, 1.0) * 255.0).round() as u8
}

fn rows(rect: &BlitRect) -> impl Iterator<Item = i32> {
    let flipped = rect.is_flipped_y();
    let start = rect.y0;
    (0..rect.height() as i32).map(move |i| if flipped { start - 1 - i } else { start + i })
}

impl GraphicsDevice for SoftDevice {
    fn name(&self) -> &str {
        &self.options.name
    }

    fn adapter_info(&self) -> AdapterInfo {
        self.options.adapter.clone()
    }

    fn origin(&self) -> Origin {
        self.options.origin
    }

    fn status(&self) -> DeviceStatus {
        if self.faults.is_device_lost() {
            DeviceStatus::Lost
        } else {
            DeviceStatus::Ok
        }
    }

    fn context(&self) -> ContextToken {
        self.context
    }

    fn current_context(&self) -> Option<ContextToken> {
        CURRENT_CONTEXT.with(|c| c.get()).map(ContextToken)
    }

    fn make_current(&mut self) -> Result<(), DeviceError> {
        if !self.alive {
            return Err(DeviceError::InvalidOperation("context destroyed".into()));
        }
        if self.faults.is_device_lost() {
            return Err(DeviceError::Lost);
        }
        CURRENT_CONTEXT.with(|c| c.set(Some(self.context.0)));
        Ok(())
    }

    fn restore_context(&mut self, previous: Option<ContextToken>) -> Result<(), DeviceError> {
        CURRENT_CONTEXT.with(|c| c.set(previous.map(|t| t.0)));
        Ok(())
    }

    fn destroy_context(&mut self) {
        if !self.alive {
            return;
        }
        self.timeline.wait_for(self.timeline.submitted());
        if let Some(queue) = self.queue.take() {
            queue.shutdown();
        }
        self.framebuffers.clear();
        self.textures.clear();
        self.renderbuffers.clear();
        self.alive = false;
        CURRENT_CONTEXT.with(|c| {
            if c.get() == Some(self.context.0) {
                c.set(None);
            }
        });
    }

    fn gen_framebuffer(&mut self) -> Result<FramebufferId, DeviceError> {
        self.check()?;
        let name = self.gen_name();
        self.framebuffers.insert(name, SoftFramebuffer::default());
        Ok(FramebufferId(name))
    }

    fn delete_framebuffer(&mut self, fb: FramebufferId) {
        self.framebuffers.remove(&fb.0);
        if self.bound == fb {
            self.bound = FramebufferId::DEFAULT;
        }
    }

    fn gen_texture(&mut self) -> Result<TextureId, DeviceError> {
        self.check()?;
        let name = self.gen_name();
        self.textures.insert(name, None);
        Ok(TextureId(name))
    }

    fn texture_storage(&mut self, tex: TextureId, size: SurfaceSize, order: ChannelOrder) -> Result<(), DeviceError> {
        self.check()?;
        self.check_size(size)?;
        let slot = self
            .textures
            .get_mut(&tex.0)
            .ok_or_else(|| DeviceError::UnknownObject(format!("{tex:?}")))?;
        *slot = Some(SoftImage::shared(size, order));
        self.faults.storage_allocations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn delete_texture(&mut self, tex: TextureId) {
        self.textures.remove(&tex.0);
    }

    fn gen_renderbuffer(&mut self) -> Result<RenderbufferId, DeviceError> {
        self.check()?;
        let name = self.gen_name();
        self.renderbuffers.insert(name, SoftRenderbuffer::Empty);
        Ok(RenderbufferId(name))
    }

    fn renderbuffer_storage(
        &mut self,
        rb: RenderbufferId,
        size: SurfaceSize,
        format: DepthStencilFormat,
    ) -> Result<(), DeviceError> {
        self.check()?;
        if self.options.rejected_depth_formats.contains(&format) {
            return Err(DeviceError::Unsupported(format!("{format:?}")));
        }
        self.check_size(size)?;
        let slot = self
            .renderbuffers
            .get_mut(&rb.0)
            .ok_or_else(|| DeviceError::UnknownObject(format!("{rb:?}")))?;
        *slot = SoftRenderbuffer::DepthStencil { size, format };
        Ok(())
    }

    fn delete_renderbuffer(&mut self, rb: RenderbufferId) {
        self.renderbuffers.remove(&rb.0);
    }

    fn attach_color(&mut self, fb: FramebufferId, target: ColorTarget) -> Result<(), DeviceError> {
        self.check()?;
        let known = match target {
            ColorTarget::Texture(tex) => self.textures.contains_key(&tex.0),
            ColorTarget::Renderbuffer(rb) => self.renderbuffers.contains_key(&rb.0),
        };
        if !known {
            return Err(DeviceError::UnknownObject(format!("{target:?}")));
        }
        let framebuffer = self
            .framebuffers
            .get_mut(&fb.0)
            .ok_or_else(|| DeviceError::UnknownObject(format!("{fb:?}")))?;
        framebuffer.color = Some(target);
        Ok(())
    }

    fn attach_depth_stencil(&mut self, fb: FramebufferId, rb: Option<RenderbufferId>) -> Result<(), DeviceError> {
        self.check()?;
        if let Some(rb) = rb {
            if !self.renderbuffers.contains_key(&rb.0) {
                return Err(DeviceError::UnknownObject(format!("{rb:?}")));
            }
        }
        let framebuffer = self
            .framebuffers
            .get_mut(&fb.0)
            .ok_or_else(|| DeviceError::UnknownObject(format!("{fb:?}")))?;
        framebuffer.depth_stencil = rb;
        Ok(())
    }

    fn set_draw_buffers(&mut self, fb: FramebufferId) -> Result<(), DeviceError> {
        self.check()?;
        let framebuffer = self
            .framebuffers
            .get_mut(&fb.0)
            .ok_or_else(|| DeviceError::UnknownObject(format!("{fb:?}")))?;
        framebuffer.draw_buffers = true;
        Ok(())
    }

    fn check_framebuffer(&mut self, fb: FramebufferId) -> FramebufferStatus {
        if self.check().is_err() || self.faults.take_incomplete() {
            return FramebufferStatus::Unsupported;
        }
        self.status_of(fb)
    }

    fn bind_framebuffer(&mut self, fb: FramebufferId) -> Result<(), DeviceError> {
        self.check()?;
        if fb != FramebufferId::DEFAULT && !self.framebuffers.contains_key(&fb.0) {
            return Err(DeviceError::UnknownObject(format!("{fb:?}")));
        }
        self.bound = fb;
        Ok(())
    }

    fn bound_framebuffer(&self) -> FramebufferId {
        self.bound
    }

    fn apply_state(&mut self, state: &RenderState) -> Result<(), DeviceError> {
        self.check()?;
        self.state = *state;
        Ok(())
    }

    fn set_viewport(&mut self, viewport: Viewport) -> Result<(), DeviceError> {
        self.check()?;
        self.state.viewport = viewport;
        Ok(())
    }

    fn viewport(&self) -> Viewport {
        self.state.viewport
    }

    fn set_scissor(&mut self, scissor: Viewport) -> Result<(), DeviceError> {
        self.check()?;
        self.state.scissor = scissor;
        Ok(())
    }

    fn scissor(&self) -> Viewport {
        self.state.scissor
    }

    fn clear(&mut self, color: [f32; 4], mask: ClearMask) -> Result<(), DeviceError> {
        self.check()?;
        if self.bound == FramebufferId::DEFAULT || !mask.contains(ClearMask::COLOR) {
            return Ok(());
        }
        self.require_complete(self.bound)?;

        let image = self.color_image(self.bound)?;
        let mut image = image.lock_or_recover();
        if image.registered && !image.locked {
            return Err(DeviceError::InvalidOperation("write to unlocked interop object".into()));
        }

        let region = if self.state.scissor_test {
            self.state.scissor.clamp_to(image.size)
        } else {
            Viewport::full(image.size)
        };
        let rgba = [to_u8(color[0]), to_u8(color[1]), to_u8(color[2]), to_u8(color[3])];
        let px = ChannelOrder::Rgba.convert(image.order, rgba);

        for y in region.y as u32..region.y as u32 + region.height {
            for x in region.x as u32..region.x as u32 + region.width {
                let o = image.offset(x, y);
                image.data[o..o + 4].copy_from_slice(&px);
            }
        }
        Ok(())
    }

    fn blit(&mut self, src_fb: FramebufferId, src: BlitRect, dst_fb: FramebufferId, dst: BlitRect) -> Result<(), DeviceError> {
        self.check()?;
        if self.faults.fail_blits.load(Ordering::SeqCst) {
            return Err(DeviceError::InvalidOperation("blit rejected by driver".into()));
        }
        if src.width() != dst.width() || src.height() != dst.height() {
            return Err(DeviceError::Unsupported("scaling blit".into()));
        }
        self.require_complete(src_fb)?;
        self.require_complete(dst_fb)?;

        let src_image = self.color_image(src_fb)?;
        let dst_image = self.color_image(dst_fb)?;
        if Arc::ptr_eq(&src_image, &dst_image) {
            return Err(DeviceError::InvalidOperation("blit source and destination overlap".into()));
        }

        let src_image = src_image.lock_or_recover();
        let mut dst_image = dst_image.lock_or_recover();
        if dst_image.registered && !dst_image.locked {
            return Err(DeviceError::InvalidOperation("write to unlocked interop object".into()));
        }

        let (src_order, dst_order) = (src_image.order, dst_image.order);
        let width = src.width();
        for (sy, dy) in rows(&src).zip(rows(&dst)) {
            if sy < 0 || dy < 0 || sy as u32 >= src_image.size.height || dy as u32 >= dst_image.size.height {
                continue;
            }
            for i in 0..width as i32 {
                let (sx, dx) = (src.x0.min(src.x1) + i, dst.x0.min(dst.x1) + i);
                if sx < 0 || dx < 0 || sx as u32 >= src_image.size.width || dx as u32 >= dst_image.size.width {
                    continue;
                }
                let px = src_order.convert(dst_order, src_image.pixel(sx as u32, sy as u32));
                let o = dst_image.offset(dx as u32, dy as u32);
                dst_image.data[o..o + 4].copy_from_slice(&px);
            }
        }
        self.faults.blits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn read_pixels(&mut self, fb: FramebufferId, rect: Viewport) -> Result<Vec<u8>, DeviceError> {
        self.check()?;
        self.require_complete(fb)?;
        let image = self.color_image(fb)?;
        let image = image.lock_or_recover();
        if rect.clamp_to(image.size) != rect {
            return Err(DeviceError::InvalidOperation(format!("{rect:?} outside {}", image.size)));
        }

        let mut out = Vec::with_capacity(rect.area() as usize * 4);
        for y in rect.y as u32..rect.y as u32 + rect.height {
            let start = image.offset(rect.x as u32, y);
            let mut row = image.data[start..start + rect.width as usize * 4].to_vec();
            image.order.convert_row(ChannelOrder::Rgba, &mut row);
            out.extend_from_slice(&row);
        }
        Ok(out)
    }

    fn flush(&mut self, on_complete: CompletionCallback) -> Result<FenceId, DeviceError> {
        self.check()?;
        let fence = self.timeline.submit();
        match self.options.completion {
            GpuCompletion::Immediate => {
                self.timeline.signal(fence);
                on_complete(fence);
            }
            GpuCompletion::Deferred(latency) => {
                if self.queue.is_none() {
                    self.queue = Some(CompletionQueue::spawn(latency, self.timeline.clone())?);
                }
                let sent = self.queue.as_ref().map(|q| q.tx.send((fence, on_complete)));
                if !matches!(sent, Some(Ok(()))) {
                    return Err(DeviceError::InvalidOperation("completion queue closed".into()));
                }
            }
        }
        Ok(fence)
    }

    fn finish(&mut self) -> Result<(), DeviceError> {
        self.check()?;
        self.timeline.wait_for(self.timeline.submitted());
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl Drop for SoftDevice {
    fn drop(&mut self) {
        self.destroy_context();
    }
}

/// Handles a test or headless host keeps to observe and steer a soft platform.
#[derive(Clone)]
pub struct SoftHandles {
    pub faults: Arc<SoftFaults>,
    pub timeline: Arc<SoftTimeline>,
    pub host: SoftHostView,
}

/// Builds a [`GraphicsPlatform`] backed by the soft backend.
#[derive(Debug, Clone, Default)]
pub struct SoftPlatform {
    device: SoftDeviceOptions,
    interop: Option<SoftInteropOptions>,
    native: bool,
}

impl SoftPlatform {
    /// Device only. Negotiation ends on the CPU-mediated tier.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(mut self, options: SoftDeviceOptions) -> Self {
        self.device = options;
        self
    }

    pub fn with_interop(mut self, options: SoftInteropOptions) -> Self {
        self.interop = Some(options);
        self
    }

    pub fn with_native(mut self) -> Self {
        self.native = true;
        self
    }

    pub fn build(self) -> (GraphicsPlatform, SoftHandles) {
        let faults = Arc::new(SoftFaults::default());
        let timeline = Arc::new(SoftTimeline::default());
        let store = Arc::new(SharedStore::default());

        let mut device_options = self.device;
        if let Some(interop) = &self.interop {
            if interop.extension_present {
                device_options.extensions.push(INTEROP_EXTENSION.to_string());
            }
        }
        if self.native {
            device_options.extensions.push(NATIVE_EXTENSION.to_string());
        }

        let device_faults = faults.clone();
        let device_timeline = timeline.clone();
        let mut platform = GraphicsPlatform::new(Box::new(move || {
            let device = SoftDevice::new(device_options, device_faults, device_timeline)?;
            Ok(Box::new(device) as Box<dyn GraphicsDevice>)
        }));

        if let Some(options) = self.interop {
            platform = platform.with_interop(Box::new(SoftInterop::new(options, store.clone(), faults.clone())));
        }
        if self.native {
            platform = platform.with_native(Box::new(SoftNative::new(store.clone())));
        }

        let handles = SoftHandles {
            faults,
            timeline,
            host: SoftHostView::new(store),
        };
        (platform, handles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> SoftDevice {
        let mut d = SoftDevice::new(SoftDeviceOptions::default(), Default::default(), Default::default()).unwrap();
        d.make_current().unwrap();
        d
    }

    fn framebuffer(d: &mut SoftDevice, size: SurfaceSize, order: ChannelOrder) -> FramebufferId {
        let fb = d.gen_framebuffer().unwrap();
        let tex = d.gen_texture().unwrap();
        d.texture_storage(tex, size, order).unwrap();
        d.attach_color(fb, ColorTarget::Texture(tex)).unwrap();
        d.set_draw_buffers(fb).unwrap();
        fb
    }

    #[test]
    fn calls_fail_when_context_not_current() {
        let mut d = device();
        d.restore_context(None).unwrap();
        assert_eq!(d.gen_framebuffer(), Err(DeviceError::ContextNotCurrent));
        d.make_current().unwrap();
        assert!(d.gen_framebuffer().is_ok());
    }

    #[test]
    fn completeness_requires_storage_and_draw_buffers() {
        let mut d = device();
        let fb = d.gen_framebuffer().unwrap();
        assert_eq!(d.check_framebuffer(fb), FramebufferStatus::MissingAttachment);

        let tex = d.gen_texture().unwrap();
        d.attach_color(fb, ColorTarget::Texture(tex)).unwrap();
        assert_eq!(d.check_framebuffer(fb), FramebufferStatus::IncompleteAttachment);

        d.texture_storage(tex, SurfaceSize::new(4, 4), ChannelOrder::Rgba).unwrap();
        assert_eq!(d.check_framebuffer(fb), FramebufferStatus::IncompleteDrawBuffer);

        d.set_draw_buffers(fb).unwrap();
        assert_eq!(d.check_framebuffer(fb), FramebufferStatus::Complete);

        let rb = d.gen_renderbuffer().unwrap();
        d.renderbuffer_storage(rb, SurfaceSize::new(8, 8), DepthStencilFormat::Depth16).unwrap();
        d.attach_depth_stencil(fb, Some(rb)).unwrap();
        assert_eq!(d.check_framebuffer(fb), FramebufferStatus::IncompleteDimensions);
    }

    #[test]
    fn rejected_depth_format() {
        let options = SoftDeviceOptions {
            rejected_depth_formats: vec![DepthStencilFormat::Depth24Stencil8],
            ..Default::default()
        };
        let mut d = SoftDevice::new(options, Default::default(), Default::default()).unwrap();
        d.make_current().unwrap();
        let rb = d.gen_renderbuffer().unwrap();
        let size = SurfaceSize::new(4, 4);
        assert!(d.renderbuffer_storage(rb, size, DepthStencilFormat::Depth24Stencil8).is_err());
        assert!(d.renderbuffer_storage(rb, size, DepthStencilFormat::Depth16Stencil8).is_ok());
    }

    #[test]
    fn scissored_clear_and_flipped_blit() {
        let mut d = device();
        let size = SurfaceSize::new(4, 2);
        let src = framebuffer(&mut d, size, ChannelOrder::Rgba);
        let dst = framebuffer(&mut d, size, ChannelOrder::Bgra);

        d.bind_framebuffer(src).unwrap();
        d.apply_state(&RenderState::for_surface(size)).unwrap();
        d.clear([0.0, 0.0, 1.0, 1.0], ClearMask::COLOR).unwrap();
        // Red only on row 1 (the top row in GL space).
        d.set_scissor(Viewport::new(0, 1, 4, 1)).unwrap();
        d.clear([1.0, 0.0, 0.0, 1.0], ClearMask::COLOR).unwrap();

        let full = BlitRect::from_viewport(Viewport::full(size));
        d.blit(src, full, dst, full.flipped()).unwrap();

        let out = d.color_snapshot(dst).unwrap();
        // Row 0 of the flipped BGRA copy is the red row.
        assert_eq!(out.pixel(0, 0), [0, 0, 255, 255]);
        assert_eq!(out.pixel(3, 1), [255, 0, 0, 255]);
        assert_eq!(d.faults().blit_count(), 1);
    }

    #[test]
    fn read_pixels_returns_rgba_rows() {
        let mut d = device();
        let size = SurfaceSize::new(2, 2);
        let fb = framebuffer(&mut d, size, ChannelOrder::Bgra);
        d.bind_framebuffer(fb).unwrap();
        d.apply_state(&RenderState::for_surface(size)).unwrap();
        d.clear([1.0, 0.0, 0.0, 1.0], ClearMask::COLOR).unwrap();

        let px = d.read_pixels(fb, Viewport::new(0, 0, 1, 1)).unwrap();
        assert_eq!(px, vec![255, 0, 0, 255]);
        assert!(d.read_pixels(fb, Viewport::new(1, 1, 2, 2)).is_err());
    }

    #[test]
    fn deferred_completion_signals_before_callback() {
        let options = SoftDeviceOptions {
            completion: GpuCompletion::Deferred(Duration::from_millis(5)),
            ..Default::default()
        };
        let timeline = Arc::new(SoftTimeline::default());
        let mut d = SoftDevice::new(options, Default::default(), timeline.clone()).unwrap();
        d.make_current().unwrap();

        let (tx, rx) = mpsc::channel();
        let tl = timeline.clone();
        let fence = d
            .flush(Box::new(move |f| {
                tx.send(tl.is_signaled(f)).unwrap();
            }))
            .unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(2)).unwrap());
        d.finish().unwrap();
        assert!(timeline.is_signaled(fence));
    }

    #[test]
    fn device_loss_fails_calls() {
        let mut d = device();
        d.faults().lose_device();
        assert_eq!(d.status(), DeviceStatus::Lost);
        assert_eq!(d.gen_texture(), Err(DeviceError::Lost));
    }

    #[test]
    fn destroy_releases_everything() {
        let mut d = device();
        framebuffer(&mut d, SurfaceSize::new(2, 2), ChannelOrder::Rgba);
        assert_eq!(d.framebuffer_count(), 1);
        d.destroy_context();
        assert_eq!(d.framebuffer_count(), 0);
        assert_eq!(d.texture_count(), 0);
        assert_eq!(d.current_context(), None);
        // Idempotent.
        d.destroy_context();
    }
}
