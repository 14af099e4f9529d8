//! Owns the producer device and its offscreen render target.
//!
//! The factory is built on the render thread, which makes the device's context
//! current there for the rest of the surface's life. The render target is a
//! framebuffer with a local color texture and, depending on the
//! [`SurfaceConfig`], a depth/stencil renderbuffer.
//!
//! Resizing reallocates storage behind the same object names: the framebuffer
//! is never deleted, every attachment is re-attached and the draw buffers are
//! declared again before completeness is checked. Some drivers only pick up
//! new storage sizes on re-attachment.

use crate::errors::TransportError;
use crate::render::{
    with_current_context, ClearMask, ColorTarget, DeviceError, FramebufferId, FramebufferStatus, GraphicsDevice,
    RenderState, RenderbufferId, TextureId, Viewport,
};
use crate::surface::{ChannelOrder, RenderSurface, SurfaceConfig, SurfaceDescriptor, SurfaceSize};

/// Object names of a render target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct RenderTarget {
    pub framebuffer: FramebufferId,
    pub color: TextureId,
    pub depth_stencil: Option<RenderbufferId>,
}

/// Why a render target could not be built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum TargetError {
    Device(DeviceError),
    Incomplete(FramebufferStatus),
}

impl std::fmt::Display for TargetError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetError::Device(e) => write!(f, "{e}"),
            TargetError::Incomplete(status) => write!(f, "framebuffer incomplete: {status:?}"),
        }
    }
}

impl From<DeviceError> for TargetError {
    fn from(err: DeviceError) -> Self {
        TargetError::Device(err)
    }
}

/// Gives storage of `size` to the attachments of `target` and attaches them.
fn store_and_attach(
    device: &mut dyn GraphicsDevice,
    target: &RenderTarget,
    size: SurfaceSize,
    config: SurfaceConfig,
) -> Result<(), TargetError> {
    device.texture_storage(target.color, size, ChannelOrder::Rgba)?;
    if let (Some(rb), Some(format)) = (target.depth_stencil, config.depth_stencil) {
        device.renderbuffer_storage(rb, size, format)?;
    }
    device.attach_color(target.framebuffer, ColorTarget::Texture(target.color))?;
    device.attach_depth_stencil(target.framebuffer, target.depth_stencil)?;
    device.set_draw_buffers(target.framebuffer)?;

    match device.check_framebuffer(target.framebuffer) {
        FramebufferStatus::Complete => Ok(()),
        status => Err(TargetError::Incomplete(status)),
    }
}

/// Builds a complete render target, or nothing.
pub(crate) fn allocate_render_target(
    device: &mut dyn GraphicsDevice,
    size: SurfaceSize,
    config: SurfaceConfig,
) -> Result<RenderTarget, TargetError> {
    let framebuffer = device.gen_framebuffer()?;
    let color = match device.gen_texture() {
        Ok(tex) => tex,
        Err(e) => {
            device.delete_framebuffer(framebuffer);
            return Err(e.into());
        }
    };
    let depth_stencil = if config.depth_stencil.is_some() {
        match device.gen_renderbuffer() {
            Ok(rb) => Some(rb),
            Err(e) => {
                device.delete_texture(color);
                device.delete_framebuffer(framebuffer);
                return Err(e.into());
            }
        }
    } else {
        None
    };

    let target = RenderTarget {
        framebuffer,
        color,
        depth_stencil,
    };
    if let Err(e) = store_and_attach(device, &target, size, config) {
        delete_render_target(device, &target);
        return Err(e);
    }
    Ok(target)
}

pub(crate) fn delete_render_target(device: &mut dyn GraphicsDevice, target: &RenderTarget) {
    if device.bound_framebuffer() == target.framebuffer {
        let _ = device.bind_framebuffer(FramebufferId::DEFAULT);
    }
    device.delete_framebuffer(target.framebuffer);
    device.delete_texture(target.color);
    if let Some(rb) = target.depth_stencil {
        device.delete_renderbuffer(rb);
    }
}

/// Builds and immediately deletes a render target. Used by negotiation.
pub(crate) fn probe_render_target(
    device: &mut dyn GraphicsDevice,
    size: SurfaceSize,
    config: SurfaceConfig,
) -> Result<(), TargetError> {
    let target = allocate_render_target(device, size, config)?;
    delete_render_target(device, &target);
    Ok(())
}

/// Initial state of a freshly built or resized surface.
fn initial_state(size: SurfaceSize, config: SurfaceConfig) -> RenderState {
    let mut state = RenderState::for_surface(size);
    state.depth_test = config.depth_stencil.is_some();
    state
}

pub struct GraphicsSurfaceFactory {
    device: Box<dyn GraphicsDevice>,
    surface: Option<RenderSurface>,
    broken: bool,
    torn_down: bool,
}

impl GraphicsSurfaceFactory {
    /// Takes ownership of `device` and makes its context current on the calling thread.
    pub fn new(mut device: Box<dyn GraphicsDevice>) -> Result<Self, TransportError> {
        device
            .make_current()
            .map_err(|e| TransportError::ContextCreationFailure(format!("{}: {e}", device.name())))?;
        log::info!(
            "{}: context ready on {} (origin {:?})",
            device.name(),
            device.adapter_info(),
            device.origin()
        );
        Ok(Self {
            device,
            surface: None,
            broken: false,
            torn_down: false,
        })
    }

    pub fn device(&self) -> &dyn GraphicsDevice {
        self.device.as_ref()
    }

    pub fn device_mut(&mut self) -> &mut dyn GraphicsDevice {
        self.device.as_mut()
    }

    pub fn surface(&self) -> Option<&RenderSurface> {
        self.surface.as_ref()
    }

    /// The device and the surface, borrowed together.
    pub fn parts_mut(&mut self) -> Option<(&mut dyn GraphicsDevice, &mut RenderSurface)> {
        match self.surface.as_mut() {
            Some(surface) => Some((self.device.as_mut(), surface)),
            None => None,
        }
    }

    /// True when a failed resize could not be rolled back. The surface is unusable.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Builds the render target for `descriptor` with `config`, replacing any
    /// existing one.
    pub fn create_surface(
        &mut self,
        descriptor: SurfaceDescriptor,
        config: SurfaceConfig,
    ) -> Result<&RenderSurface, TransportError> {
        if self.torn_down {
            return Err(TransportError::SurfaceDestroyed);
        }
        self.discard_surface();

        let size = descriptor.size();
        let target = with_current_context(self.device.as_mut(), |device| {
            let target = allocate_render_target(device, size, config).map_err(|e| match e {
                TargetError::Device(e) => TransportError::from(e),
                TargetError::Incomplete(status) => TransportError::Device(DeviceError::InvalidOperation(format!(
                    "render target {config} incomplete: {status:?}"
                ))),
            })?;

            let prepared = device
                .bind_framebuffer(target.framebuffer)
                .and_then(|_| device.apply_state(&initial_state(size, config)))
                .and_then(|_| device.clear([0.0; 4], ClearMask::all()));
            if let Err(e) = prepared {
                delete_render_target(device, &target);
                return Err(TransportError::from(e));
            }
            Ok(target)
        })?;

        log::debug!(
            "{}: render target {:?} {} with {}",
            self.device.name(),
            target.framebuffer,
            size,
            config
        );
        let surface = self.surface.insert(RenderSurface {
            descriptor,
            framebuffer: target.framebuffer,
            color: target.color,
            depth_stencil: target.depth_stencil,
            config,
            rendered: Viewport::default(),
            reallocations: 0,
        });
        Ok(surface)
    }

    /// Rebuilds the render target with a different configuration at the same size.
    pub fn reconfigure(&mut self, config: SurfaceConfig) -> Result<&RenderSurface, TransportError> {
        let Some(current) = self.surface.as_ref() else {
            return Err(TransportError::SurfaceDestroyed);
        };
        if current.config == config {
            return self.surface.as_ref().ok_or(TransportError::SurfaceDestroyed);
        }
        let descriptor = current.descriptor;
        let reallocations = current.reallocations;

        self.create_surface(descriptor, config)?;
        let surface = self.surface.as_mut().ok_or(TransportError::SurfaceDestroyed)?;
        surface.reallocations = reallocations;
        Ok(surface)
    }

    /// Applies `descriptor` to the surface. Returns whether storage was reallocated.
    ///
    /// A size change reallocates in place. If the new storage does not form a
    /// complete framebuffer the old size is restored and
    /// [`TransportError::ResizeIncomplete`] is returned.
    pub fn resize(&mut self, descriptor: SurfaceDescriptor) -> Result<bool, TransportError> {
        let Some(surface) = self.surface.as_mut() else {
            return Err(TransportError::SurfaceDestroyed);
        };
        let old_size = surface.size();
        let new_size = descriptor.size();
        if old_size == new_size {
            surface.descriptor = descriptor;
            return Ok(false);
        }

        let target = RenderTarget {
            framebuffer: surface.framebuffer,
            color: surface.color,
            depth_stencil: surface.depth_stencil,
        };
        let config = surface.config;
        let mut broken = false;

        let result = with_current_context(self.device.as_mut(), |device| {
            match store_and_attach(device, &target, new_size, config) {
                Ok(()) => {
                    device.bind_framebuffer(target.framebuffer)?;
                    device.apply_state(&initial_state(new_size, config))?;
                    Ok(())
                }
                Err(e) => {
                    log::warn!("{}: resize to {} failed: {}", device.name(), new_size, e);
                    if let Err(rollback) = store_and_attach(device, &target, old_size, config) {
                        log::error!("{}: rollback to {} failed: {}", device.name(), old_size, rollback);
                        broken = true;
                    } else {
                        device.apply_state(&initial_state(old_size, config))?;
                    }
                    let status = match e {
                        TargetError::Incomplete(status) => status,
                        TargetError::Device(DeviceError::Lost) => return Err(TransportError::DeviceLost),
                        TargetError::Device(_) => FramebufferStatus::IncompleteAttachment,
                    };
                    Err(TransportError::ResizeIncomplete {
                        width: new_size.width,
                        height: new_size.height,
                        status,
                    })
                }
            }
        });
        self.broken |= broken;
        result?;

        surface.descriptor = descriptor;
        surface.rendered = Viewport::default();
        surface.reallocations += 1;
        Ok(true)
    }

    /// Deletes the render target, keeping the device.
    pub fn discard_surface(&mut self) {
        let Some(surface) = self.surface.take() else {
            return;
        };
        let target = RenderTarget {
            framebuffer: surface.framebuffer,
            color: surface.color,
            depth_stencil: surface.depth_stencil,
        };
        let deleted: Result<(), DeviceError> = with_current_context(self.device.as_mut(), |device| {
            delete_render_target(device, &target);
            Ok(())
        });
        if let Err(e) = deleted {
            log::debug!("{}: render target dropped without a context: {}", self.device.name(), e);
        }
    }

    /// Waits for outstanding GPU work, deletes the render target and destroys
    /// the context. Idempotent.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        let finished: Result<(), DeviceError> = with_current_context(self.device.as_mut(), |device| device.finish());
        if let Err(e) = finished {
            log::debug!("{}: finish before teardown: {}", self.device.name(), e);
        }
        self.discard_surface();
        self.device.destroy_context();
        log::debug!("{}: context destroyed", self.device.name());
    }
}

impl Drop for GraphicsSurfaceFactory {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::backends::soft::{SoftDevice, SoftDeviceOptions, SoftFaults};
    use crate::surface::DepthStencilFormat;
    use std::sync::Arc;

    fn factory_with(options: SoftDeviceOptions) -> (GraphicsSurfaceFactory, Arc<SoftFaults>) {
        let faults = Arc::new(SoftFaults::default());
        let device = SoftDevice::new(options, faults.clone(), Default::default()).unwrap();
        (GraphicsSurfaceFactory::new(Box::new(device)).unwrap(), faults)
    }

    fn factory() -> (GraphicsSurfaceFactory, Arc<SoftFaults>) {
        factory_with(SoftDeviceOptions::default())
    }

    fn soft(factory: &GraphicsSurfaceFactory) -> &SoftDevice {
        factory.device().as_any().downcast_ref::<SoftDevice>().unwrap()
    }

    #[test]
    fn create_sets_initial_state() {
        let (mut f, _) = factory();
        let d = SurfaceDescriptor::new(800, 600, 1.0).unwrap();
        let surface = f.create_surface(d, SurfaceConfig::D24S8).unwrap().clone();
        assert!(surface.depth_stencil().is_some());

        let state = soft(&f).render_state();
        assert_eq!(state.viewport, Viewport::new(0, 0, 800, 600));
        assert_eq!(state.scissor, Viewport::new(0, 0, 800, 600));
        assert!(state.scissor_test);
        assert!(state.depth_test);
        assert_eq!(f.device().bound_framebuffer(), surface.framebuffer());
    }

    #[test]
    fn no_depth_configs_skip_renderbuffer() {
        let (mut f, _) = factory();
        let d = SurfaceDescriptor::new(8, 8, 1.0).unwrap();
        let surface = f.create_surface(d, SurfaceConfig::RENDERABLE_ONLY).unwrap();
        assert_eq!(surface.depth_stencil(), None);
        assert!(!soft(&f).render_state().depth_test);
    }

    #[test]
    fn rejected_format_fails_without_leaks() {
        let (mut f, _) = factory_with(SoftDeviceOptions {
            rejected_depth_formats: vec![DepthStencilFormat::Depth24Stencil8],
            ..Default::default()
        });
        let d = SurfaceDescriptor::new(8, 8, 1.0).unwrap();
        assert!(f.create_surface(d, SurfaceConfig::D24S8).is_err());
        assert_eq!(soft(&f).framebuffer_count(), 0);
        assert_eq!(soft(&f).texture_count(), 0);
        assert_eq!(soft(&f).renderbuffer_count(), 0);
        assert!(f.create_surface(d, SurfaceConfig::D16S8).is_ok());
    }

    #[test]
    fn resize_keeps_names_and_resets_scissor() {
        let (mut f, faults) = factory();
        let d = SurfaceDescriptor::new(800, 600, 1.0).unwrap();
        let before = f.create_surface(d, SurfaceConfig::D24S8).unwrap().clone();
        let allocations = faults.storage_allocations();

        assert!(f.resize(d.resized(1200, 900, 1.0).unwrap()).unwrap());
        let after = f.surface().unwrap().clone();
        assert_eq!(after.framebuffer(), before.framebuffer());
        assert_eq!(after.color(), before.color());
        assert_eq!(after.depth_stencil(), before.depth_stencil());
        assert_eq!(after.size(), SurfaceSize::new(1200, 900));
        assert_eq!(after.reallocations(), 1);
        assert_eq!(faults.storage_allocations(), allocations + 1);
        assert_eq!(soft(&f).render_state().scissor, Viewport::new(0, 0, 1200, 900));
    }

    #[test]
    fn same_size_resize_only_updates_scale() {
        let (mut f, faults) = factory();
        let d = SurfaceDescriptor::new(64, 64, 1.0).unwrap();
        f.create_surface(d, SurfaceConfig::NO_DEPTH).unwrap();
        let allocations = faults.storage_allocations();

        assert!(!f.resize(d.resized(64, 64, 2.0).unwrap()).unwrap());
        assert_eq!(f.surface().unwrap().descriptor().scale(), 2.0);
        assert_eq!(f.surface().unwrap().reallocations(), 0);
        assert_eq!(faults.storage_allocations(), allocations);
    }

    #[test]
    fn incomplete_resize_rolls_back() {
        let (mut f, faults) = factory();
        let d = SurfaceDescriptor::new(64, 48, 1.0).unwrap();
        f.create_surface(d, SurfaceConfig::D24S8).unwrap();

        faults.fail_next_completeness_checks(1);
        let err = f.resize(d.resized(128, 96, 1.0).unwrap()).unwrap_err();
        assert!(matches!(
            err,
            TransportError::ResizeIncomplete {
                width: 128,
                height: 96,
                status: FramebufferStatus::Unsupported
            }
        ));
        assert!(!f.is_broken());
        let surface = f.surface().unwrap();
        assert_eq!(surface.size(), SurfaceSize::new(64, 48));
        let fb = surface.framebuffer();
        assert_eq!(f.device_mut().check_framebuffer(fb), FramebufferStatus::Complete);
    }

    #[test]
    fn failed_rollback_marks_broken() {
        let (mut f, faults) = factory();
        let d = SurfaceDescriptor::new(64, 48, 1.0).unwrap();
        f.create_surface(d, SurfaceConfig::NO_DEPTH).unwrap();

        faults.fail_next_completeness_checks(2);
        assert!(f.resize(d.resized(128, 96, 1.0).unwrap()).is_err());
        assert!(f.is_broken());
    }

    #[test]
    fn reconfigure_keeps_reallocation_count() {
        let (mut f, _) = factory();
        let d = SurfaceDescriptor::new(32, 32, 1.0).unwrap();
        f.create_surface(d, SurfaceConfig::D24S8).unwrap();
        f.resize(d.resized(64, 64, 1.0).unwrap()).unwrap();

        let surface = f.reconfigure(SurfaceConfig::NO_DEPTH).unwrap();
        assert_eq!(surface.config(), SurfaceConfig::NO_DEPTH);
        assert_eq!(surface.size(), SurfaceSize::new(64, 64));
        assert_eq!(surface.reallocations(), 1);
        assert_eq!(soft(&f).renderbuffer_count(), 0);
    }

    #[test]
    fn teardown_is_idempotent() {
        let (mut f, _) = factory();
        let d = SurfaceDescriptor::new(8, 8, 1.0).unwrap();
        f.create_surface(d, SurfaceConfig::D16).unwrap();
        f.teardown();
        assert!(f.surface().is_none());
        assert_eq!(f.device().current_context(), None);
        f.teardown();
        assert!(matches!(f.create_surface(d, SurfaceConfig::D16), Err(TransportError::SurfaceDestroyed)));
    }
}
