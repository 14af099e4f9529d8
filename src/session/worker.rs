use crate::errors::TransportError;
use crate::events::TransportEvent;
use crate::render::{with_current_context, DeviceError, DeviceStatus, GraphicsDevice, GraphicsPlatform};
use crate::renderer::{DrawTarget, FrameRenderer};
use crate::session::SurfaceShared;
use crate::surface::{SurfaceConfig, SurfaceDescriptor, SurfaceSize};
use crate::sync::LockExt;
use crate::transport::{
    CapabilityNegotiator, FrameInfo, GraphicsSurfaceFactory, PendingResize, PresentOutcome, Providers, Tier,
    TransportCapability, TransportStrategy,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::oneshot;

pub(crate) struct SurfaceSpawnArgs {
    pub shared: Arc<SurfaceShared>,
    pub platform: GraphicsPlatform,
    pub renderer: Box<dyn FrameRenderer>,
    pub descriptor: SurfaceDescriptor,
    pub ready: oneshot::Sender<Result<(), TransportError>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum SurfaceState {
    Running,
    Lost(String),
}

/// Starts the render thread. It replies on `args.ready` once the surface has
/// a working tier, or with the error that prevented it.
pub(crate) fn spawn(args: SurfaceSpawnArgs) -> std::io::Result<JoinHandle<()>> {
    let short: String = args.shared.id.to_string().chars().take(8).collect();
    std::thread::Builder::new()
        .name(format!("frame-bridge-{short}"))
        .spawn(move || {
            let id = args.shared.id;
            let (worker, ready) = SurfaceWorker::start(args);
            let mut worker = match worker {
                Ok(worker) => worker,
                Err(e) => {
                    log::error!("Surface[{}]: start-up failed: {}", id, e);
                    let _ = ready.send(Err(e));
                    return;
                }
            };
            if ready.send(Ok(())).is_err() {
                log::debug!("Surface[{}]: creator went away before start-up finished", id);
                worker.teardown();
                return;
            }
            worker.run();
        })
}

/// A tier that is attached to the current render target.
struct Installed {
    strategy: Box<dyn TransportStrategy>,
    capability: TransportCapability,
    attempts: usize,
}

pub(crate) struct SurfaceWorker {
    shared: Arc<SurfaceShared>,
    factory: GraphicsSurfaceFactory,
    providers: Providers,
    strategy: Box<dyn TransportStrategy>,
    renderer: Box<dyn FrameRenderer>,
    state: SurfaceState,
    frame_id: u64,
    keep_alive: u32,
    /// Ceiling and reason of a downgrade to apply at the start of the next cycle.
    pending_downgrade: Option<(Tier, String)>,
    /// Resize to retry after that downgrade.
    retry_resize: Option<PendingResize>,
}

impl SurfaceWorker {
    fn start(args: SurfaceSpawnArgs) -> (Result<Self, TransportError>, oneshot::Sender<Result<(), TransportError>>) {
        let SurfaceSpawnArgs {
            shared,
            platform,
            renderer,
            descriptor,
            ready,
        } = args;
        (Self::new(shared, platform, renderer, descriptor), ready)
    }

    fn new(
        shared: Arc<SurfaceShared>,
        platform: GraphicsPlatform,
        renderer: Box<dyn FrameRenderer>,
        descriptor: SurfaceDescriptor,
    ) -> Result<Self, TransportError> {
        let GraphicsPlatform { device, interop, native } = platform;
        let device = device().map_err(|e| TransportError::ContextCreationFailure(format!("device creation: {e}")))?;
        let mut factory = GraphicsSurfaceFactory::new(device)?;
        let mut providers = Providers { interop, native };

        let installed = establish(
            &shared,
            &mut factory,
            &mut providers,
            descriptor,
            Tier::NativeSharedMemory,
            SurfaceConfig::D24S8,
        )?;

        let worker = Self {
            keep_alive: shared.config.keep_alive_frames,
            shared,
            factory,
            providers,
            strategy: installed.strategy,
            renderer,
            state: SurfaceState::Running,
            frame_id: 0,
            pending_downgrade: None,
            retry_resize: None,
        };
        worker.publish_tier(installed.capability);
        worker.shared.update_diagnostics(|d| {
            d.renderer = worker.factory.device().name().to_string();
            d.surface = descriptor.size();
            d.negotiation_attempts = installed.attempts;
        });

        worker.shared.emit(TransportEvent::SurfaceCreated {
            surface_id: worker.shared.id,
            width: descriptor.width(),
            height: descriptor.height(),
            scale: descriptor.scale(),
        });
        worker.shared.emit(TransportEvent::TierNegotiated {
            surface_id: worker.shared.id,
            capability: installed.capability,
            attempts: installed.attempts,
        });
        log::info!(
            "Surface[{}]: created {} on {}",
            worker.shared.id,
            descriptor.size(),
            installed.capability
        );
        Ok(worker)
    }

    pub fn run(mut self) {
        let interval = self.shared.config.frame_interval();
        while !self.shared.shutdown.load(Ordering::Acquire) {
            if self.state == SurfaceState::Running && self.is_active() {
                self.cycle();
            }
            // Host calls unpark; an unpark that raced ahead makes this return at once.
            std::thread::park_timeout(interval);
        }
        self.teardown();
    }

    fn is_active(&self) -> bool {
        self.shared.dirty.load(Ordering::Acquire)
            || self.shared.resize.has_pending()
            || self.retry_resize.is_some()
            || self.pending_downgrade.is_some()
            || self.keep_alive > 0
            || self.renderer.has_pending_work()
    }

    /// One render-thread cycle: downgrade, resize, draw, present.
    fn cycle(&mut self) {
        if let Some((ceiling, reason)) = self.pending_downgrade.take() {
            if let Err(e) = self.downgrade(ceiling, reason) {
                self.lose(e.to_string());
                return;
            }
        }

        // A newer request supersedes a retry.
        let pending = match self.shared.resize.apply_if_pending() {
            Some(resize) => {
                self.retry_resize = None;
                Some(resize)
            }
            None => self.retry_resize.take(),
        };
        if let Some(resize) = pending {
            self.apply_resize(resize);
            if self.state != SurfaceState::Running || self.pending_downgrade.is_some() {
                return;
            }
        }

        if self.factory.device().status() == DeviceStatus::Lost {
            self.lose("device reported lost".to_string());
            return;
        }

        self.shared.dirty.store(false, Ordering::Release);
        match self.draw() {
            Ok(()) => {}
            Err(e) if e.is_fatal() => {
                self.lose(e.to_string());
                return;
            }
            Err(e) => {
                log::error!("Surface[{}]: draw failed: {}", self.shared.id, e);
                self.shared.update_diagnostics(|d| d.frames_skipped += 1);
                return;
            }
        }

        self.present();
    }

    fn draw(&mut self) -> Result<(), TransportError> {
        let Some((device, surface)) = self.factory.parts_mut() else {
            return Err(TransportError::SurfaceDestroyed);
        };
        let renderer = &mut self.renderer;
        let rendered = with_current_context(device, |device| {
            let mut target = DrawTarget::bind(device, surface)?;
            renderer.draw(&mut target)?;
            Ok::<_, TransportError>(device.viewport())
        })?;
        surface.set_rendered(rendered);
        Ok(())
    }

    fn present(&mut self) {
        let Some((device, surface)) = self.factory.parts_mut() else {
            return;
        };
        let surface = &*surface;
        let surface_size = surface.size();
        let frame_id = self.frame_id + 1;
        let capability = self.strategy.capability();
        let strategy = &mut self.strategy;
        let presented = with_current_context(device, |device| strategy.present(device, surface, frame_id));

        match presented {
            Ok(PresentOutcome::Presented { rendered, frame }) => {
                self.frame_id = frame_id;
                let info = FrameInfo {
                    surface_id: self.shared.id,
                    frame_id,
                    capability,
                    width: surface_size.width,
                    height: surface_size.height,
                    fence: Default::default(),
                };
                let slot = self.shared.slot.clone();
                let epoch = slot.epoch();
                let completion = self.shared.notifier.completion(info, move || {
                    slot.publish(frame, epoch);
                });
                let flushed: Result<_, DeviceError> = with_current_context(device, |device| device.flush(completion));
                match flushed {
                    Ok(_) => {}
                    Err(DeviceError::Lost) => {
                        self.lose("device lost during flush".to_string());
                        return;
                    }
                    Err(e) => log::warn!("Surface[{}]: flush of frame {} failed: {}", self.shared.id, frame_id, e),
                }

                self.shared.update_diagnostics(|d| {
                    d.frames_presented += 1;
                    d.surface = surface_size;
                    d.rendered = SurfaceSize::new(rendered.width, rendered.height);
                });
                if self.keep_alive > 0 {
                    self.renderer.request_active_frame();
                    self.keep_alive -= 1;
                }
            }
            Ok(PresentOutcome::Skipped(why)) => {
                log::debug!("Surface[{}]: frame {} skipped: {}", self.shared.id, frame_id, why);
                self.shared.update_diagnostics(|d| d.frames_skipped += 1);
                self.shared.dirty.store(true, Ordering::Release);
            }
            Err(e) if e.is_fatal() => self.lose(e.to_string()),
            Err(e) if capability.is_zero_copy() => {
                log::warn!("Surface[{}]: {}; falling back to the CPU copy", self.shared.id, e);
                self.pending_downgrade = Some((Tier::CpuMediated, e.to_string()));
                self.shared.dirty.store(true, Ordering::Release);
            }
            Err(e) => {
                log::error!("Surface[{}]: frame {} not delivered: {}", self.shared.id, frame_id, e);
                self.shared.update_diagnostics(|d| d.frames_skipped += 1);
                self.shared.dirty.store(true, Ordering::Release);
            }
        }
    }

    fn apply_resize(&mut self, resize: PendingResize) {
        let Some(current) = self.factory.surface().map(|s| *s.descriptor()) else {
            return;
        };
        let descriptor = match current.resized(resize.width, resize.height, resize.scale) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                log::error!("Surface[{}]: ignoring resize: {}", self.shared.id, e);
                return;
            }
        };

        match self.factory.resize(descriptor) {
            Ok(reallocated) => {
                if reallocated {
                    if let Err(e) = self.resize_strategy() {
                        if e.is_fatal() {
                            self.lose(e.to_string());
                            return;
                        }
                        log::warn!("Surface[{}]: transport resize failed: {}", self.shared.id, e);
                        self.pending_downgrade = Some((Tier::CpuMediated, e.to_string()));
                    }
                }
                self.renderer.on_resize(resize.width, resize.height, resize.scale);
                self.shared.update_diagnostics(|d| {
                    d.surface = descriptor.size();
                    d.resizes_applied += 1;
                });
                self.shared.emit(TransportEvent::ResizeApplied {
                    surface_id: self.shared.id,
                    width: resize.width,
                    height: resize.height,
                    generation: resize.generation,
                });
                log::debug!(
                    "Surface[{}]: resized to {} (generation {})",
                    self.shared.id,
                    descriptor.size(),
                    resize.generation
                );
                self.shared.dirty.store(true, Ordering::Release);
            }
            Err(e) if e.is_fatal() || self.factory.is_broken() => self.lose(e.to_string()),
            Err(e) => {
                let capability = self.strategy.capability();
                match capability.tier().below() {
                    Some(next) if capability.is_zero_copy() => {
                        log::warn!("Surface[{}]: {}; retrying on a lower tier", self.shared.id, e);
                        self.pending_downgrade = Some((next, e.to_string()));
                        self.retry_resize = Some(resize);
                    }
                    _ => log::error!("Surface[{}]: {}; keeping {}", self.shared.id, e, current.size()),
                }
                self.shared.dirty.store(true, Ordering::Release);
            }
        }
    }

    fn resize_strategy(&mut self) -> Result<(), TransportError> {
        let Some((device, surface)) = self.factory.parts_mut() else {
            return Err(TransportError::SurfaceDestroyed);
        };
        let strategy = &mut self.strategy;
        with_current_context(device, |device| strategy.resize(device, surface))
    }

    /// Swaps the current tier for the best one at or below `ceiling`.
    fn downgrade(&mut self, ceiling: Tier, reason: String) -> Result<(), TransportError> {
        let from = self.strategy.capability();
        let Some(surface) = self.factory.surface() else {
            return Err(TransportError::SurfaceDestroyed);
        };
        let descriptor = *surface.descriptor();
        let start = surface.config();

        release_strategy(self.factory.device_mut(), self.strategy.as_mut());
        let installed = establish(
            &self.shared,
            &mut self.factory,
            &mut self.providers,
            descriptor,
            ceiling,
            start,
        )?;
        self.strategy = installed.strategy;
        self.publish_tier(installed.capability);
        self.shared.update_diagnostics(|d| {
            d.downgrades += 1;
            d.negotiation_attempts += installed.attempts;
        });

        log::warn!(
            "Surface[{}]: downgraded {} -> {}: {}",
            self.shared.id,
            from,
            installed.capability,
            reason
        );
        self.shared.emit(TransportEvent::TierDowngraded {
            surface_id: self.shared.id,
            from,
            to: installed.capability,
            reason,
        });
        self.shared.dirty.store(true, Ordering::Release);
        Ok(())
    }

    fn publish_tier(&self, capability: TransportCapability) {
        *self.shared.capability.lock_or_recover() = Some(capability);
        let sync_mode = self.strategy.sync_mode();
        self.shared.update_diagnostics(|d| {
            d.capability = Some(capability);
            d.sync_mode = sync_mode;
        });
    }

    fn lose(&mut self, reason: String) {
        if let SurfaceState::Lost(_) = self.state {
            return;
        }
        log::error!("Surface[{}]: lost: {}", self.shared.id, reason);
        self.state = SurfaceState::Lost(reason.clone());
        self.shared.lost.store(true, Ordering::Release);
        self.shared.emit(TransportEvent::SurfaceLost {
            surface_id: self.shared.id,
            reason,
        });
    }

    /// Releases in order: outstanding work, the tier's resources (sync token
    /// first), the render target, the context.
    pub fn teardown(&mut self) {
        self.shared.accepting.store(false, Ordering::Release);

        let finished: Result<(), DeviceError> = with_current_context(self.factory.device_mut(), |device| device.finish());
        if let Err(e) = finished {
            log::debug!("Surface[{}]: finish before release: {}", self.shared.id, e);
        }
        release_strategy(self.factory.device_mut(), self.strategy.as_mut());
        self.factory.teardown();

        self.shared.notifier.close();
        self.shared.slot.close();
        self.shared.emit(TransportEvent::SurfaceDestroyed {
            surface_id: self.shared.id,
        });
        match &self.state {
            SurfaceState::Lost(reason) => {
                log::info!("Surface[{}]: destroyed after loss ({}) at frame {}", self.shared.id, reason, self.frame_id)
            }
            SurfaceState::Running => log::info!("Surface[{}]: destroyed after {} frames", self.shared.id, self.frame_id),
        }
    }
}

/// Releases `strategy`, with the context current when it can be made so.
fn release_strategy(device: &mut dyn GraphicsDevice, strategy: &mut dyn TransportStrategy) {
    let mut released = false;
    let result: Result<(), DeviceError> = with_current_context(device, |device| {
        strategy.release(device);
        released = true;
        Ok(())
    });
    if let Err(e) = result {
        log::debug!("{}: releasing {} without a context: {}", device.name(), strategy.capability(), e);
    }
    if !released {
        strategy.release(device);
    }
}

/// Negotiates from `ceiling` down and attaches the winner to the render target,
/// building or rebuilding the target for the winner's configuration. A tier
/// that negotiates but fails to attach is dropped and the next one tried.
fn establish(
    shared: &SurfaceShared,
    factory: &mut GraphicsSurfaceFactory,
    providers: &mut Providers,
    descriptor: SurfaceDescriptor,
    mut ceiling: Tier,
    start: SurfaceConfig,
) -> Result<Installed, TransportError> {
    let mut attempts = 0;
    loop {
        let negotiated = CapabilityNegotiator::new(shared.id, &shared.config, shared.slot.clone())
            .with_ceiling(ceiling)
            .starting_at(start)
            .negotiate(factory.device_mut(), providers, descriptor.size());
        attempts += negotiated.attempts.len();

        let capability = negotiated.capability;
        let mut strategy = negotiated.strategy;
        match attach(factory, strategy.as_mut(), descriptor, negotiated.surface_config) {
            Ok(()) => {
                return Ok(Installed {
                    strategy,
                    capability,
                    attempts,
                })
            }
            Err(e) if e.is_fatal() => {
                release_strategy(factory.device_mut(), strategy.as_mut());
                return Err(e);
            }
            Err(e) => {
                release_strategy(factory.device_mut(), strategy.as_mut());
                match capability.tier().below() {
                    Some(next) => {
                        log::warn!("Surface[{}]: {} failed to attach: {}", shared.id, capability, e);
                        ceiling = next;
                    }
                    None => return Err(TransportError::ContextCreationFailure(format!("{capability}: {e}"))),
                }
            }
        }
    }
}

fn attach(
    factory: &mut GraphicsSurfaceFactory,
    strategy: &mut dyn TransportStrategy,
    descriptor: SurfaceDescriptor,
    config: SurfaceConfig,
) -> Result<(), TransportError> {
    match factory.surface().map(|s| s.config()) {
        None => {
            factory.create_surface(descriptor, config)?;
        }
        Some(current) if current != config => {
            factory.reconfigure(config)?;
        }
        Some(_) => {}
    }
    let Some((device, surface)) = factory.parts_mut() else {
        return Err(TransportError::SurfaceDestroyed);
    };
    with_current_context(device, |device| strategy.attach(device, surface))
}
