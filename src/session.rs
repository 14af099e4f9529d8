//! Host-facing surfaces.
//!
//! A [`TransportSession`] owns the event bus and the configuration. Each
//! surface it creates gets a dedicated render thread that owns the producer's
//! graphics context for the surface's whole life; nothing else ever calls
//! into the device. The host talks to that thread only through atomics, the
//! resize slot and the published frame slot, so no host call blocks on GPU work.
//!
//! ```
//! use frame_bridge::config::TransportConfig;
//! use frame_bridge::render::backends::soft::SoftPlatform;
//! use frame_bridge::renderer::Quadrants;
//! use frame_bridge::session::TransportSession;
//! use frame_bridge::transport::TransportCapability;
//!
//! let session = TransportSession::new(Some(TransportConfig::default()));
//! let (platform, _handles) = SoftPlatform::new().build();
//! let surface = session.create_surface_blocking(64, 64, 1.0, platform, Quadrants::new())?;
//! assert_eq!(surface.active_tier(), Some(TransportCapability::CpuMediated));
//! surface.destroy_surface();
//! # Ok::<(), frame_bridge::errors::TransportError>(())
//! ```

mod worker;

#[cfg(test)]
mod tests;

use crate::config::TransportConfig;
use crate::errors::TransportError;
use crate::events::TransportEvent;
use crate::render::{GraphicsPlatform, SharedResourceHandle};
use crate::renderer::FrameRenderer;
use crate::surface::{SurfaceDescriptor, SurfaceId};
use crate::sync::LockExt;
use crate::transport::handle::FrameSlot;
use crate::transport::{Diagnostics, ExternalHandle, FrameInfo, FrameNotifier, PixelBuffer, ResizeCoordinator, TransportCapability};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{JoinHandle, Thread};
use tokio::sync::{broadcast, oneshot};
use worker::SurfaceSpawnArgs;

/// State shared between a surface's handle and its render thread.
pub(crate) struct SurfaceShared {
    pub id: SurfaceId,
    pub config: TransportConfig,
    pub resize: ResizeCoordinator,
    pub notifier: Arc<FrameNotifier>,
    pub slot: Arc<FrameSlot>,
    pub events: broadcast::Sender<TransportEvent>,
    /// A redraw was requested.
    pub dirty: AtomicBool,
    pub accepting: AtomicBool,
    pub shutdown: AtomicBool,
    pub lost: AtomicBool,
    pub capability: Mutex<Option<TransportCapability>>,
    pub diagnostics: Mutex<Diagnostics>,
    thread: OnceLock<Thread>,
}

impl SurfaceShared {
    fn new(config: TransportConfig, events: broadcast::Sender<TransportEvent>) -> Self {
        Self {
            id: SurfaceId::new(),
            config,
            resize: ResizeCoordinator::new(),
            notifier: Arc::new(FrameNotifier::new(events.clone())),
            slot: Arc::new(FrameSlot::default()),
            events,
            dirty: AtomicBool::new(true),
            accepting: AtomicBool::new(true),
            shutdown: AtomicBool::new(false),
            lost: AtomicBool::new(false),
            capability: Mutex::new(None),
            diagnostics: Mutex::new(Diagnostics::default()),
            thread: OnceLock::new(),
        }
    }

    /// Wakes the render thread if it is parked.
    pub fn wake(&self) {
        if let Some(thread) = self.thread.get() {
            thread.unpark();
        }
    }

    pub fn emit(&self, event: TransportEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub fn update_diagnostics(&self, f: impl FnOnce(&mut Diagnostics)) {
        f(&mut self.diagnostics.lock_or_recover());
    }
}

/// Creates surfaces and carries their event bus.
pub struct TransportSession {
    config: TransportConfig,
    events: broadcast::Sender<TransportEvent>,
}

impl TransportSession {
    /// Without a configuration the defaults are used, with environment overrides applied.
    pub fn new(config: Option<TransportConfig>) -> Self {
        let config = config.unwrap_or_else(|| TransportConfig::default().with_env_overrides());
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self { config, events }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Events of every surface of this session.
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    /// Starts a surface and waits until its render thread has a working tier.
    pub async fn create_surface(
        &self,
        width: u32,
        height: u32,
        scale: f32,
        platform: GraphicsPlatform,
        renderer: impl FrameRenderer + 'static,
    ) -> Result<SurfaceHandle, TransportError> {
        let (handle, ready) = self.spawn_surface(width, height, scale, platform, Box::new(renderer))?;
        handle.started(ready.await)
    }

    /// Blocking [`create_surface`](Self::create_surface). Must not be called
    /// from within an async runtime.
    pub fn create_surface_blocking(
        &self,
        width: u32,
        height: u32,
        scale: f32,
        platform: GraphicsPlatform,
        renderer: impl FrameRenderer + 'static,
    ) -> Result<SurfaceHandle, TransportError> {
        let (handle, ready) = self.spawn_surface(width, height, scale, platform, Box::new(renderer))?;
        handle.started(ready.blocking_recv())
    }

    fn spawn_surface(
        &self,
        width: u32,
        height: u32,
        scale: f32,
        platform: GraphicsPlatform,
        renderer: Box<dyn FrameRenderer>,
    ) -> Result<(SurfaceHandle, oneshot::Receiver<Result<(), TransportError>>), TransportError> {
        let descriptor = SurfaceDescriptor::new(width, height, scale)?.with_format(crate::surface::PixelFormat {
            order: self.config.host_channel_order,
        });
        let shared = Arc::new(SurfaceShared::new(self.config.clone(), self.events.clone()));
        let (ready_tx, ready_rx) = oneshot::channel();

        let args = SurfaceSpawnArgs {
            shared: shared.clone(),
            platform,
            renderer,
            descriptor,
            ready: ready_tx,
        };
        let join = worker::spawn(args).map_err(|e| TransportError::RenderThread(format!("spawn failed: {e}")))?;
        let _ = shared.thread.set(join.thread().clone());

        log::debug!("Surface[{}]: render thread started for {}x{}@{}", shared.id, width, height, scale);
        let handle = SurfaceHandle {
            shared,
            join: Mutex::new(Some(join)),
        };
        Ok((handle, ready_rx))
    }
}

impl std::fmt::Debug for TransportSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSession")
            .field("config", &self.config)
            .field("subscribers", &self.events.receiver_count())
            .finish()
    }
}

/// A live surface. Dropping it destroys the surface.
pub struct SurfaceHandle {
    shared: Arc<SurfaceShared>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl SurfaceHandle {
    fn started(self, ready: Result<Result<(), TransportError>, oneshot::error::RecvError>) -> Result<Self, TransportError> {
        match ready {
            Ok(Ok(())) => Ok(self),
            // The render thread has exited; dropping the handle joins it.
            Ok(Err(e)) => Err(e),
            Err(_) => Err(TransportError::RenderThread("render thread exited during start-up".into())),
        }
    }

    pub fn surface_id(&self) -> SurfaceId {
        self.shared.id
    }

    /// Requests a resize. Returns immediately; the render thread applies the
    /// newest request at the start of its next cycle.
    pub fn resize(&self, width: u32, height: u32, scale: f32) -> Result<u64, TransportError> {
        if !self.shared.accepting.load(Ordering::Acquire) {
            return Err(TransportError::SurfaceDestroyed);
        }
        let generation = self.shared.resize.request_resize(width, height, scale)?;
        self.shared.wake();
        Ok(generation)
    }

    /// Requests a redraw.
    pub fn invalidate(&self) {
        self.shared.dirty.store(true, Ordering::Release);
        self.shared.wake();
    }

    pub fn on_frame_available(&self, callback: impl Fn(&FrameInfo) + Send + Sync + 'static) {
        self.shared.notifier.on_frame_available(callback);
    }

    /// Runs frame callbacks through `dispatcher`, e.g. to post them to the host's UI thread.
    pub fn set_dispatcher(&self, dispatcher: impl Fn(Box<dyn FnOnce() + Send + 'static>) + Send + Sync + 'static) {
        self.shared.notifier.set_dispatcher(dispatcher);
    }

    /// Current shared resource on the zero-copy tiers. Re-query before every sample.
    pub fn shared_resource_handle(&self) -> Option<SharedResourceHandle> {
        self.shared.slot.shared_resource_handle()
    }

    /// Latest CPU frame on the CPU-mediated tier.
    pub fn pixel_buffer(&self) -> Option<Arc<PixelBuffer>> {
        self.shared.slot.pixel_buffer()
    }

    /// Whichever of the two the active tier publishes. A frame shows up here
    /// once its GPU work is complete, never ahead of its notification, and
    /// disappears when the resource behind it is released (resize, downgrade,
    /// teardown).
    pub fn external_handle(&self) -> Option<ExternalHandle> {
        self.shared.slot.external_handle()
    }

    pub fn active_tier(&self) -> Option<TransportCapability> {
        *self.shared.capability.lock_or_recover()
    }

    pub fn diagnostics(&self) -> Diagnostics {
        self.shared.diagnostics.lock_or_recover().clone()
    }

    /// Diagnostics overlay text, empty when the overlay is turned off.
    pub fn overlay_lines(&self) -> Vec<String> {
        if !self.shared.config.overlay_enabled {
            return Vec::new();
        }
        self.diagnostics().overlay_lines()
    }

    /// Frames announced to the host so far.
    pub fn frames_notified(&self) -> u64 {
        self.shared.notifier.notified_count()
    }

    pub fn last_frame_id(&self) -> u64 {
        self.shared.notifier.last_frame_id()
    }

    /// True after the device was lost. The surface has to be recreated.
    pub fn is_lost(&self) -> bool {
        self.shared.lost.load(Ordering::Acquire)
    }

    /// Events of this session's bus. Filter on [`TransportEvent::surface_id`].
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.shared.events.subscribe()
    }

    /// Stops the render thread and releases everything it holds. Blocks until
    /// the thread has finished tearing down. Idempotent.
    pub fn destroy_surface(&self) {
        self.shared.accepting.store(false, Ordering::Release);
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.wake();

        let Some(join) = self.join.lock_or_recover().take() else {
            return;
        };
        if join.thread().id() == std::thread::current().id() {
            // Called from a frame callback on the render thread itself.
            log::warn!("Surface[{}]: destroy requested from the render thread; not joining", self.shared.id);
            return;
        }
        if join.join().is_err() {
            log::error!("Surface[{}]: render thread panicked", self.shared.id);
        }
    }
}

impl Drop for SurfaceHandle {
    fn drop(&mut self) {
        self.destroy_surface();
    }
}

impl std::fmt::Debug for SurfaceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SurfaceHandle")
            .field("surface_id", &self.shared.id)
            .field("tier", &self.active_tier())
            .field("lost", &self.is_lost())
            .finish()
    }
}
