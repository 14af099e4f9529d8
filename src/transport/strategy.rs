use crate::errors::TransportError;
use crate::render::{GraphicsDevice, InteropProvider, NativeSurfaceProvider, SyncMode, Viewport};
use crate::surface::RenderSurface;
use crate::transport::handle::ExternalHandle;
use crate::transport::TransportCapability;

/// Result of a successful Present.
#[derive(Clone, Debug, PartialEq)]
pub enum PresentOutcome {
    /// The transfer is queued. The caller flushes and publishes `frame` to the
    /// host once the flush completes, never earlier.
    Presented { rendered: Viewport, frame: ExternalHandle },
    /// Nothing was transferred this cycle (for example a keyed-mutex timeout).
    /// Not a failure; the next cycle tries again.
    Skipped(String),
}

/// One transport tier. Picked by the negotiator, driven by the render thread
/// without knowing which tier it is. All methods run on the render thread.
pub trait TransportStrategy {
    fn capability(&self) -> TransportCapability;

    /// Allocates the per-size resources for `surface`.
    fn attach(&mut self, device: &mut dyn GraphicsDevice, surface: &RenderSurface) -> Result<(), TransportError>;

    /// Rebuilds the per-size resources after `surface` was resized.
    fn resize(&mut self, device: &mut dyn GraphicsDevice, surface: &RenderSurface) -> Result<(), TransportError>;

    /// Moves the rendered region of `surface` to the host as frame `frame_id`.
    /// Does not flush, publish or notify.
    fn present(
        &mut self,
        device: &mut dyn GraphicsDevice,
        surface: &RenderSurface,
        frame_id: u64,
    ) -> Result<PresentOutcome, TransportError>;

    /// Releases everything the tier holds, sync token first. Idempotent.
    /// Frames already handed out that reference released resources must be
    /// retired from the host's slot.
    fn release(&mut self, device: &mut dyn GraphicsDevice);

    fn sync_mode(&self) -> Option<SyncMode> {
        None
    }
}

/// Providers not yet claimed by a strategy.
#[derive(Default)]
pub struct Providers {
    pub interop: Option<Box<dyn InteropProvider>>,
    pub native: Option<Box<dyn NativeSurfaceProvider>>,
}

impl std::fmt::Debug for Providers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Providers")
            .field("interop", &self.interop.as_ref().map(|p| p.name().to_string()))
            .field("native", &self.native.as_ref().map(|p| p.name().to_string()))
            .finish()
    }
}
