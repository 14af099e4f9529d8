use crate::render::{DeviceError, FramebufferStatus};
use crate::transport::TransportCapability;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Invalid surface dimensions {width}x{height} at scale {scale}")]
    InvalidDimensions { width: u32, height: u32, scale: f32 },

    /// A tier could not be brought up. Recovered by the negotiator, never surfaced.
    #[error("Negotiation failed for {capability}: {reason}")]
    NegotiationFailure { capability: TransportCapability, reason: String },

    /// A working tier failed while presenting. The session downgrades next frame.
    #[error("Transport failure on {capability}: {reason}")]
    RuntimeTransportFailure { capability: TransportCapability, reason: String },

    #[error("Context creation failed: {0}")]
    ContextCreationFailure(String),

    #[error("Graphics device lost")]
    DeviceLost,

    #[error("Producer context is not current on this thread")]
    ContextNotCurrent,

    #[error("Framebuffer incomplete after resize to {width}x{height}: {status:?}")]
    ResizeIncomplete { width: u32, height: u32, status: FramebufferStatus },

    #[error("Surface has been destroyed")]
    SurfaceDestroyed,

    #[error("Render thread error: {0}")]
    RenderThread(String),

    #[error("Renderer error: {0}")]
    Renderer(String),

    #[error("Graphics device error: {0}")]
    Device(DeviceError),
}

impl From<DeviceError> for TransportError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::Lost => TransportError::DeviceLost,
            DeviceError::ContextNotCurrent => TransportError::ContextNotCurrent,
            other => TransportError::Device(other),
        }
    }
}

impl From<anyhow::Error> for TransportError {
    fn from(err: anyhow::Error) -> Self {
        TransportError::Renderer(format!("{err:#}"))
    }
}

impl TransportError {
    /// True for the errors that end the surface's life.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::DeviceLost | TransportError::ContextCreationFailure(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_errors_map_to_taxonomy() {
        assert!(matches!(TransportError::from(DeviceError::Lost), TransportError::DeviceLost));
        assert!(matches!(
            TransportError::from(DeviceError::ContextNotCurrent),
            TransportError::ContextNotCurrent
        ));
        assert!(matches!(
            TransportError::from(DeviceError::Unsupported("x".into())),
            TransportError::Device(DeviceError::Unsupported(_))
        ));
    }

    #[test]
    fn fatal_kinds() {
        assert!(TransportError::DeviceLost.is_fatal());
        assert!(TransportError::ContextCreationFailure("no".into()).is_fatal());
        assert!(!TransportError::SurfaceDestroyed.is_fatal());
    }

    #[test]
    fn renderer_error_keeps_context_chain() {
        let err = anyhow::anyhow!("tile cache").context("draw failed");
        let e: TransportError = err.into();
        assert_eq!(e.to_string(), "Renderer error: draw failed: tile cache");
    }
}
