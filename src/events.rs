//! Transport events.
//!
//! Every surface publishes its lifecycle on a `tokio::sync::broadcast` bus owned
//! by the [`TransportSession`](crate::session::TransportSession). Hosts that
//! prefer a stream over callbacks subscribe to it; frame notifications appear
//! here as well as in the `on_frame_available` callbacks.

use crate::surface::SurfaceId;
use crate::transport::{FrameInfo, TransportCapability};
use std::fmt::Display;

#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    /// The render thread is up and the surface has a working tier.
    SurfaceCreated { surface_id: SurfaceId, width: u32, height: u32, scale: f32 },
    /// Negotiation picked a tier.
    TierNegotiated { surface_id: SurfaceId, capability: TransportCapability, attempts: usize },
    /// A runtime failure moved the surface to a lower tier, effective from the next frame.
    TierDowngraded {
        surface_id: SurfaceId,
        from: TransportCapability,
        to: TransportCapability,
        reason: String,
    },
    /// A resize was applied on the render thread.
    ResizeApplied { surface_id: SurfaceId, width: u32, height: u32, generation: u64 },
    /// A new frame is complete and can be sampled.
    FrameAvailable(FrameInfo),
    /// The device was lost. The surface must be recreated.
    SurfaceLost { surface_id: SurfaceId, reason: String },
    SurfaceDestroyed { surface_id: SurfaceId },
}

impl TransportEvent {
    pub fn surface_id(&self) -> SurfaceId {
        match self {
            TransportEvent::SurfaceCreated { surface_id, .. }
            | TransportEvent::TierNegotiated { surface_id, .. }
            | TransportEvent::TierDowngraded { surface_id, .. }
            | TransportEvent::ResizeApplied { surface_id, .. }
            | TransportEvent::SurfaceLost { surface_id, .. }
            | TransportEvent::SurfaceDestroyed { surface_id } => *surface_id,
            TransportEvent::FrameAvailable(info) => info.surface_id,
        }
    }
}

impl Display for TransportEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportEvent::SurfaceCreated { width, height, scale, .. } => {
                write!(f, "surface created {width}x{height}@{scale}")
            }
            TransportEvent::TierNegotiated { capability, attempts, .. } => {
                write!(f, "negotiated {capability} after {attempts} attempts")
            }
            TransportEvent::TierDowngraded { from, to, reason, .. } => {
                write!(f, "downgraded {from} -> {to}: {reason}")
            }
            TransportEvent::ResizeApplied {
                width, height, generation, ..
            } => write!(f, "resized to {width}x{height} (generation {generation})"),
            TransportEvent::FrameAvailable(info) => write!(f, "frame {} available", info.frame_id),
            TransportEvent::SurfaceLost { reason, .. } => write!(f, "surface lost: {reason}"),
            TransportEvent::SurfaceDestroyed { .. } => write!(f, "surface destroyed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::FenceId;
    use crate::transport::InteropAttachment;
    use tokio::sync::broadcast;

    #[test]
    fn surface_id_of_every_variant() {
        let id = SurfaceId::new();
        let info = FrameInfo {
            surface_id: id,
            frame_id: 3,
            capability: TransportCapability::CpuMediated,
            width: 1,
            height: 1,
            fence: FenceId(3),
        };
        let events = [
            TransportEvent::SurfaceCreated { surface_id: id, width: 1, height: 1, scale: 1.0 },
            TransportEvent::FrameAvailable(info),
            TransportEvent::SurfaceDestroyed { surface_id: id },
        ];
        assert!(events.iter().all(|e| e.surface_id() == id));
    }

    #[test]
    fn display_downgrade() {
        let e = TransportEvent::TierDowngraded {
            surface_id: SurfaceId::new(),
            from: TransportCapability::CrossApiInterop(InteropAttachment::Texture),
            to: TransportCapability::CpuMediated,
            reason: "lock failed".into(),
        };
        assert_eq!(e.to_string(), "downgraded CrossApiInterop(texture) -> CpuMediated: lock failed");
    }

    #[tokio::test]
    async fn bus_delivers_to_all_subscribers() {
        let (tx, mut a) = broadcast::channel(8);
        let mut b = tx.subscribe();
        let id = SurfaceId::new();
        tx.send(TransportEvent::SurfaceDestroyed { surface_id: id }).unwrap();

        assert_eq!(a.recv().await.unwrap().surface_id(), id);
        assert_eq!(b.recv().await.unwrap().surface_id(), id);
    }
}
