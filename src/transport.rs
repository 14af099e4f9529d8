//! Moving finished frames from the producer device to the host.
//!
//! A [`negotiator::CapabilityNegotiator`] picks one of three tiers and hands
//! back a [`strategy::TransportStrategy`] for it:
//!
//! - [`TransportCapability::NativeSharedMemory`] and
//!   [`TransportCapability::CrossApiInterop`] blit into memory the host samples
//!   in place ([`bridge::FrameTransportBridge`]).
//! - [`TransportCapability::CpuMediated`] reads pixels back into a buffer
//!   ([`fallback::FallbackCopyPath`]).
//!
//! The render thread drives whichever strategy it got without knowing the tier.

pub mod bridge;
pub mod capability;
pub mod diagnostics;
pub mod factory;
pub mod fallback;
pub mod handle;
mod interop;
mod native;
pub mod negotiator;
pub mod notifier;
pub mod resize;
pub mod strategy;

pub use bridge::FrameTransportBridge;
pub use capability::{AttemptOutcome, InteropAttachment, NegotiationAttempt, Tier, TransportCapability};
pub use diagnostics::Diagnostics;
pub use factory::GraphicsSurfaceFactory;
pub use fallback::{compose_host_frame, FallbackCopyPath};
pub use handle::{ExternalHandle, PixelBuffer};
pub use negotiator::{CapabilityNegotiator, Negotiated};
pub use notifier::{Dispatcher, FrameCallback, FrameInfo, FrameNotifier};
pub use resize::{PendingResize, ResizeCoordinator};
pub use strategy::{PresentOutcome, Providers, TransportStrategy};
