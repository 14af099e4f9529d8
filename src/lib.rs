//! Moves rendered frames from a producer's GPU context to a host compositor.
//!
//! A [`TransportSession`] creates surfaces. Each surface has its own render
//! thread that owns the producer's graphics context, drives a
//! [`renderer::FrameRenderer`] and hands every finished frame to the host over
//! the best transport tier the platform supports: a native shared surface,
//! cross-API interop, or a CPU copy. Hosts sample the
//! [`transport::ExternalHandle`] of the latest frame after they are notified.

pub mod config;
pub mod errors;
pub mod events;
pub mod ffi;
pub mod render;
pub mod renderer;
pub mod session;
pub mod surface;
pub mod transport;

mod sync;

/// Capacity of the session event bus unless configured otherwise.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

pub use config::TransportConfig;
pub use errors::TransportError;
pub use events::TransportEvent;
pub use session::{SurfaceHandle, TransportSession};
pub use surface::SurfaceId;
pub use transport::{ExternalHandle, TransportCapability};
