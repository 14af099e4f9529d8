//! Producer-side graphics: the device seam, shared-resource providers and the
//! bundled backends.

mod device;
mod provider;
mod viewport;

/// Graphics backends.
pub mod backends {
    /// CPU-memory device and providers used by headless hosts and tests.
    pub mod soft;
}

pub use device::*;
pub use provider::*;
pub use viewport::Viewport;
