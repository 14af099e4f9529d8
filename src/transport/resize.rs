//! Resize requests from any thread, applied once on the render thread.
//!
//! Requests get a monotonically increasing generation. The render thread
//! takes whatever is pending at the start of a Present cycle; everything
//! requested in between is coalesced into the highest generation. Nothing here
//! touches the GPU, and the slot lock is only held to compare and swap.

use crate::errors::TransportError;
use crate::surface::validate_dimensions;
use crate::sync::LockExt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PendingResize {
    pub width: u32,
    pub height: u32,
    pub scale: f32,
    pub generation: u64,
}

#[derive(Debug, Default)]
pub struct ResizeCoordinator {
    generation: AtomicU64,
    pending: Mutex<Option<PendingResize>>,
    has_pending: AtomicBool,
    applied_generation: AtomicU64,
}

impl ResizeCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a resize request and returns its generation. Never blocks on the
    /// render thread.
    pub fn request_resize(&self, width: u32, height: u32, scale: f32) -> Result<u64, TransportError> {
        validate_dimensions(width, height, scale)?;

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        {
            let mut slot = self.pending.lock_or_recover();
            // Two requesters can reach the slot out of generation order.
            if slot.map_or(true, |p| p.generation < generation) {
                *slot = Some(PendingResize {
                    width,
                    height,
                    scale,
                    generation,
                });
            }
        }
        self.has_pending.store(true, Ordering::Release);
        Ok(generation)
    }

    pub fn has_pending(&self) -> bool {
        self.has_pending.load(Ordering::Acquire)
    }

    /// Takes the newest pending request. Render thread only.
    pub fn apply_if_pending(&self) -> Option<PendingResize> {
        if !self.has_pending.swap(false, Ordering::AcqRel) {
            return None;
        }
        let taken = self.pending.lock_or_recover().take();
        if let Some(p) = taken {
            self.applied_generation.store(p.generation, Ordering::Release);
        }
        taken
    }

    /// Generation of the last request handed to the render thread.
    pub fn applied_generation(&self) -> u64 {
        self.applied_generation.load(Ordering::Acquire)
    }

    /// Generation of the last request made.
    pub fn latest_generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}
