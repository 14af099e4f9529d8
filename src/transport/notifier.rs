//! Frame-available notifications.
//!
//! A notification is only sent from the completion callback of the flush that
//! carried the frame's transfer, so by the time a host hears about a frame the
//! GPU is done with it. The same callback makes the frame host-visible, after
//! the notified counters move and before anyone is told, so a host that polls
//! never sees a frame ahead of its notification. Each frame id is notified at
//! most once, in order.

use crate::events::TransportEvent;
use crate::render::{CompletionCallback, FenceId};
use crate::surface::SurfaceId;
use crate::sync::RwLockExt;
use crate::transport::TransportCapability;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

/// What a host learns about a completed frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameInfo {
    pub surface_id: SurfaceId,
    pub frame_id: u64,
    pub capability: TransportCapability,
    pub width: u32,
    pub height: u32,
    /// Fence that was signaled before this notification.
    pub fence: FenceId,
}

pub type FrameCallback = Arc<dyn Fn(&FrameInfo) + Send + Sync + 'static>;

/// Runs a notification job on the host's thread of choice.
pub type Dispatcher = Arc<dyn Fn(Box<dyn FnOnce() + Send + 'static>) + Send + Sync + 'static>;

pub struct FrameNotifier {
    callbacks: RwLock<Vec<FrameCallback>>,
    dispatcher: RwLock<Option<Dispatcher>>,
    events: broadcast::Sender<TransportEvent>,
    last_frame: AtomicU64,
    notified: AtomicU64,
    closed: AtomicBool,
}

impl FrameNotifier {
    pub fn new(events: broadcast::Sender<TransportEvent>) -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            dispatcher: RwLock::new(None),
            events,
            last_frame: AtomicU64::new(0),
            notified: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn on_frame_available(&self, callback: impl Fn(&FrameInfo) + Send + Sync + 'static) {
        self.callbacks.write_or_recover().push(Arc::new(callback));
    }

    /// Without a dispatcher, callbacks run on the thread that completed the frame.
    pub fn set_dispatcher(&self, dispatcher: impl Fn(Box<dyn FnOnce() + Send + 'static>) + Send + Sync + 'static) {
        *self.dispatcher.write_or_recover() = Some(Arc::new(dispatcher));
    }

    /// Announces a completed frame. Returns false if it was suppressed.
    pub fn notify(&self, info: FrameInfo) -> bool {
        self.notify_with(info, || {})
    }

    /// Like [`notify`](Self::notify), running `publish` once the frame is
    /// counted but before the bus and the callbacks hear about it. `publish`
    /// does not run for a suppressed frame.
    pub fn notify_with(&self, info: FrameInfo, publish: impl FnOnce()) -> bool {
        if self.closed.load(Ordering::Acquire) {
            log::debug!("Surface[{}]: frame {} completed after teardown", info.surface_id, info.frame_id);
            return false;
        }

        let previous = self.last_frame.fetch_max(info.frame_id, Ordering::AcqRel);
        if previous >= info.frame_id {
            log::warn!(
                "Surface[{}]: frame {} already notified (last {})",
                info.surface_id,
                info.frame_id,
                previous
            );
            return false;
        }
        self.notified.fetch_add(1, Ordering::AcqRel);
        publish();

        // No subscribers is fine.
        let _ = self.events.send(TransportEvent::FrameAvailable(info.clone()));

        let callbacks = self.callbacks.read_or_recover().clone();
        if callbacks.is_empty() {
            return true;
        }
        let job = move || {
            for callback in &callbacks {
                callback(&info);
            }
        };

        let dispatcher = self.dispatcher.read_or_recover().clone();
        match dispatcher {
            Some(dispatch) => dispatch(Box::new(job)),
            None => job(),
        }
        true
    }

    /// Completion callback that publishes and then notifies `info` with the
    /// signaled fence.
    pub(crate) fn completion(
        self: &Arc<Self>,
        info: FrameInfo,
        publish: impl FnOnce() + Send + 'static,
    ) -> CompletionCallback {
        let notifier = self.clone();
        Box::new(move |fence| {
            notifier.notify_with(FrameInfo { fence, ..info }, publish);
        })
    }

    /// Stops all further notifications.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn notified_count(&self) -> u64 {
        self.notified.load(Ordering::Acquire)
    }

    pub fn last_frame_id(&self) -> u64 {
        self.last_frame.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for FrameNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameNotifier")
            .field("callbacks", &self.callbacks.read_or_recover().len())
            .field("last_frame", &self.last_frame_id())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}
