use crate::render::{DeviceError, SharedResourceHandle, SharedSurfaceReader, SyncAcquire};
use crate::surface::{ChannelOrder, SurfaceSize, BYTES_PER_PIXEL};
use crate::sync::LockExt;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Pixel storage. Row `y` of `data` is framebuffer row `y`, whatever the origin.
#[derive(Debug, Clone)]
pub struct SoftImage {
    pub size: SurfaceSize,
    pub order: ChannelOrder,
    pub data: Vec<u8>,
    /// Registered with an interop object.
    pub registered: bool,
    /// Locked for producer writes by the interop object.
    pub locked: bool,
}

pub type SharedImage = Arc<Mutex<SoftImage>>;

impl SoftImage {
    pub fn new(size: SurfaceSize, order: ChannelOrder) -> Self {
        Self {
            size,
            order,
            data: vec![0; size.byte_len()],
            registered: false,
            locked: false,
        }
    }

    pub fn shared(size: SurfaceSize, order: ChannelOrder) -> SharedImage {
        Arc::new(Mutex::new(Self::new(size, order)))
    }

    pub fn offset(&self, x: u32, y: u32) -> usize {
        (y as usize * self.size.width as usize + x as usize) * BYTES_PER_PIXEL
    }

    pub fn row(&self, y: u32) -> &[u8] {
        let start = self.offset(0, y);
        &self.data[start..start + self.size.stride()]
    }

    /// Pixel in storage order.
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let o = self.offset(x, y);
        [self.data[o], self.data[o + 1], self.data[o + 2], self.data[o + 3]]
    }
}

#[derive(Debug, Clone, Copy)]
struct KeyedMutex {
    key: u64,
    held: bool,
}

#[derive(Default)]
struct StoreInner {
    images: HashMap<u64, SharedImage>,
    mutexes: HashMap<u64, KeyedMutex>,
    next_raw: u64,
}

/// Memory both sides of the soft backend resolve handles against.
#[derive(Default)]
pub(crate) struct SharedStore {
    inner: Mutex<StoreInner>,
    released: Condvar,
}

impl SharedStore {
    pub fn insert(&self, image: SoftImage, keyed_mutex: bool) -> u64 {
        let mut inner = self.inner.lock_or_recover();
        inner.next_raw += 1;
        let raw = 0x5f00_0000 + inner.next_raw;
        inner.images.insert(raw, Arc::new(Mutex::new(image)));
        if keyed_mutex {
            inner.mutexes.insert(raw, KeyedMutex { key: 0, held: false });
        }
        raw
    }

    pub fn get(&self, raw: u64) -> Option<SharedImage> {
        self.inner.lock_or_recover().images.get(&raw).cloned()
    }

    pub fn remove(&self, raw: u64) {
        let mut inner = self.inner.lock_or_recover();
        inner.images.remove(&raw);
        inner.mutexes.remove(&raw);
        self.released.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner.lock_or_recover().images.len()
    }

    /// Waits until the keyed mutex of `raw` was last released with `key`.
    pub fn acquire(&self, raw: u64, key: u64, timeout: Duration) -> Result<SyncAcquire, DeviceError> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock_or_recover();
        loop {
            let state = inner
                .mutexes
                .get_mut(&raw)
                .ok_or_else(|| DeviceError::UnknownObject(format!("keyed mutex {raw:#x}")))?;
            if !state.held && state.key == key {
                state.held = true;
                return Ok(SyncAcquire::Acquired);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(SyncAcquire::TimedOut);
            }
            inner = self
                .released
                .wait_timeout(inner, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }

    pub fn release(&self, raw: u64, key: u64) -> Result<(), DeviceError> {
        let mut inner = self.inner.lock_or_recover();
        let state = inner
            .mutexes
            .get_mut(&raw)
            .ok_or_else(|| DeviceError::UnknownObject(format!("keyed mutex {raw:#x}")))?;
        if !state.held {
            return Err(DeviceError::InvalidOperation(format!(
                "keyed mutex {raw:#x} released without being acquired"
            )));
        }
        state.held = false;
        state.key = key;
        self.released.notify_all();
        Ok(())
    }
}

/// The host's side of the soft backend: reads shared resources and takes part
/// in the keyed-mutex handshake.
#[derive(Clone)]
pub struct SoftHostView {
    store: Arc<SharedStore>,
}

impl SoftHostView {
    pub(crate) fn new(store: Arc<SharedStore>) -> Self {
        Self { store }
    }

    /// Shared resources currently alive.
    pub fn live_resources(&self) -> usize {
        self.store.len()
    }

    /// Host-side acquire. Hosts use `handle.sync.consumer_key`.
    pub fn acquire(&self, handle: &SharedResourceHandle, key: u64, timeout: Duration) -> Result<SyncAcquire, DeviceError> {
        self.store.acquire(handle.raw, key, timeout)
    }

    /// Host-side release. Hosts hand back with `handle.sync.producer_key`.
    pub fn release(&self, handle: &SharedResourceHandle, key: u64) -> Result<(), DeviceError> {
        self.store.release(handle.raw, key)
    }
}

impl SharedSurfaceReader for SoftHostView {
    fn read(&self, handle: &SharedResourceHandle) -> Result<Vec<u8>, DeviceError> {
        let image = self
            .store
            .get(handle.raw)
            .ok_or_else(|| DeviceError::UnknownObject(format!("shared resource {handle}")))?;
        let image = image.lock_or_recover();
        if image.locked {
            return Err(DeviceError::InvalidOperation("shared resource is locked by the producer".into()));
        }
        Ok(image.data.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::SharedResourceKind;

    fn handle(raw: u64) -> SharedResourceHandle {
        SharedResourceHandle {
            raw,
            kind: SharedResourceKind::InteropTexture,
            size: SurfaceSize::new(1, 1),
            order: ChannelOrder::Bgra,
            generation: 1,
            sync: None,
        }
    }

    #[test]
    fn keyed_mutex_ping_pong() {
        let store = Arc::new(SharedStore::default());
        let raw = store.insert(SoftImage::new(SurfaceSize::new(1, 1), ChannelOrder::Bgra), true);
        let short = Duration::from_millis(5);

        assert_eq!(store.acquire(raw, 0, short).unwrap(), SyncAcquire::Acquired);
        // Held: the host cannot get in.
        assert_eq!(store.acquire(raw, 1, short).unwrap(), SyncAcquire::TimedOut);
        store.release(raw, 1).unwrap();

        // The producer must wait for the host to hand back.
        assert_eq!(store.acquire(raw, 0, short).unwrap(), SyncAcquire::TimedOut);
        assert_eq!(store.acquire(raw, 1, short).unwrap(), SyncAcquire::Acquired);
        store.release(raw, 0).unwrap();
        assert_eq!(store.acquire(raw, 0, short).unwrap(), SyncAcquire::Acquired);
    }

    #[test]
    fn release_without_acquire_fails() {
        let store = SharedStore::default();
        let raw = store.insert(SoftImage::new(SurfaceSize::new(1, 1), ChannelOrder::Rgba), true);
        assert!(store.release(raw, 1).is_err());
    }

    #[test]
    fn acquire_wakes_on_release_from_other_thread() {
        let store = Arc::new(SharedStore::default());
        let raw = store.insert(SoftImage::new(SurfaceSize::new(1, 1), ChannelOrder::Rgba), true);
        store.acquire(raw, 0, Duration::from_millis(1)).unwrap();

        let s = store.clone();
        let t = std::thread::spawn(move || s.acquire(raw, 1, Duration::from_secs(5)).unwrap());
        std::thread::sleep(Duration::from_millis(20));
        store.release(raw, 1).unwrap();
        assert_eq!(t.join().unwrap(), SyncAcquire::Acquired);
    }

    #[test]
    fn host_read_refuses_locked_resource() {
        let store = Arc::new(SharedStore::default());
        let raw = store.insert(SoftImage::new(SurfaceSize::new(2, 1), ChannelOrder::Bgra), false);
        let view = SoftHostView::new(store.clone());

        assert_eq!(view.read(&handle(raw)).unwrap().len(), 8);
        store.get(raw).unwrap().lock().unwrap().locked = true;
        assert!(view.read(&handle(raw)).is_err());

        store.remove(raw);
        assert_eq!(view.live_resources(), 0);
        assert!(matches!(view.read(&handle(raw)), Err(DeviceError::UnknownObject(_))));
    }
}
