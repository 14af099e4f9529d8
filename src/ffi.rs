//! C ABI for hosts that are not written in Rust.
//!
//! Surfaces created through this interface run on the bundled soft platform
//! and render a display list that the host edits with the `push` calls.
//! Colors are packed as `0xRRGGBBAA`. Pixels are copied out in the session's
//! host channel order, top row first. When the session runs the keyed mutex,
//! copying a frame follows the consumer side of it: take the host key, read,
//! hand the producer key back.

use crate::render::backends::soft::{SoftHandles, SoftInteropOptions, SoftPlatform};
use crate::render::{SharedResourceHandle, SharedSurfaceReader, SyncAcquire};
use crate::renderer::{Color, DisplayItem, RenderList};
use crate::session::{SurfaceHandle, TransportSession};
use crate::sync::LockExt;
use crate::transport::ExternalHandle;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub struct FfiSurface {
    surface: SurfaceHandle,
    list: Arc<Mutex<RenderList>>,
    handles: SoftHandles,
    sync_timeout: Duration,
}

#[repr(C)]
pub struct FrameBridgeSessionHandle(*mut TransportSession);

#[repr(C)]
pub struct FrameBridgeSurfaceHandle(*mut FfiSurface);

fn unpack(rgba: u32) -> Color {
    let [r, g, b, a] = rgba.to_be_bytes();
    Color::from_u8(r, g, b, a)
}

fn surface_ref<'a>(handle: &FrameBridgeSurfaceHandle) -> Option<&'a FfiSurface> {
    if handle.0.is_null() {
        return None;
    }
    Some(unsafe { &*handle.0 })
}

/// Reads a shared frame, holding the consumer key for the duration if the
/// resource carries one.
fn read_shared(s: &FfiSurface, handle: &SharedResourceHandle) -> Option<Vec<u8>> {
    let Some(token) = handle.sync else {
        return s.handles.host.read(handle).map_err(|e| log::debug!("ffi: frame not readable yet: {}", e)).ok();
    };

    match s.handles.host.acquire(handle, token.consumer_key, s.sync_timeout) {
        Ok(SyncAcquire::Acquired) => {}
        Ok(SyncAcquire::TimedOut) => {
            log::debug!("ffi: frame still owned by the producer");
            return None;
        }
        Err(e) => {
            log::debug!("ffi: cannot take the host key: {}", e);
            return None;
        }
    }
    let pixels = s.handles.host.read(handle);
    if let Err(e) = s.handles.host.release(handle, token.producer_key) {
        log::warn!("ffi: cannot hand the producer key back: {}", e);
    }
    pixels.map_err(|e| log::debug!("ffi: frame not readable yet: {}", e)).ok()
}

fn push(handle: &FrameBridgeSurfaceHandle, item: DisplayItem) {
    if let Some(s) = surface_ref(handle) {
        s.list.lock_or_recover().add_command(item);
        s.surface.invalidate();
    }
}

/// Creates a session with the default configuration and environment overrides.
#[no_mangle]
pub extern "C" fn frame_bridge_session_new() -> FrameBridgeSessionHandle {
    let session = Box::new(TransportSession::new(None));
    FrameBridgeSessionHandle(Box::into_raw(session))
}

#[no_mangle]
pub extern "C" fn frame_bridge_session_free(handle: FrameBridgeSessionHandle) {
    if !handle.0.is_null() {
        unsafe {
            let _ = Box::from_raw(handle.0);
        }
    }
}

/// Creates a surface. Returns a null handle if the surface could not be created.
#[no_mangle]
pub extern "C" fn frame_bridge_surface_new(
    session: FrameBridgeSessionHandle,
    width: u32,
    height: u32,
    scale: f32,
    interop: bool,
) -> FrameBridgeSurfaceHandle {
    let null = FrameBridgeSurfaceHandle(std::ptr::null_mut());
    if session.0.is_null() {
        return null;
    }
    let session = unsafe { &*session.0 };

    let mut platform = SoftPlatform::new();
    if interop {
        platform = platform.with_interop(SoftInteropOptions::default());
    }
    let (platform, handles) = platform.build();
    let list = RenderList::new().shared();
    let sync_timeout = session.config().sync_timeout();

    match session.create_surface_blocking(width, height, scale, platform, list.clone()) {
        Ok(surface) => FrameBridgeSurfaceHandle(Box::into_raw(Box::new(FfiSurface {
            surface,
            list,
            handles,
            sync_timeout,
        }))),
        Err(e) => {
            log::error!("ffi: cannot create {}x{} surface: {}", width, height, e);
            null
        }
    }
}

#[no_mangle]
pub extern "C" fn frame_bridge_surface_clear_list(handle: FrameBridgeSurfaceHandle) {
    if let Some(s) = surface_ref(&handle) {
        s.list.lock_or_recover().clear();
        s.surface.invalidate();
    }
}

#[no_mangle]
pub extern "C" fn frame_bridge_surface_push_clear(handle: FrameBridgeSurfaceHandle, rgba: u32) {
    push(&handle, DisplayItem::Clear { color: unpack(rgba) });
}

#[no_mangle]
pub extern "C" fn frame_bridge_surface_push_rect(
    handle: FrameBridgeSurfaceHandle,
    x: f32,
    y: f32,
    w: f32,
    h: f32,
    rgba: u32,
) {
    push(
        &handle,
        DisplayItem::Rect {
            x,
            y,
            w,
            h,
            color: unpack(rgba),
        },
    );
}

#[no_mangle]
pub extern "C" fn frame_bridge_surface_resize(handle: FrameBridgeSurfaceHandle, width: u32, height: u32, scale: f32) -> bool {
    match surface_ref(&handle) {
        Some(s) => s.surface.resize(width, height, scale).is_ok(),
        None => false,
    }
}

/// Id of the latest frame the host was notified about, 0 before the first.
#[no_mangle]
pub extern "C" fn frame_bridge_surface_frame_id(handle: FrameBridgeSurfaceHandle) -> u64 {
    surface_ref(&handle).map_or(0, |s| s.surface.last_frame_id())
}

/// Copies the latest frame into `output` and stores its size. Returns the
/// number of bytes written, or 0 if there is no frame or `output` is too small.
#[no_mangle]
pub extern "C" fn frame_bridge_surface_copy_pixels(
    handle: FrameBridgeSurfaceHandle,
    output: *mut u8,
    output_size: usize,
    width: *mut u32,
    height: *mut u32,
) -> usize {
    let Some(s) = surface_ref(&handle) else {
        return 0;
    };
    let Some(frame) = s.surface.external_handle() else {
        return 0;
    };
    let size = frame.size();
    let pixels = match frame {
        ExternalHandle::SharedResource { handle, .. } => match read_shared(s, &handle) {
            Some(pixels) => pixels,
            None => return 0,
        },
        ExternalHandle::CpuPixels(buffer) => buffer.pixels.clone(),
    };

    if output.is_null() || output_size < pixels.len() {
        return 0;
    }
    unsafe {
        std::ptr::copy_nonoverlapping(pixels.as_ptr(), output, pixels.len());
        if !width.is_null() {
            *width = size.width;
        }
        if !height.is_null() {
            *height = size.height;
        }
    }
    pixels.len()
}

/// Destroys the surface and frees the handle.
#[no_mangle]
pub extern "C" fn frame_bridge_surface_free(handle: FrameBridgeSurfaceHandle) {
    if !handle.0.is_null() {
        unsafe {
            let _ = Box::from_raw(handle.0);
        }
    }
}
