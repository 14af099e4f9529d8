use super::*;
use crate::render::backends::soft::{GpuCompletion, SoftDeviceOptions, SoftHostView, SoftInteropOptions, SoftPlatform};
use crate::render::{AdapterInfo, SharedSurfaceReader, SyncAcquire, SyncMode};
use crate::renderer::{Color, DisplayItem, DrawTarget, Quadrants, RenderList, SolidColor};
use crate::surface::{DepthStencilFormat, SurfaceSize};
use crate::transport::{InteropAttachment, Tier};
use std::sync::mpsc;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(5);

fn config() -> TransportConfig {
    TransportConfig::builder()
        .keep_alive_frames(0)
        .frame_interval_ms(2)
        .build()
        .unwrap()
}

fn session() -> TransportSession {
    TransportSession::new(Some(config()))
}

fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(2));
    }
}

/// The latest frame as the host would composite it.
fn host_frame(surface: &SurfaceHandle, host: &SoftHostView) -> (Vec<u8>, SurfaceSize) {
    let mut frame = None;
    wait_until("a readable frame", || {
        frame = match surface.external_handle() {
            Some(ExternalHandle::SharedResource {
                handle, width, height, ..
            }) => host.read(&handle).ok().map(|px| (px, SurfaceSize::new(width, height))),
            Some(ExternalHandle::CpuPixels(buffer)) => Some((buffer.pixels.clone(), buffer.size())),
            None => None,
        };
        frame.is_some()
    });
    frame.unwrap()
}

fn px(frame: &[u8], size: SurfaceSize, x: u32, y: u32) -> [u8; 4] {
    let o = y as usize * size.stride() + x as usize * 4;
    [frame[o], frame[o + 1], frame[o + 2], frame[o + 3]]
}

fn bgra(color: Color) -> [u8; 4] {
    let [r, g, b, a] = color.to_rgba8();
    [b, g, r, a]
}

fn assert_quadrants(frame: &[u8], size: SurfaceSize) {
    let (w, h) = (size.width, size.height);
    for (x, y) in [(0, 0), (w - 1, 0), (0, h - 1), (w - 1, h - 1), (w / 2 - 1, h / 2 - 1), (w / 2, h / 2)] {
        assert_eq!(px(frame, size, x, y), bgra(Quadrants::expected(x, y, w, h)), "pixel ({x}, {y})");
    }
}

/// Waits until `frame_id` was notified and is what the host samples.
fn wait_for_frame(surface: &SurfaceHandle, frame_id: u64) {
    wait_until(&format!("frame {frame_id}"), || {
        surface.last_frame_id() >= frame_id && surface.external_handle().is_some_and(|h| h.frame_id() >= frame_id)
    });
}

/// The host never sees a frame it was not notified about.
fn assert_visible_only_when_notified(surface: &SurfaceHandle) {
    let visible = surface.external_handle().map_or(0, |h| h.frame_id());
    let notified = surface.frames_notified();
    assert!(visible <= notified, "frame {visible} visible with {notified} notified");
}

async fn next_event(rx: &mut broadcast::Receiver<TransportEvent>) -> TransportEvent {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("no event in time")
        .expect("event bus closed")
}

fn drain(rx: &mut broadcast::Receiver<TransportEvent>) -> Vec<TransportEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Blocks in every draw until the test lets it go.
struct Gated {
    entered: mpsc::Sender<()>,
    proceed: mpsc::Receiver<()>,
}

impl FrameRenderer for Gated {
    fn draw(&mut self, target: &mut DrawTarget<'_>) -> anyhow::Result<()> {
        let _ = self.entered.send(());
        let _ = self.proceed.recv_timeout(WAIT);
        target.clear(Color::from_u8(0, 0, 0, 255))?;
        Ok(())
    }
}

#[tokio::test]
async fn interop_surface_delivers_first_frame() {
    let session = session();
    let mut events = session.subscribe();
    let (platform, handles) = SoftPlatform::new().with_interop(SoftInteropOptions::default()).build();

    let surface = session
        .create_surface(800, 600, 1.0, platform, Quadrants::new())
        .await
        .unwrap();
    assert_eq!(
        surface.active_tier(),
        Some(TransportCapability::CrossApiInterop(InteropAttachment::Texture))
    );

    assert!(matches!(next_event(&mut events).await, TransportEvent::SurfaceCreated { width: 800, height: 600, .. }));
    assert!(matches!(
        next_event(&mut events).await,
        TransportEvent::TierNegotiated {
            capability: TransportCapability::CrossApiInterop(_),
            ..
        }
    ));
    match next_event(&mut events).await {
        TransportEvent::FrameAvailable(info) => {
            assert_eq!(info.frame_id, 1);
            assert_eq!((info.width, info.height), (800, 600));
            assert_eq!(info.surface_id, surface.surface_id());
        }
        other => panic!("unexpected {other:?}"),
    }

    let (frame, size) = host_frame(&surface, &handles.host);
    assert_eq!(size, SurfaceSize::new(800, 600));
    assert_quadrants(&frame, size);
    assert!(surface.pixel_buffer().is_none());
    assert!(surface.shared_resource_handle().is_some());
}

#[test]
fn cpu_fallback_without_interop() {
    let session = session();
    let (platform, handles) = SoftPlatform::new().build();
    let surface = session.create_surface_blocking(800, 600, 1.0, platform, Quadrants::new()).unwrap();
    assert_eq!(surface.active_tier(), Some(TransportCapability::CpuMediated));

    wait_for_frame(&surface, 1);
    let buffer = surface.pixel_buffer().unwrap();
    assert_eq!((buffer.width, buffer.height), (800, 600));
    assert_eq!(buffer.stride, 800 * 4);
    assert_eq!(buffer.pixels.len(), 800 * 600 * 4);
    assert_eq!(buffer.order, crate::surface::ChannelOrder::Bgra);
    assert_eq!(buffer.frame_id, 1);

    let (frame, size) = host_frame(&surface, &handles.host);
    assert_quadrants(&frame, size);
    assert!(surface.shared_resource_handle().is_none());
}

#[test]
fn tiers_produce_identical_pixels() {
    let platforms = [
        SoftPlatform::new().with_native(),
        SoftPlatform::new().with_interop(SoftInteropOptions::default()),
        SoftPlatform::new(),
    ];
    let mut frames = Vec::new();
    let mut tiers = Vec::new();
    for platform in platforms {
        let session = session();
        let (platform, handles) = platform.build();
        let surface = session.create_surface_blocking(64, 48, 1.0, platform, Quadrants::new()).unwrap();
        wait_for_frame(&surface, 1);
        tiers.push(surface.active_tier().unwrap().tier());
        frames.push(host_frame(&surface, &handles.host));
    }

    assert_eq!(tiers, vec![Tier::NativeSharedMemory, Tier::CrossApiInterop, Tier::CpuMediated]);
    assert_eq!(frames[0], frames[1]);
    assert_eq!(frames[1], frames[2]);
    assert_quadrants(&frames[0].0, frames[0].1);
}

#[test]
fn resize_requests_coalesce() {
    let session = session();
    let mut events = session.subscribe();
    let (platform, handles) = SoftPlatform::new().with_interop(SoftInteropOptions::default()).build();
    let (entered_tx, entered_rx) = mpsc::channel();
    let (proceed_tx, proceed_rx) = mpsc::channel();
    let renderer = Gated {
        entered: entered_tx,
        proceed: proceed_rx,
    };
    let surface = session.create_surface_blocking(100, 100, 1.0, platform, renderer).unwrap();

    // Frame 1 is being drawn; none of these can be applied before it finishes.
    entered_rx.recv_timeout(WAIT).unwrap();
    let generations: Vec<u64> = (1..=10)
        .map(|i| surface.resize(100 + i * 10, 100 + i * 5, 1.0).unwrap())
        .collect();
    assert!(generations.windows(2).all(|w| w[0] < w[1]));
    proceed_tx.send(()).unwrap();

    entered_rx.recv_timeout(WAIT).unwrap();
    proceed_tx.send(()).unwrap();
    wait_for_frame(&surface, 2);

    let diagnostics = surface.diagnostics();
    assert_eq!(diagnostics.resizes_applied, 1);
    assert_eq!(diagnostics.surface, SurfaceSize::new(200, 150));
    assert_eq!(surface.external_handle().unwrap().size(), SurfaceSize::new(200, 150));
    assert_eq!(handles.host.live_resources(), 1);

    let applied: Vec<u64> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            TransportEvent::ResizeApplied { generation, .. } => Some(generation),
            _ => None,
        })
        .collect();
    assert_eq!(applied, vec![*generations.last().unwrap()]);

    drop(proceed_tx);
    surface.destroy_surface();
}

#[test]
fn partial_render_is_top_left_and_cleared_elsewhere() {
    for platform in [SoftPlatform::new().with_interop(SoftInteropOptions::default()), SoftPlatform::new()] {
        let session = session();
        let (platform, handles) = platform.build();
        let mut list = RenderList::new();
        list.add_command(DisplayItem::Viewport { width: 32, height: 24 });
        list.add_command(DisplayItem::Clear {
            color: Color::from_u8(255, 0, 0, 255),
        });

        let surface = session.create_surface_blocking(64, 48, 1.0, platform, list).unwrap();
        wait_for_frame(&surface, 1);
        let (frame, size) = host_frame(&surface, &handles.host);
        assert_eq!(size, SurfaceSize::new(64, 48));

        let red = [0, 0, 255, 255];
        assert_eq!(px(&frame, size, 0, 0), red);
        assert_eq!(px(&frame, size, 31, 23), red);
        assert_eq!(px(&frame, size, 32, 0), [0; 4]);
        assert_eq!(px(&frame, size, 0, 24), [0; 4]);
        assert_eq!(px(&frame, size, 63, 47), [0; 4]);

        let diagnostics = surface.diagnostics();
        assert_eq!(diagnostics.rendered, SurfaceSize::new(32, 24));
        assert!(diagnostics.size_mismatch());
    }
}

#[test]
fn notifies_only_after_gpu_completion() {
    let session = session();
    let device = SoftDeviceOptions {
        completion: GpuCompletion::Deferred(Duration::from_millis(50)),
        ..Default::default()
    };
    let (platform, handles) = SoftPlatform::new()
        .with_device(device)
        .with_interop(SoftInteropOptions::default())
        .build();
    let surface = session.create_surface_blocking(32, 32, 1.0, platform, SolidColor::new(Color::TRANSPARENT)).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let timeline = handles.timeline.clone();
    let record = seen.clone();
    surface.on_frame_available(move |info| {
        record.lock().unwrap().push((info.frame_id, timeline.is_signaled(info.fence)));
    });

    // Frame 1 is transferred but its fence is still pending.
    wait_until("a presented frame", || {
        assert_visible_only_when_notified(&surface);
        surface.diagnostics().frames_presented >= 1
    });
    if surface.frames_notified() == 0 {
        assert!(surface.external_handle().is_none());
    }

    wait_until("frame 1", || {
        assert_visible_only_when_notified(&surface);
        surface.last_frame_id() >= 1
    });
    surface.invalidate();
    wait_until("frame 2", || {
        assert_visible_only_when_notified(&surface);
        surface.external_handle().is_some_and(|h| h.frame_id() >= 2)
    });
    assert!(handles.timeline.completed() >= 2);

    let seen = seen.lock().unwrap().clone();
    assert!(!seen.is_empty());
    assert!(seen.iter().all(|(_, signaled)| *signaled));
    assert!(seen.windows(2).all(|w| w[0].0 < w[1].0));
}

#[test]
fn blit_failure_downgrades_to_cpu_next_frame() {
    let session = session();
    let mut events = session.subscribe();
    let (platform, handles) = SoftPlatform::new().with_interop(SoftInteropOptions::default()).build();
    let surface = session.create_surface_blocking(64, 48, 1.0, platform, Quadrants::new()).unwrap();
    wait_for_frame(&surface, 1);

    handles.faults.set_fail_blits(true);
    surface.invalidate();
    wait_until("downgrade", || surface.active_tier() == Some(TransportCapability::CpuMediated));
    wait_for_frame(&surface, 2);

    let buffer = surface.pixel_buffer().unwrap();
    assert_eq!(buffer.frame_id, 2);
    assert_quadrants(&buffer.pixels, buffer.size());
    assert_eq!(handles.host.live_resources(), 0);
    assert_eq!(surface.diagnostics().downgrades, 1);

    let downgraded = drain(&mut events).into_iter().find_map(|e| match e {
        TransportEvent::TierDowngraded { from, to, .. } => Some((from, to)),
        _ => None,
    });
    assert_eq!(
        downgraded,
        Some((
            TransportCapability::CrossApiInterop(InteropAttachment::Texture),
            TransportCapability::CpuMediated
        ))
    );
}

#[test]
fn keyed_mutex_waits_for_the_host_to_hand_back() {
    let config = TransportConfig::builder()
        .keep_alive_frames(0)
        .frame_interval_ms(2)
        .sync_mode(SyncMode::KeyedMutex)
        .sync_timeout_ms(20)
        .build()
        .unwrap();
    let session = TransportSession::new(Some(config));
    let (platform, handles) = SoftPlatform::new().with_interop(SoftInteropOptions::default()).build();
    let surface = session.create_surface_blocking(16, 16, 1.0, platform, Quadrants::new()).unwrap();
    wait_for_frame(&surface, 1);
    assert_eq!(surface.diagnostics().sync_mode, Some(SyncMode::KeyedMutex));

    // The host still owns frame 1, so frame 2 times out and is skipped.
    surface.invalidate();
    wait_until("a skipped frame", || surface.diagnostics().frames_skipped > 0);
    assert_eq!(surface.last_frame_id(), 1);

    let handle = surface.shared_resource_handle().unwrap();
    let token = handle.sync.unwrap();
    assert_eq!(
        handles.host.acquire(&handle, token.consumer_key, WAIT).unwrap(),
        SyncAcquire::Acquired
    );
    let frame = handles.host.read(&handle).unwrap();
    assert_quadrants(&frame, handle.size);
    handles.host.release(&handle, token.producer_key).unwrap();

    wait_for_frame(&surface, 2);
}

#[tokio::test]
async fn device_loss_reports_surface_lost() {
    let session = session();
    let (platform, handles) = SoftPlatform::new().with_interop(SoftInteropOptions::default()).build();
    let surface = session
        .create_surface(32, 32, 1.0, platform, Quadrants::new())
        .await
        .unwrap();
    wait_for_frame(&surface, 1);
    let mut events = surface.subscribe();

    handles.faults.lose_device();
    surface.invalidate();
    loop {
        if let TransportEvent::SurfaceLost { surface_id, .. } = next_event(&mut events).await {
            assert_eq!(surface_id, surface.surface_id());
            break;
        }
    }
    assert!(surface.is_lost());
    assert_eq!(surface.last_frame_id(), 1);

    surface.destroy_surface();
    assert_eq!(handles.host.live_resources(), 0);
}

#[test]
fn adapter_mismatch_uses_cpu_copy() {
    let session = session();
    let interop = SoftInteropOptions {
        adapter: AdapterInfo::new("Discrete GPU", "other-vendor"),
        ..Default::default()
    };
    let (platform, handles) = SoftPlatform::new().with_interop(interop).build();
    let surface = session.create_surface_blocking(32, 32, 1.0, platform, Quadrants::new()).unwrap();
    assert_eq!(surface.active_tier(), Some(TransportCapability::CpuMediated));
    wait_for_frame(&surface, 1);
    assert_eq!(handles.host.live_resources(), 0);
}

#[test]
fn refused_texture_uses_renderbuffer_attachment() {
    let session = session();
    let interop = SoftInteropOptions {
        accept_texture: false,
        ..Default::default()
    };
    let (platform, handles) = SoftPlatform::new().with_interop(interop).build();
    let surface = session.create_surface_blocking(32, 32, 1.0, platform, Quadrants::new()).unwrap();
    assert_eq!(
        surface.active_tier(),
        Some(TransportCapability::CrossApiInterop(InteropAttachment::Renderbuffer))
    );
    wait_for_frame(&surface, 1);
    let (frame, size) = host_frame(&surface, &handles.host);
    assert_quadrants(&frame, size);
}

#[test]
fn depth_stencil_is_relaxed_until_allocatable() {
    let session = session();
    let device = SoftDeviceOptions {
        rejected_depth_formats: vec![DepthStencilFormat::Depth24Stencil8, DepthStencilFormat::Depth16Stencil8],
        ..Default::default()
    };
    let (platform, handles) = SoftPlatform::new().with_device(device).build();
    let surface = session.create_surface_blocking(32, 32, 1.0, platform, Quadrants::new()).unwrap();
    wait_for_frame(&surface, 1);
    let (frame, size) = host_frame(&surface, &handles.host);
    assert_quadrants(&frame, size);
    assert!(surface.diagnostics().negotiation_attempts >= 1);
}

#[test]
fn incomplete_resize_downgrades_and_retries() {
    let session = session();
    let (platform, handles) = SoftPlatform::new().with_interop(SoftInteropOptions::default()).build();
    let surface = session.create_surface_blocking(32, 32, 1.0, platform, Quadrants::new()).unwrap();
    wait_for_frame(&surface, 1);

    handles.faults.fail_next_completeness_checks(1);
    surface.resize(64, 48, 1.0).unwrap();
    wait_until("resize on the lower tier", || {
        surface.pixel_buffer().map(|b| b.size()) == Some(SurfaceSize::new(64, 48))
    });

    assert_eq!(surface.active_tier(), Some(TransportCapability::CpuMediated));
    let buffer = surface.pixel_buffer().unwrap();
    assert_quadrants(&buffer.pixels, buffer.size());
    assert_eq!(handles.host.live_resources(), 0);
}

#[test]
fn teardown_releases_everything_once() {
    let session = session();
    let mut events = session.subscribe();
    let (platform, handles) = SoftPlatform::new().with_interop(SoftInteropOptions::default()).build();
    let surface = session.create_surface_blocking(32, 32, 1.0, platform, Quadrants::new()).unwrap();
    wait_for_frame(&surface, 1);
    assert_eq!(handles.host.live_resources(), 1);

    surface.destroy_surface();
    assert_eq!(handles.host.live_resources(), 0);
    assert!(surface.external_handle().is_none());
    assert!(matches!(surface.resize(64, 64, 1.0), Err(TransportError::SurfaceDestroyed)));

    surface.destroy_surface();
    let destroyed = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, TransportEvent::SurfaceDestroyed { .. }))
        .count();
    assert_eq!(destroyed, 1);
}

#[test]
fn context_creation_failure_is_reported() {
    let session = session();
    let device = SoftDeviceOptions {
        fail_creation: true,
        ..Default::default()
    };
    let (platform, _handles) = SoftPlatform::new().with_device(device).build();
    let created = session.create_surface_blocking(32, 32, 1.0, platform, Quadrants::new());
    assert!(matches!(created, Err(TransportError::ContextCreationFailure(_))));
}

#[test]
fn invalid_dimensions_are_rejected_up_front() {
    let session = session();
    let (platform, _handles) = SoftPlatform::new().build();
    let created = session.create_surface_blocking(0, 600, 1.0, platform, Quadrants::new());
    assert!(matches!(created, Err(TransportError::InvalidDimensions { width: 0, .. })));

    let (platform, _handles) = SoftPlatform::new().build();
    let surface = session.create_surface_blocking(8, 8, 1.0, platform, Quadrants::new()).unwrap();
    assert!(matches!(surface.resize(8, 8, f32::NAN), Err(TransportError::InvalidDimensions { .. })));
}

#[test]
fn keep_alive_requests_a_bounded_number_of_frames() {
    let config = TransportConfig::builder()
        .keep_alive_frames(3)
        .frame_interval_ms(2)
        .build()
        .unwrap();
    let session = TransportSession::new(Some(config));
    let (platform, _handles) = SoftPlatform::new().build();
    let renderer = SolidColor::new(Color::from_u8(10, 20, 30, 255));
    let stats = renderer.stats();
    let surface = session.create_surface_blocking(8, 8, 1.0, platform, renderer).unwrap();

    wait_until("keep-alive frames", || stats.active_requests() == 3);
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(stats.active_requests(), 3);
    assert_eq!(stats.draws(), 3);
    assert_eq!(surface.last_frame_id(), 3);
}

#[test]
fn renderer_hears_about_resizes() {
    let session = session();
    let (platform, _handles) = SoftPlatform::new().build();
    let renderer = Quadrants::new();
    let stats = renderer.stats();
    let surface = session.create_surface_blocking(16, 16, 1.0, platform, renderer).unwrap();
    wait_for_frame(&surface, 1);

    surface.resize(40, 20, 2.0).unwrap();
    wait_until("resized frame", || {
        surface.pixel_buffer().map(|b| b.size()) == Some(SurfaceSize::new(40, 20))
    });
    assert_eq!(stats.resizes(), vec![(40, 20, 2.0)]);
}

#[test]
fn dispatcher_runs_callbacks_on_the_host_thread() {
    let session = session();
    let (platform, _handles) = SoftPlatform::new().build();
    let surface = session.create_surface_blocking(8, 8, 1.0, platform, Quadrants::new()).unwrap();

    let (jobs_tx, jobs_rx) = mpsc::channel::<Box<dyn FnOnce() + Send>>();
    let jobs_tx = Mutex::new(jobs_tx);
    surface.set_dispatcher(move |job| {
        let _ = jobs_tx.lock().unwrap().send(job);
    });
    let ran_on = Arc::new(Mutex::new(None));
    let record = ran_on.clone();
    surface.on_frame_available(move |_| {
        *record.lock().unwrap() = Some(std::thread::current().id());
    });
    surface.invalidate();

    let job = jobs_rx.recv_timeout(WAIT).unwrap();
    job();
    assert_eq!(*ran_on.lock().unwrap(), Some(std::thread::current().id()));
}

#[test]
fn overlay_follows_configuration() {
    let session = session();
    let (platform, _handles) = SoftPlatform::new().build();
    let surface = session.create_surface_blocking(8, 8, 1.0, platform, Quadrants::new()).unwrap();
    wait_for_frame(&surface, 1);
    let lines = surface.overlay_lines();
    assert!(lines.iter().any(|l| l == "Renderer: soft"));
    assert!(lines.iter().any(|l| l == "Transfer: cpu copy"));

    let quiet = TransportConfig::builder().overlay_enabled(false).build().unwrap();
    let session = TransportSession::new(Some(quiet));
    let (platform, _handles) = SoftPlatform::new().build();
    let surface = session.create_surface_blocking(8, 8, 1.0, platform, Quadrants::new()).unwrap();
    assert!(surface.overlay_lines().is_empty());
}
