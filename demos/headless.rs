use frame_bridge::config::TransportConfig;
use frame_bridge::events::TransportEvent;
use frame_bridge::render::backends::soft::{SoftInteropOptions, SoftPlatform};
use frame_bridge::render::{SharedSurfaceReader, SyncAcquire};
use frame_bridge::renderer::{Color, DisplayItem, RenderList};
use frame_bridge::surface::ChannelOrder;
use frame_bridge::transport::ExternalHandle;
use frame_bridge::TransportSession;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let out = std::env::args().nth(1).unwrap_or_else(|| "frame.png".to_string());

    // Configure the session. Environment overrides (FRAME_BRIDGE_MAX_TIER and
    // friends) still apply on top of what the builder sets.
    let config = TransportConfig::builder()
        .keep_alive_frames(10)
        .build()?
        .with_env_overrides();
    let session = TransportSession::new(Some(config));

    // Receive everything the session's surfaces report from here on.
    let mut event_rx = session.subscribe();

    // The soft platform stands in for a real GPU: a producer device plus an
    // interop provider the host side can read back.
    let (platform, handles) = SoftPlatform::new().with_interop(SoftInteropOptions::default()).build();

    // A display list the host can keep editing while the surface renders it.
    let mut list = RenderList::new();
    list.add_command(DisplayItem::Clear {
        color: Color::from_u8(32, 32, 48, 255),
    });
    list.add_command(DisplayItem::Rect {
        x: 40.0,
        y: 30.0,
        w: 200.0,
        h: 120.0,
        color: Color::from_u8(230, 120, 20, 255),
    });
    let list = list.shared();

    let surface = session.create_surface(640, 480, 1.0, platform, list.clone()).await?;
    println!("surface {} on {:?}", surface.surface_id(), surface.active_tier());

    // Change the scene and the size once the first frame is out.
    let mut resized = false;
    let mut last_frame = 0;
    while let Ok(Ok(event)) = tokio::time::timeout(Duration::from_secs(2), event_rx.recv()).await {
        println!("event: {event}");
        if let TransportEvent::FrameAvailable(info) = event {
            last_frame = info.frame_id;
            if !resized {
                list.lock()
                    .map_err(|_| anyhow::anyhow!("display list poisoned"))?
                    .add_command(DisplayItem::Rect {
                        x: 300.0,
                        y: 200.0,
                        w: 100.0,
                        h: 100.0,
                        color: Color::from_u8(20, 200, 120, 255),
                    });
                surface.resize(800, 600, 1.25)?;
                resized = true;
            }
        }
    }
    println!("last frame {last_frame}");

    for line in surface.overlay_lines() {
        println!("  {line}");
    }

    // Sample the latest frame the way a compositor would.
    let Some(handle) = surface.external_handle() else {
        anyhow::bail!("no frame was published");
    };
    let size = handle.size();
    let (mut pixels, order) = match handle {
        ExternalHandle::SharedResource { handle, .. } => {
            // With the keyed mutex on, the host samples only while holding its key.
            if let Some(token) = handle.sync {
                let timeout = session.config().sync_timeout();
                if handles.host.acquire(&handle, token.consumer_key, timeout)? != SyncAcquire::Acquired {
                    anyhow::bail!("producer kept the frame for more than {:?}", timeout);
                }
            }
            let pixels = handles.host.read(&handle);
            if let Some(token) = handle.sync {
                handles.host.release(&handle, token.producer_key)?;
            }
            (pixels?, handle.order)
        }
        ExternalHandle::CpuPixels(buffer) => (buffer.pixels.clone(), buffer.order),
    };
    for px in pixels.chunks_exact_mut(4) {
        let rgba = order.convert(ChannelOrder::Rgba, [px[0], px[1], px[2], px[3]]);
        px.copy_from_slice(&rgba);
    }

    let file = std::io::BufWriter::new(std::fs::File::create(&out)?);
    let mut encoder = png::Encoder::new(file, size.width, size.height);
    encoder.set_color(png::ColorType::Rgba);
    encoder.set_depth(png::BitDepth::Eight);
    encoder.write_header()?.write_image_data(&pixels)?;
    println!("wrote {} ({})", out, size);

    surface.destroy_surface();
    Ok(())
}
