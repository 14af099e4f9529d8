//! Diagnostics snapshot and overlay text.

use crate::render::SyncMode;
use crate::surface::SurfaceSize;
use crate::transport::TransportCapability;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Diagnostics {
    /// Producer device name.
    pub renderer: String,
    pub capability: Option<TransportCapability>,
    pub sync_mode: Option<SyncMode>,
    pub surface: SurfaceSize,
    pub rendered: SurfaceSize,
    pub frames_presented: u64,
    pub frames_skipped: u64,
    pub downgrades: u32,
    pub resizes_applied: u64,
    pub negotiation_attempts: usize,
}

impl Diagnostics {
    pub fn size_mismatch(&self) -> bool {
        self.surface != self.rendered
    }

    /// One line per fact, for a host to print or draw over the frame.
    pub fn overlay_lines(&self) -> Vec<String> {
        let transfer = match self.capability {
            Some(TransportCapability::NativeSharedMemory) => "native shared surface".to_string(),
            Some(TransportCapability::CrossApiInterop(a)) => format!("interop ({a:?})").to_lowercase(),
            Some(TransportCapability::CpuMediated) => "cpu copy".to_string(),
            None => "none".to_string(),
        };
        let keyed = matches!(self.sync_mode, Some(SyncMode::KeyedMutex));

        vec![
            format!("Renderer: {}", self.renderer),
            format!("Transfer: {transfer}"),
            format!("Surface: {}", self.surface),
            format!("Rendered: {}", self.rendered),
            format!("Size mismatch: {}", if self.size_mismatch() { "yes" } else { "no" }),
            format!("Keyed mutex: {}", if keyed { "on" } else { "off" }),
            format!(
                "Frames: {} presented, {} skipped, {} downgrades",
                self.frames_presented, self.frames_skipped, self.downgrades
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InteropAttachment;

    #[test]
    fn overlay_reports_mismatch_and_mode() {
        let d = Diagnostics {
            renderer: "soft".into(),
            capability: Some(TransportCapability::CrossApiInterop(InteropAttachment::Renderbuffer)),
            sync_mode: Some(SyncMode::KeyedMutex),
            surface: SurfaceSize::new(1200, 900),
            rendered: SurfaceSize::new(800, 600),
            ..Default::default()
        };
        let lines = d.overlay_lines();
        assert_eq!(lines[1], "Transfer: interop (renderbuffer)");
        assert_eq!(lines[2], "Surface: 1200x900");
        assert_eq!(lines[4], "Size mismatch: yes");
        assert_eq!(lines[5], "Keyed mutex: on");
    }
}
