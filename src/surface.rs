//! Surface data model: identifiers, descriptors, pixel layout and the
//! producer-side render surface.

use crate::errors::TransportError;
use crate::render::{FramebufferId, RenderbufferId, TextureId, Viewport};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use uuid::Uuid;

/// Bytes per pixel of every surface. The format is fixed at four 8-bit channels.
pub const BYTES_PER_PIXEL: usize = 4;

/// Unique identifier of a surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SurfaceId(Uuid);

impl SurfaceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SurfaceId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for SurfaceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Byte order of the four channels of a pixel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelOrder {
    #[default]
    Rgba,
    Bgra,
}

impl ChannelOrder {
    /// Converts one pixel from `self` to `to`.
    #[inline]
    pub fn convert(self, to: ChannelOrder, px: [u8; 4]) -> [u8; 4] {
        if self == to {
            px
        } else {
            // Rgba <-> Bgra is the same swap in both directions.
            [px[2], px[1], px[0], px[3]]
        }
    }

    /// Converts a tightly packed row of pixels in place.
    pub fn convert_row(self, to: ChannelOrder, row: &mut [u8]) {
        if self == to {
            return;
        }
        for px in row.chunks_exact_mut(BYTES_PER_PIXEL) {
            px.swap(0, 2);
        }
    }
}

/// Which row of a buffer is stored first.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Origin {
    /// Row 0 is the top of the image. Compositors and most 2D APIs.
    #[default]
    TopLeft,
    /// Row 0 is the bottom of the image. OpenGL-style framebuffers.
    BottomLeft,
}

/// Four-channel 8-bit pixel format. Only the channel order varies.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct PixelFormat {
    pub order: ChannelOrder,
}

impl PixelFormat {
    pub fn rgba8() -> Self {
        Self { order: ChannelOrder::Rgba }
    }

    pub fn bgra8() -> Self {
        Self { order: ChannelOrder::Bgra }
    }
}

/// Size of a surface in physical pixels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SurfaceSize {
    pub width: u32,
    pub height: u32,
}

impl SurfaceSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Number of bytes of a tightly packed buffer of this size.
    pub fn byte_len(&self) -> usize {
        self.width as usize * self.height as usize * BYTES_PER_PIXEL
    }

    /// Row stride in bytes of a tightly packed buffer.
    pub fn stride(&self) -> usize {
        self.width as usize * BYTES_PER_PIXEL
    }
}

impl Display for SurfaceSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Immutable description of a surface. A resize produces a new descriptor.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SurfaceDescriptor {
    size: SurfaceSize,
    scale: f32,
    format: PixelFormat,
}

impl SurfaceDescriptor {
    /// Validates and creates a descriptor.
    ///
    /// Zero dimensions and non-finite or non-positive scale factors are rejected
    /// with [`TransportError::InvalidDimensions`].
    pub fn new(width: u32, height: u32, scale: f32) -> Result<Self, TransportError> {
        validate_dimensions(width, height, scale)?;
        Ok(Self {
            size: SurfaceSize::new(width, height),
            scale,
            format: PixelFormat::default(),
        })
    }

    pub fn with_format(mut self, format: PixelFormat) -> Self {
        self.format = format;
        self
    }

    pub fn width(&self) -> u32 {
        self.size.width
    }

    pub fn height(&self) -> u32 {
        self.size.height
    }

    pub fn size(&self) -> SurfaceSize {
        self.size
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Returns the descriptor that supersedes this one after a resize.
    pub fn resized(&self, width: u32, height: u32, scale: f32) -> Result<Self, TransportError> {
        Ok(Self::new(width, height, scale)?.with_format(self.format))
    }
}

pub(crate) fn validate_dimensions(width: u32, height: u32, scale: f32) -> Result<(), TransportError> {
    if width == 0 || height == 0 || !scale.is_finite() || scale <= 0.0 {
        return Err(TransportError::InvalidDimensions { width, height, scale });
    }
    Ok(())
}

/// Depth/stencil attachment format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DepthStencilFormat {
    Depth24Stencil8,
    Depth16Stencil8,
    Depth16,
}

/// One rung of the progressive relaxation ladder.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SurfaceConfig {
    pub label: &'static str,
    pub depth_stencil: Option<DepthStencilFormat>,
    /// Last resort: only ask for something renderable, no depth and no stencil.
    pub renderable_only: bool,
}

impl SurfaceConfig {
    pub const D24S8: SurfaceConfig = SurfaceConfig {
        label: "D24S8",
        depth_stencil: Some(DepthStencilFormat::Depth24Stencil8),
        renderable_only: false,
    };
    pub const D16S8: SurfaceConfig = SurfaceConfig {
        label: "D16S8",
        depth_stencil: Some(DepthStencilFormat::Depth16Stencil8),
        renderable_only: false,
    };
    pub const D16: SurfaceConfig = SurfaceConfig {
        label: "D16S0",
        depth_stencil: Some(DepthStencilFormat::Depth16),
        renderable_only: false,
    };
    pub const NO_DEPTH: SurfaceConfig = SurfaceConfig {
        label: "D0S0",
        depth_stencil: None,
        renderable_only: false,
    };
    pub const RENDERABLE_ONLY: SurfaceConfig = SurfaceConfig {
        label: "minimal",
        depth_stencil: None,
        renderable_only: true,
    };

    /// Configurations in the order they are attempted, strictest first.
    pub const LADDER: [SurfaceConfig; 5] = [
        Self::D24S8,
        Self::D16S8,
        Self::D16,
        Self::NO_DEPTH,
        Self::RENDERABLE_ONLY,
    ];

    /// The rungs from `self` downwards.
    pub fn ladder_from(self) -> &'static [SurfaceConfig] {
        let start = Self::LADDER.iter().position(|c| *c == self).unwrap_or(0);
        &Self::LADDER[start..]
    }
}

impl Display for SurfaceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label)
    }
}

/// The producer's offscreen render target.
///
/// The framebuffer and attachment ids stay the same for the lifetime of the
/// surface. Resizes reallocate storage behind them.
#[derive(Debug, Clone)]
pub struct RenderSurface {
    pub(crate) descriptor: SurfaceDescriptor,
    pub(crate) framebuffer: FramebufferId,
    pub(crate) color: TextureId,
    pub(crate) depth_stencil: Option<RenderbufferId>,
    pub(crate) config: SurfaceConfig,
    pub(crate) rendered: Viewport,
    pub(crate) reallocations: u64,
}

impl RenderSurface {
    pub fn descriptor(&self) -> &SurfaceDescriptor {
        &self.descriptor
    }

    pub fn size(&self) -> SurfaceSize {
        self.descriptor.size()
    }

    pub fn framebuffer(&self) -> FramebufferId {
        self.framebuffer
    }

    pub fn color(&self) -> TextureId {
        self.color
    }

    pub fn depth_stencil(&self) -> Option<RenderbufferId> {
        self.depth_stencil
    }

    pub fn config(&self) -> SurfaceConfig {
        self.config
    }

    /// The region the renderer last drew, clamped to the surface.
    pub fn rendered(&self) -> Viewport {
        self.rendered
    }

    pub(crate) fn set_rendered(&mut self, viewport: Viewport) {
        self.rendered = viewport.clamp_to(self.size());
    }

    /// How many times attachment storage has been reallocated.
    pub fn reallocations(&self) -> u64 {
        self.reallocations
    }
}
