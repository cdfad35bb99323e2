//! Shared value types used across the crate.

use std::fmt;

use strum::{Display, EnumIs};

/// An opaque identifier for a connector reported by the display hardware.
///
/// Identifiers are stable for as long as the connector exists; a connector
/// that is unplugged and replugged may come back under a new identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectorId(pub(crate) u32);

impl fmt::Display for ConnectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An opaque RGB color, 8 bits per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Color {
    /// Red channel.
    pub r: u8,
    /// Green channel.
    pub g: u8,
    /// Blue channel.
    pub b: u8,
}

impl Color {
    /// Creates a new color from its channels.
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Solid black.
    pub const BLACK: Color = Color::new(0, 0, 0);
    /// Solid white.
    pub const WHITE: Color = Color::new(255, 255, 255);
}

/// A rectangle in framebuffer coordinates, origin at the top left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    /// Horizontal offset of the top-left corner.
    pub x: u32,
    /// Vertical offset of the top-left corner.
    pub y: u32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Rect {
    /// Creates a new rectangle.
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }
}

/// The pixel format of a [`VideoBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferFormat {
    /// 32 bits per pixel, byte order B, G, R, X in memory.
    Xrgb8888,
    /// 8-bit single-channel data, used as blend coverage.
    Grey8,
}

/// A borrowed view of client pixel data handed to the rendering entry
/// points.
///
/// `stride` is in bytes and may be larger than `width` times the pixel
/// size; rows beyond the stated dimensions are never read.
#[derive(Debug, Clone, Copy)]
pub struct VideoBuffer<'a> {
    /// Pixel format of `data`.
    pub format: BufferFormat,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Distance between the starts of consecutive rows, in bytes.
    pub stride: u32,
    /// The pixel data itself.
    pub data: &'a [u8],
}

/// One software-compositing request: blend `coverage` between `fg` and
/// `bg` at the given position.
///
/// The coverage buffer must be [`BufferFormat::Grey8`]; 0 selects the
/// background, 255 the foreground.
#[derive(Debug, Clone, Copy)]
pub struct BlendRequest<'a> {
    /// Per-pixel coverage values.
    pub coverage: VideoBuffer<'a>,
    /// Horizontal position of the request in the target.
    pub x: u32,
    /// Vertical position of the request in the target.
    pub y: u32,
    /// Foreground color.
    pub fg: Color,
    /// Background color.
    pub bg: Color,
}

/// Display power-management state, in decreasing order of liveliness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumIs)]
pub enum DpmsState {
    /// Fully on.
    #[default]
    On,
    /// Blanked, fast recovery.
    Standby,
    /// Blanked, slower recovery.
    Suspend,
    /// Powered down.
    Off,
}

/// The backend variant driving a video object, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIs)]
pub enum BackendKind {
    /// The GPU-accelerated path.
    Gpu,
    /// The minimal dumb-buffer path.
    Dumb,
    /// The in-memory dummy path.
    Dummy,
}
