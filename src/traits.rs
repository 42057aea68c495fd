//! Core traits and types for the V4L2 buffer-exchange abstraction.

use std::fmt;
use std::time::Duration;

use crate::error::Result;

/// Pixel format representation (e.g., YUYV, Y16).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Create a new `FourCC` from a 4-byte array.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// Parse a four character code such as `"YUYV"`. Shorter codes are
    /// space padded, the way V4L2 spells `"Y16 "`.
    pub fn parse(code: &str) -> Option<Self> {
        let bytes = code.as_bytes();
        if bytes.is_empty() || bytes.len() > 4 || !code.is_ascii() {
            return None;
        }
        let mut repr = [b' '; 4];
        for (slot, byte) in repr.iter_mut().zip(bytes) {
            *slot = *byte;
        }
        Some(Self(repr))
    }

    /// YUYV pixel format (4:2:2 packed). Leopard USB3 bridges also report
    /// raw bayer payloads under this code.
    pub const YUYV: Self = Self::new(b"YUYV");
    /// 16-bit greyscale, used for unpacked RAW10/RAW12 sensors.
    pub const Y16: Self = Self::new(b"Y16 ");
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl From<v4l::FourCC> for FourCC {
    fn from(fourcc: v4l::FourCC) -> Self {
        Self(fourcc.repr)
    }
}

impl From<FourCC> for v4l::FourCC {
    fn from(fourcc: FourCC) -> Self {
        Self::new(&fourcc.0)
    }
}

/// Video format specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Format {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel format.
    pub fourcc: FourCC,
    /// Bytes per line (stride).
    pub stride: u32,
    /// Total frame size in bytes.
    pub size: u32,
}

impl Format {
    /// Create a new format specification.
    #[must_use]
    pub const fn new(width: u32, height: u32, fourcc: FourCC) -> Self {
        // YUYV and 16-bit raw are both 2 bytes per pixel
        let stride = width * 2;
        let size = stride * height;
        Self {
            width,
            height,
            fourcc,
            stride,
            size,
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}x{} (bytes per line {}, image size {})",
            self.fourcc, self.width, self.height, self.stride, self.size
        )
    }
}

/// Device capability flags.
#[derive(Debug, Clone, Default)]
pub struct DeviceCapabilities {
    /// Driver name.
    pub driver: String,
    /// Card/device name.
    pub card: String,
    /// Bus information.
    pub bus_info: String,
    /// Whether the device can capture video.
    pub can_capture: bool,
    /// Whether the device supports streaming.
    pub can_stream: bool,
}

/// Driver-side description of one buffer, as returned by a buffer request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo {
    /// Buffer index in the driver's pool.
    pub index: usize,
    /// Offset to pass to mmap.
    pub offset: u32,
    /// Length of the buffer in bytes.
    pub length: usize,
}

/// Metadata reported by the driver when a filled buffer is dequeued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMetadata {
    /// Index of the buffer holding the frame.
    pub index: usize,
    /// Frame sequence number.
    pub sequence: u32,
    /// Capture timestamp.
    pub timestamp: Duration,
    /// Actual bytes used in the frame buffer.
    pub bytes_used: u32,
}

/// Abstraction over the kernel capture driver's buffer-exchange protocol.
///
/// Implementations own the device handle. Mapped memory is returned as
/// [`VideoDriver::Mapping`] values that unmap themselves on drop, so the
/// caller decides when mappings end.
pub trait VideoDriver {
    /// Memory shared with the driver for one buffer.
    type Mapping: AsRef<[u8]> + AsMut<[u8]>;

    /// Get device capabilities.
    fn capabilities(&self) -> &DeviceCapabilities;

    /// Get current format.
    fn format(&self) -> Result<Format>;

    /// Set capture format. Returns the actual format set by the driver.
    fn negotiate_format(&mut self, requested: &Format) -> Result<Format>;

    /// Ask the driver for `count` buffers. The granted count may differ.
    fn request_buffers(&mut self, count: u32) -> Result<Vec<BufferInfo>>;

    /// Map one granted buffer into this process.
    fn map_buffer(&mut self, info: &BufferInfo) -> Result<Self::Mapping>;

    /// Put a buffer into the driver's incoming queue.
    fn queue_buffer(&mut self, index: usize) -> Result<()>;

    /// Block until the driver hands back a filled buffer.
    fn dequeue_buffer(&mut self) -> Result<FrameMetadata>;

    /// Switch streaming on or off.
    fn set_streaming(&mut self, on: bool) -> Result<()>;

    /// Tell the driver that no buffers are in use. All mappings must be
    /// dropped first.
    fn release_buffers(&mut self) -> Result<()>;
}
