//! Mock driver implementation for testing without hardware.

use std::cell::Cell;
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;
use std::time::Duration;

use crate::error::{CameraError, Result};
use crate::traits::{BufferInfo, DeviceCapabilities, Format, FourCC, FrameMetadata, VideoDriver};

/// Test pattern types for mock frame generation.
#[derive(Debug, Clone, Copy)]
pub enum TestPattern {
    /// SMPTE color bars pattern (YUYV).
    ColorBars,
    /// Horizontal gradient from dark to light (YUYV).
    Gradient,
    /// Solid color with specified Y, U, V values.
    Solid(u8, u8, u8),
    /// Solid gray whose luma encodes the buffer index: `32 * (index + 1)`.
    IndexedLuma,
    /// Flat 16-bit bayer samples of the given value.
    Bayer(u16),
}

/// Memory handed out by [`MockDriver::map_buffer`].
pub struct MockMapping {
    data: Vec<u8>,
    live: Rc<Cell<usize>>,
}

impl AsRef<[u8]> for MockMapping {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl AsMut<[u8]> for MockMapping {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for MockMapping {
    fn drop(&mut self) {
        self.live.set(self.live.get().saturating_sub(1));
    }
}

/// Mock driver for testing without hardware.
///
/// Enforces the queue protocol: double queueing, dequeueing with an empty
/// queue and dequeueing while not streaming are errors. Buffer contents are
/// generated once, at map time.
pub struct MockDriver {
    capabilities: DeviceCapabilities,
    format: Format,
    pattern: TestPattern,
    max_buffers: u32,
    granted: u32,
    fail_map_at: Option<usize>,
    fail_dequeue_at: Option<u32>,
    dequeue_calls: u32,
    queued: VecDeque<usize>,
    streaming: bool,
    sequence: u32,
    generation: u32,
    live: Rc<Cell<usize>>,
    release_count: u32,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDriver {
    /// Create a new mock driver with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            capabilities: DeviceCapabilities {
                driver: "mock".to_owned(),
                card: "Mock Camera".to_owned(),
                bus_info: "mock:0".to_owned(),
                can_capture: true,
                can_stream: true,
            },
            format: Format::new(64, 48, FourCC::YUYV),
            pattern: TestPattern::IndexedLuma,
            max_buffers: 8,
            granted: 0,
            fail_map_at: None,
            fail_dequeue_at: None,
            dequeue_calls: 0,
            queued: VecDeque::new(),
            streaming: false,
            sequence: 0,
            generation: 0,
            live: Rc::new(Cell::new(0)),
            release_count: 0,
        }
    }

    /// Set the format for this mock driver.
    #[must_use]
    pub fn with_format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    /// Set the pattern written into mapped buffers.
    #[must_use]
    pub fn with_pattern(mut self, pattern: TestPattern) -> Self {
        self.pattern = pattern;
        self
    }

    /// Grant at most `max` buffers per request.
    #[must_use]
    pub fn with_max_buffers(mut self, max: u32) -> Self {
        self.max_buffers = max;
        self
    }

    /// Make mapping the buffer at `index` fail.
    #[must_use]
    pub fn with_map_failure(mut self, index: usize) -> Self {
        self.fail_map_at = Some(index);
        self
    }

    /// Make the `call`-th dequeue (counting from zero) fail with `EIO`,
    /// leaving the queue untouched.
    #[must_use]
    pub fn with_dequeue_failure(mut self, call: u32) -> Self {
        self.fail_dequeue_at = Some(call);
        self
    }

    /// Number of mappings currently alive.
    pub fn live_mappings(&self) -> usize {
        self.live.get()
    }

    /// Buffers currently in the driver's incoming queue.
    pub fn queued(&self) -> Vec<usize> {
        self.queued.iter().copied().collect()
    }

    /// Whether streaming is on.
    pub const fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Buffers granted by the last request.
    pub const fn granted(&self) -> u32 {
        self.granted
    }

    /// Number of zero-count buffer requests seen.
    pub const fn release_count(&self) -> u32 {
        self.release_count
    }

    fn protocol_error(op: &'static str, msg: &str) -> CameraError {
        CameraError::driver(op, io::Error::new(io::ErrorKind::InvalidInput, msg.to_owned()))
    }
}

impl VideoDriver for MockDriver {
    type Mapping = MockMapping;

    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn format(&self) -> Result<Format> {
        Ok(self.format.clone())
    }

    fn negotiate_format(&mut self, requested: &Format) -> Result<Format> {
        self.format = Format::new(requested.width, requested.height, requested.fourcc);
        Ok(self.format.clone())
    }

    fn request_buffers(&mut self, count: u32) -> Result<Vec<BufferInfo>> {
        if self.streaming {
            return Err(Self::protocol_error("VIDIOC_REQBUFS", "busy while streaming"));
        }
        self.granted = count.min(self.max_buffers);
        self.generation += 1;
        let length = self.format.size as usize;
        Ok((0..self.granted as usize)
            .map(|index| BufferInfo {
                index,
                offset: self.generation * 0x10_0000 + (index * length) as u32,
                length,
            })
            .collect())
    }

    fn map_buffer(&mut self, info: &BufferInfo) -> Result<MockMapping> {
        if self.fail_map_at == Some(info.index) {
            return Err(CameraError::BufferMap {
                index: info.index,
                source: io::Error::from_raw_os_error(libc::ENOMEM),
            });
        }
        let mut data = generate_test_frame(&self.format, self.pattern, info.index);
        data.resize(info.length, 0);
        self.live.set(self.live.get() + 1);
        Ok(MockMapping {
            data,
            live: Rc::clone(&self.live),
        })
    }

    fn queue_buffer(&mut self, index: usize) -> Result<()> {
        if index >= self.granted as usize {
            return Err(Self::protocol_error("VIDIOC_QBUF", "index out of range"));
        }
        if self.queued.contains(&index) {
            return Err(Self::protocol_error("VIDIOC_QBUF", "buffer already queued"));
        }
        self.queued.push_back(index);
        Ok(())
    }

    fn dequeue_buffer(&mut self) -> Result<FrameMetadata> {
        if !self.streaming {
            return Err(Self::protocol_error("VIDIOC_DQBUF", "not streaming"));
        }
        let call = self.dequeue_calls;
        self.dequeue_calls += 1;
        if self.fail_dequeue_at == Some(call) {
            return Err(CameraError::driver(
                "VIDIOC_DQBUF",
                io::Error::from_raw_os_error(libc::EIO),
            ));
        }
        let index = self
            .queued
            .pop_front()
            .ok_or_else(|| Self::protocol_error("VIDIOC_DQBUF", "no buffer queued"))?;

        let sequence = self.sequence;
        self.sequence += 1;

        Ok(FrameMetadata {
            index,
            sequence,
            timestamp: Duration::from_millis(u64::from(sequence) * 33), // ~30fps
            bytes_used: self.format.size,
        })
    }

    fn set_streaming(&mut self, on: bool) -> Result<()> {
        self.streaming = on;
        if !on {
            // STREAMOFF returns every buffer to the application
            self.queued.clear();
        }
        Ok(())
    }

    fn release_buffers(&mut self) -> Result<()> {
        if self.live.get() != 0 {
            return Err(Self::protocol_error("VIDIOC_REQBUFS", "buffers still mapped"));
        }
        self.granted = 0;
        self.queued.clear();
        self.release_count += 1;
        Ok(())
    }
}

/// Generate test frame data based on pattern.
pub fn generate_test_frame(format: &Format, pattern: TestPattern, index: usize) -> Vec<u8> {
    let size = (format.width * format.height * 2) as usize; // 2 bytes/pixel
    let mut data = vec![0u8; size];

    match pattern {
        TestPattern::ColorBars => {
            generate_color_bars(&mut data, format.width, format.height);
        }
        TestPattern::Gradient => {
            generate_gradient(&mut data, format.width, format.height);
        }
        TestPattern::Solid(y, u, v) => {
            generate_solid(&mut data, y, u, v);
        }
        TestPattern::IndexedLuma => {
            #[allow(clippy::cast_possible_truncation)]
            let luma = (32 * (index + 1)).min(255) as u8;
            generate_solid(&mut data, luma, 128, 128);
        }
        TestPattern::Bayer(sample) => {
            for chunk in data.chunks_exact_mut(2) {
                chunk.copy_from_slice(&sample.to_le_bytes());
            }
        }
    }

    data
}

/// Generate YUYV color bars pattern.
fn generate_color_bars(data: &mut [u8], width: u32, height: u32) {
    // 8 color bars: White, Yellow, Cyan, Green, Magenta, Red, Blue, Black
    // YUYV values for each bar
    let bars: [(u8, u8, u8); 8] = [
        (235, 128, 128), // White
        (210, 16, 146),  // Yellow
        (170, 166, 16),  // Cyan
        (145, 54, 34),   // Green
        (106, 202, 222), // Magenta
        (81, 90, 240),   // Red
        (41, 240, 110),  // Blue
        (16, 128, 128),  // Black
    ];

    let bar_width = (width / 8).max(1);

    for y in 0..height {
        for x in (0..width).step_by(2) {
            let bar_idx = (x / bar_width).min(7) as usize;
            let (y_val, u_val, v_val) = bars[bar_idx];

            let offset = ((y * width + x) * 2) as usize;
            if offset + 3 < data.len() {
                data[offset] = y_val; // Y0
                data[offset + 1] = u_val; // U
                data[offset + 2] = y_val; // Y1
                data[offset + 3] = v_val; // V
            }
        }
    }
}

/// Generate YUYV horizontal gradient pattern.
fn generate_gradient(data: &mut [u8], width: u32, height: u32) {
    for y in 0..height {
        for x in (0..width).step_by(2) {
            #[allow(clippy::cast_possible_truncation)]
            let y_val = ((x * 255) / width) as u8;
            let offset = ((y * width + x) * 2) as usize;

            if offset + 3 < data.len() {
                data[offset] = y_val; // Y0
                data[offset + 1] = 128; // U (neutral)
                data[offset + 2] = y_val; // Y1
                data[offset + 3] = 128; // V (neutral)
            }
        }
    }
}

/// Generate solid color YUYV frame.
fn generate_solid(data: &mut [u8], y: u8, u: u8, v: u8) {
    for i in (0..data.len()).step_by(4) {
        if i + 3 < data.len() {
            data[i] = y; // Y0
            data[i + 1] = u; // U
            data[i + 2] = y; // Y1
            data[i + 3] = v; // V
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_driver_creation() {
        let driver = MockDriver::new();
        assert_eq!(driver.capabilities().driver, "mock");
        assert!(driver.capabilities().can_capture);
        assert!(driver.capabilities().can_stream);
    }

    #[test]
    fn test_mock_driver_format() {
        let mut driver = MockDriver::new();
        let format = driver.format().expect("format should succeed");
        assert_eq!(format.width, 64);
        assert_eq!(format.height, 48);

        let new_format = Format::new(1280, 720, FourCC::YUYV);
        let actual = driver
            .negotiate_format(&new_format)
            .expect("negotiate_format should succeed");
        assert_eq!(actual.width, 1280);
        assert_eq!(actual.height, 720);
    }

    #[test]
    fn test_mock_queue_protocol() {
        let mut driver = MockDriver::new();
        driver.request_buffers(2).expect("request should succeed");

        assert!(driver.dequeue_buffer().is_err(), "not streaming yet");
        driver.queue_buffer(1).expect("queue should succeed");
        assert!(driver.queue_buffer(1).is_err(), "double queue");
        assert!(driver.queue_buffer(2).is_err(), "out of range");

        driver.set_streaming(true).expect("stream on");
        let meta = driver.dequeue_buffer().expect("dequeue should succeed");
        assert_eq!(meta.index, 1);
        assert_eq!(meta.sequence, 0);
        assert!(driver.dequeue_buffer().is_err(), "queue is empty");
    }

    #[test]
    fn test_injected_dequeue_failure_keeps_queue() {
        let mut driver = MockDriver::new().with_dequeue_failure(0);
        driver.request_buffers(2).expect("request should succeed");
        driver.queue_buffer(0).expect("queue should succeed");
        driver.set_streaming(true).expect("stream on");

        let err = driver.dequeue_buffer().expect_err("first dequeue should fail");
        assert_eq!(err.os_error(), Some(libc::EIO));
        assert_eq!(driver.queued(), vec![0]);
        assert_eq!(driver.dequeue_buffer().expect("retry should succeed").index, 0);
    }

    #[test]
    fn test_color_bars_pattern() {
        let format = Format::new(640, 480, FourCC::YUYV);
        let data = generate_test_frame(&format, TestPattern::ColorBars, 0);

        // Check frame size
        assert_eq!(data.len(), (640 * 480 * 2) as usize);

        // First bar should be white (Y=235)
        assert_eq!(data[0], 235);
    }

    #[test]
    fn test_gradient_pattern() {
        let format = Format::new(640, 480, FourCC::YUYV);
        let data = generate_test_frame(&format, TestPattern::Gradient, 0);

        // Left edge should be dark
        assert!(data[0] < 10);

        // Right edge should be bright (check last row, last pixel)
        let last_row_start = (479 * 640 * 2) as usize;
        let last_pixel_y = data[last_row_start + 638 * 2];
        assert!(last_pixel_y > 200);
    }

    #[test]
    fn test_indexed_luma_pattern() {
        let format = Format::new(8, 2, FourCC::YUYV);
        let first = generate_test_frame(&format, TestPattern::IndexedLuma, 0);
        let third = generate_test_frame(&format, TestPattern::IndexedLuma, 2);
        assert_eq!(first[0], 32);
        assert_eq!(third[0], 96);
        assert_eq!(third[1], 128);
    }

    #[test]
    fn test_bayer_pattern_little_endian() {
        let format = Format::new(4, 2, FourCC::Y16);
        let data = generate_test_frame(&format, TestPattern::Bayer(0x0123), 0);
        assert_eq!(&data[..4], &[0x23, 0x01, 0x23, 0x01]);
    }
}
