//! Bayer-Cam-Capture: V4L2 mmap capture for USB3 bayer cameras
//!
//! The library exchanges memory-mapped buffers with the kernel capture
//! driver, decodes RAW10/RAW12 bayer or YUV422 frames to RGB and runs a
//! software correction chain (gamma, white balance, auto contrast). The
//! driver sits behind the [`VideoDriver`] trait so the whole pipeline runs
//! against a mock in tests.

pub mod capture;
pub mod color;
pub mod config;
pub mod console;
pub mod control;
pub mod decode;
pub mod device;
pub mod error;
pub mod logging;
pub mod pool;
pub mod store;
pub mod traits;

#[cfg(any(test, feature = "integration"))]
pub mod validation;

#[cfg(test)]
pub mod mock;

pub use capture::{CancellationToken, CaptureLoop, FrameSink, LogSink};
pub use color::{ColorConfig, ColorPipeline};
pub use control::{BayerPattern, ControlSnapshot, SharedControls};
pub use decode::{ColorImage, FrameDecoder, RawFrame, SampleFormat};
pub use device::V4L2Device;
pub use error::{CameraError, Result};
pub use pool::{BufferPool, DequeuedBuffer};
pub use store::CaptureStore;
pub use traits::{DeviceCapabilities, Format, FourCC, FrameMetadata, VideoDriver};
