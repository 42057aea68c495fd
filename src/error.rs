//! Error taxonomy for capture, decode and persistence.

use std::io;

use thiserror::Error;

use crate::traits::Format;

/// Error type for camera operations.
#[derive(Debug, Error)]
pub enum CameraError {
    /// Failed to open device.
    #[error("Failed to open device: {0}")]
    DeviceOpenFailed(String),

    /// The device lacks a capability required for mmap streaming.
    #[error("Device does not support {0}")]
    MissingCapability(&'static str),

    /// Requested format is not supported.
    #[error("Format not supported, driver chose {0}")]
    FormatNotSupported(Format),

    /// A driver request (ioctl) failed.
    #[error("{op} failed: {source}")]
    Driver {
        /// Name of the driver request, e.g. `VIDIOC_DQBUF`.
        op: &'static str,
        /// OS error reported by the driver.
        #[source]
        source: io::Error,
    },

    /// Mapping a driver buffer into this process failed.
    #[error("Unable to map buffer {index}: {source}")]
    BufferMap {
        /// Index of the buffer that failed to map.
        index: usize,
        /// OS error reported by mmap.
        #[source]
        source: io::Error,
    },

    /// The pool already owns buffers; release them before allocating again.
    #[error("Buffers already allocated ({0} in pool)")]
    AlreadyAllocated(usize),

    /// The operation needs an allocated buffer pool.
    #[error("No buffers allocated")]
    NotAllocated,

    /// The driver reported a buffer index the pool does not know.
    #[error("Driver returned unknown buffer index {0}")]
    UnknownBuffer(usize),

    /// The driver handed back a buffer the pool never queued.
    #[error("Buffer {0} was dequeued while not queued")]
    BufferNotQueued(usize),

    /// Frame geometry does not fit the buffer it describes.
    #[error("Invalid frame dimensions {width}x{height}: {reason}")]
    InvalidDimensions {
        /// Declared frame width.
        width: u32,
        /// Declared frame height.
        height: u32,
        /// What is wrong with them.
        reason: String,
    },

    /// A control value outside its valid range.
    #[error("Invalid control value: {0}")]
    InvalidControl(String),

    /// Bayer interpolation failed.
    #[error("Demosaic failed: {0}")]
    Demosaic(String),

    /// A decoded frame does not show the expected test pattern.
    #[cfg(any(test, feature = "integration"))]
    #[error("Pattern mismatch: {0}")]
    PatternMismatch(String),

    /// Encoding a still image failed.
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

impl CameraError {
    /// Wrap the last OS error for a failed driver request.
    pub fn driver(op: &'static str, source: io::Error) -> Self {
        Self::Driver { op, source }
    }

    /// Raw OS error code, when the error came from the driver or the OS.
    pub fn os_error(&self) -> Option<i32> {
        match self {
            Self::Driver { source, .. } | Self::BufferMap { source, .. } | Self::Io(source) => {
                source.raw_os_error()
            }
            _ => None,
        }
    }
}

/// Result type for camera operations.
pub type Result<T> = std::result::Result<T, CameraError>;
