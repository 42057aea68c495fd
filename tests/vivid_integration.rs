//! Integration tests against the vivid virtual camera.
//!
//! These tests require:
//! - The `integration` feature flag: `cargo test --features integration`
//! - The vivid module loaded with two instances, e.g.
//!   `modprobe vivid n_devs=2 node_types=0x1,0x1`
//! - Read/write access to /dev/video* (video group or sudo)
//!
//! Expected vivid configuration:
//! - First device: Gray Ramp test pattern
//! - Second device: 100% Colorbar test pattern
//! - Format: 640x480 YUYV
//!
//! Tests fail, rather than skip, when vivid is missing.

#![cfg(feature = "integration")]

use std::fs;
use std::path::Path;
use std::sync::Arc;

use bayer_cam_capture::capture::{CancellationToken, CaptureLoop, LogSink};
use bayer_cam_capture::validation::{
    validate_color_bars, validate_frame_sequence, validate_gradient,
};
use bayer_cam_capture::{
    BayerPattern, BufferPool, CaptureStore, ColorImage, ControlSnapshot, Format, FourCC,
    FrameDecoder, FrameMetadata, RawFrame, SampleFormat, SharedControls, V4L2Device, VideoDriver,
};
use serial_test::serial;

/// Indices of every vivid device, checked through sysfs before opening.
fn find_vivid_devices() -> Vec<usize> {
    let video4linux = Path::new("/sys/class/video4linux");
    if !video4linux.exists() {
        return Vec::new();
    }

    (0..10)
        .filter(|index| {
            let name_path = video4linux.join(format!("video{index}")).join("name");
            fs::read_to_string(name_path)
                .is_ok_and(|name| name.to_lowercase().contains("vivid"))
        })
        .filter(|index| V4L2Device::open(*index).is_ok())
        .collect()
}

fn require_vivid() -> usize {
    match find_vivid_devices().first() {
        Some(index) => *index,
        None => panic!(
            "vivid virtual camera not available.\n\
             Load vivid with: sudo modprobe vivid n_devs=2 node_types=0x1,0x1\n\
             Or run unit tests only: cargo test --lib"
        ),
    }
}

/// (gradient device, colorbar device)
fn require_vivid_pair() -> (usize, usize) {
    match find_vivid_devices().as_slice() {
        [gradient, colorbar, ..] => (*gradient, *colorbar),
        devices => panic!(
            "Two vivid devices required but found {}.\n\
             Load vivid with: sudo modprobe vivid n_devs=2 node_types=0x1,0x1",
            devices.len()
        ),
    }
}

fn open_yuyv(index: usize) -> (BufferPool<V4L2Device>, Format) {
    let mut device = V4L2Device::open(index).expect("Failed to open vivid device");
    let format = device
        .negotiate_format(&Format::new(640, 480, FourCC::YUYV))
        .expect("Failed to set format");
    (BufferPool::new(device), format)
}

/// Dequeue and decode one frame as YUV422.
fn capture_frame(pool: &mut BufferPool<V4L2Device>, format: &Format) -> (ColorImage, FrameMetadata) {
    let buffer = pool.dequeue().expect("Failed to dequeue");
    let metadata = buffer.metadata().clone();
    let frame = RawFrame::with_stride(
        buffer.bytes(),
        format.width,
        format.height,
        format.stride,
        SampleFormat::Yuv422,
    )
    .expect("Buffer too small for format");
    let image = FrameDecoder::new()
        .decode(&frame, BayerPattern::Rg)
        .expect("Failed to decode");
    buffer.requeue().expect("Failed to requeue");
    (image, metadata)
}

#[test]
#[serial]
fn test_vivid_device_open() {
    let device = V4L2Device::open(require_vivid()).expect("Failed to open vivid device");
    let caps = device.capabilities();

    assert!(caps.driver.contains("vivid"), "Expected vivid driver");
    assert!(caps.can_capture, "vivid should support capture");
    assert!(caps.can_stream, "vivid should support streaming");
    println!("Opened {} ({}) at {}", caps.card, caps.driver, caps.bus_info);
}

#[test]
#[serial]
fn test_vivid_format_negotiation() {
    let (pool, format) = open_yuyv(require_vivid());

    assert_eq!(format.width, 640, "Width mismatch");
    assert_eq!(format.height, 480, "Height mismatch");
    assert!(format.stride >= 640 * 2);
    assert!(format.size >= format.stride * 480);
    assert_eq!(pool.driver().format().expect("Failed to query format"), format);
    println!("Negotiated {format}");
}

#[test]
#[serial]
fn test_vivid_buffers_are_distinct() {
    let (mut pool, _) = open_yuyv(require_vivid());
    let buffers = pool.allocate(4).expect("Failed to allocate buffers");
    assert!(!buffers.is_empty());

    let ranges: Vec<_> = buffers.iter().map(|b| b.address_range()).collect();
    for (i, a) in ranges.iter().enumerate() {
        for b in ranges.iter().skip(i + 1) {
            assert!(a.end <= b.start || b.end <= a.start, "{a:?} overlaps {b:?}");
        }
    }

    pool.release().expect("Failed to release buffers");
    pool.allocate(4).expect("Failed to reallocate buffers");
    pool.release().expect("Failed to release buffers");
}

#[test]
#[serial]
fn test_vivid_capture_sequence() {
    let (mut pool, format) = open_yuyv(require_vivid());
    pool.allocate(4).expect("Failed to allocate buffers");
    pool.start_streaming().expect("Failed to start streaming");

    let frames: Vec<FrameMetadata> = (0..10)
        .map(|_| capture_frame(&mut pool, &format).1)
        .collect();

    for meta in &frames {
        println!("buffer {} seq={} ts={:?}", meta.index, meta.sequence, meta.timestamp);
        assert!(meta.bytes_used > 0, "Bytes used should be positive");
    }
    let result = validate_frame_sequence(&frames);
    assert!(result.is_ok(), "Frame sequence validation failed: {:?}", result.err());
    assert!(frames.iter().any(|meta| meta.index != 0), "only buffer 0 was used");
}

#[test]
#[serial]
fn test_vivid_gradient_pattern() {
    let (gradient_device, _) = require_vivid_pair();
    let (mut pool, format) = open_yuyv(gradient_device);
    pool.allocate(4).expect("Failed to allocate buffers");
    pool.start_streaming().expect("Failed to start streaming");

    let (image, _) = capture_frame(&mut pool, &format);
    let result = validate_gradient(&image);
    assert!(
        result.is_ok(),
        "Gradient validation failed on first vivid device.\n\
         Expected Gray Ramp pattern.\n\
         Error: {:?}",
        result.err()
    );
}

#[test]
#[serial]
fn test_vivid_colorbar_pattern() {
    let (_, colorbar_device) = require_vivid_pair();
    let (mut pool, format) = open_yuyv(colorbar_device);
    pool.allocate(4).expect("Failed to allocate buffers");
    pool.start_streaming().expect("Failed to start streaming");

    let (image, _) = capture_frame(&mut pool, &format);
    let result = validate_color_bars(&image);
    assert!(
        result.is_ok(),
        "Color bars validation failed on second vivid device.\n\
         Expected 100% Colorbar pattern.\n\
         Error: {:?}",
        result.err()
    );
}

#[test]
#[serial]
fn test_vivid_capture_loop_saves_raw_once() {
    let (mut pool, format) = open_yuyv(require_vivid());
    pool.allocate(3).expect("Failed to allocate buffers");

    let initial = ControlSnapshot {
        format: SampleFormat::Yuv422,
        ..ControlSnapshot::default()
    };
    let controls = Arc::new(SharedControls::new(&initial).expect("Failed to map controls"));
    controls.request_save_raw();
    controls.request_save_still();

    let dir = tempfile::tempdir().expect("tempdir");
    let mut capture = CaptureLoop::new(pool, Arc::clone(&controls), CaptureStore::new(dir.path(), "captures"))
        .expect("Failed to build capture loop")
        .with_max_frames(Some(8));

    let frames = capture
        .run(&mut LogSink::default(), &CancellationToken::new())
        .expect("Capture loop failed");

    assert_eq!(frames, 8);
    assert!(capture.pool().is_empty(), "buffers should be released");
    let raw = fs::read(dir.path().join("captures_0.raw")).expect("raw capture missing");
    assert_eq!(raw.len(), format.size as usize);
    assert!(dir.path().join("captures_1.bmp").exists(), "still capture missing");
    assert_eq!(fs::read_dir(dir.path()).expect("read dir").count(), 2);
}
