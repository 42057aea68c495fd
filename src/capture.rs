//! The dequeue, decode, correct, present and requeue loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, trace, warn};

use crate::color::ColorPipeline;
use crate::control::SharedControls;
use crate::decode::{ColorImage, FrameDecoder, RawFrame};
use crate::error::{CameraError, Result};
use crate::pool::BufferPool;
use crate::store::CaptureStore;
use crate::traits::{Format, FrameMetadata, VideoDriver};

/// Receives every finished frame.
pub trait FrameSink {
    /// Show or otherwise consume one frame.
    fn present(&mut self, image: &ColorImage, metadata: &FrameMetadata) -> Result<()>;
}

/// Sink that logs frame arrivals and the running frame rate.
#[derive(Debug)]
pub struct LogSink {
    started: Instant,
    frames: u64,
    report_every: u64,
}

impl LogSink {
    /// Log the frame rate every `report_every` frames.
    pub fn new(report_every: u64) -> Self {
        Self {
            started: Instant::now(),
            frames: 0,
            report_every: report_every.max(1),
        }
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new(30)
    }
}

impl FrameSink for LogSink {
    fn present(&mut self, image: &ColorImage, metadata: &FrameMetadata) -> Result<()> {
        self.frames += 1;
        debug!(
            "frame {}: buffer {}, {}x{}, {} bytes, timestamp {:?}",
            metadata.sequence,
            metadata.index,
            image.width(),
            image.height(),
            metadata.bytes_used,
            metadata.timestamp
        );

        if self.frames % self.report_every == 0 {
            let elapsed = self.started.elapsed().as_secs_f64();
            #[allow(clippy::cast_precision_loss)]
            let fps = if elapsed > 0.0 {
                self.frames as f64 / elapsed
            } else {
                0.0
            };
            info!("{} frames, {fps:.1} fps", self.frames);
        }
        Ok(())
    }
}

/// Cooperative stop signal shared between the loop and its controllers.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// A token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the loop to stop at the next frame boundary.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Drives one capture session over an allocated [`BufferPool`].
pub struct CaptureLoop<D: VideoDriver> {
    pool: BufferPool<D>,
    controls: Arc<SharedControls>,
    decoder: FrameDecoder,
    pipeline: ColorPipeline,
    store: CaptureStore,
    format: Format,
    max_frames: Option<u64>,
    frames: u64,
}

impl<D: VideoDriver> CaptureLoop<D> {
    /// Build a loop over `pool`, using the driver's current format.
    pub fn new(
        pool: BufferPool<D>,
        controls: Arc<SharedControls>,
        store: CaptureStore,
    ) -> Result<Self> {
        let format = pool.driver().format()?;
        Ok(Self {
            pool,
            controls,
            decoder: FrameDecoder::new(),
            pipeline: ColorPipeline::default(),
            store,
            format,
            max_frames: None,
            frames: 0,
        })
    }

    /// Replace the default color pipeline.
    #[must_use]
    pub fn with_pipeline(mut self, pipeline: ColorPipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    /// Stop after `limit` frames.
    #[must_use]
    pub fn with_max_frames(mut self, limit: Option<u64>) -> Self {
        self.max_frames = limit;
        self
    }

    /// The buffer pool.
    pub const fn pool(&self) -> &BufferPool<D> {
        &self.pool
    }

    /// Frames processed so far.
    pub const fn frames(&self) -> u64 {
        self.frames
    }

    /// Stream until `token` is cancelled or the frame limit is hit, then
    /// shut down. Returns the number of frames processed.
    pub fn run(&mut self, sink: &mut dyn FrameSink, token: &CancellationToken) -> Result<u64> {
        let streamed = self.stream(sink, token);
        let released = self.shutdown();
        let frames = streamed?;
        released?;
        Ok(frames)
    }

    fn stream(&mut self, sink: &mut dyn FrameSink, token: &CancellationToken) -> Result<u64> {
        self.pool.start_streaming()?;
        info!("streaming {} with {} buffers", self.format, self.pool.len());

        while !token.is_cancelled() {
            self.run_cycle(sink, token)?;
        }
        info!("capture stopped after {} frames", self.frames);
        Ok(self.frames)
    }

    /// Process one frame per buffer, checking `token` before each frame.
    ///
    /// A failed dequeue or requeue is logged and skipped. A vanished device
    /// and every other error end the cycle.
    pub fn run_cycle(&mut self, sink: &mut dyn FrameSink, token: &CancellationToken) -> Result<()> {
        for _ in 0..self.pool.len() {
            if token.is_cancelled() {
                break;
            }
            match self.process_next(sink) {
                Ok(()) => {}
                Err(err @ CameraError::Driver { .. }) if err.os_error() != Some(libc::ENODEV) => {
                    warn!("skipping frame: {err}");
                }
                Err(err) => return Err(err),
            }

            if self.max_frames.is_some_and(|limit| self.frames >= limit) {
                info!("frame limit of {} reached", self.frames);
                token.cancel();
            }
        }
        Ok(())
    }

    /// Dequeue, decode, correct, persist, present and requeue one buffer.
    pub fn process_next(&mut self, sink: &mut dyn FrameSink) -> Result<()> {
        let controls = self.controls.snapshot();
        let buffer = self.pool.dequeue()?;
        let metadata = buffer.metadata().clone();
        let bytes = buffer.bytes();
        let frame_bytes = bytes.get(..image_len(&self.format, bytes.len())).unwrap_or(bytes);

        if self.controls.take_save_raw() {
            if let Err(err) = self.store.save_raw(frame_bytes) {
                warn!("raw save failed: {err}");
            }
        }

        trace!("decoding buffer {} as {}", metadata.index, controls.format);
        let raw = RawFrame::with_stride(
            frame_bytes,
            self.format.width,
            self.format.height,
            self.format.stride,
            controls.format,
        )?;
        let mut image = self.decoder.decode(&raw, controls.bayer)?;

        if controls.format.is_bayer() {
            self.pipeline.process(&mut image, &controls);
        }

        if self.controls.take_save_still() {
            if let Err(err) = self.store.save_still(&image) {
                warn!("still save failed: {err}");
            }
        }

        sink.present(&image, &metadata)?;
        buffer.requeue()?;
        self.frames += 1;
        Ok(())
    }

    /// Stop streaming, unmap and release every buffer.
    pub fn shutdown(&mut self) -> Result<()> {
        self.pool.stop_streaming()?;
        self.pool.release()?;
        debug!("capture session shut down");
        Ok(())
    }
}

/// Bytes of one image in a buffer of `available` bytes. Drivers that report
/// no image size get the packed two bytes per pixel size.
fn image_len(format: &Format, available: usize) -> usize {
    let size = match format.size {
        0 => (format.width as usize)
            .saturating_mul(format.height as usize)
            .saturating_mul(2),
        size => size as usize,
    };
    if size == 0 {
        available
    } else {
        size.min(available)
    }
}
