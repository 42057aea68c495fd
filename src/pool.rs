//! Memory-mapped buffer pool shared with the capture driver.
//!
//! Every buffer is either queued (owned by the driver, which may be writing
//! into it) or dequeued (owned by the application). Buffer bytes are reachable
//! only through a [`DequeuedBuffer`], so queued memory is never touched.

use std::fmt;
use std::ops::Range;

use tracing::{debug, info, warn};

use crate::error::{CameraError, Result};
use crate::traits::{BufferInfo, FrameMetadata, VideoDriver};

/// Lifecycle state of one buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// In the driver's incoming queue; the driver may write to it.
    Queued,
    /// Handed back by the driver; the application may read and write it.
    Dequeued,
}

/// One mapped buffer.
pub struct Buffer<M> {
    info: BufferInfo,
    mapping: M,
    state: BufferState,
}

impl<M: AsRef<[u8]>> Buffer<M> {
    /// Driver descriptor for the buffer.
    pub const fn info(&self) -> &BufferInfo {
        &self.info
    }

    /// Current lifecycle state.
    pub const fn state(&self) -> BufferState {
        self.state
    }

    /// Mapped length in bytes.
    pub fn len(&self) -> usize {
        self.mapping.as_ref().len()
    }

    /// Whether the mapping is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Address range of the mapping in this process.
    pub fn address_range(&self) -> Range<usize> {
        let start = self.mapping.as_ref().as_ptr() as usize;
        start..start + self.len()
    }
}

impl<M: AsRef<[u8]>> fmt::Debug for Buffer<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("info", &self.info)
            .field("state", &self.state)
            .field("address", &self.address_range())
            .finish()
    }
}

/// Owns the driver and the buffers mapped from it.
pub struct BufferPool<D: VideoDriver> {
    driver: D,
    buffers: Vec<Buffer<D::Mapping>>,
    streaming: bool,
}

impl<D: VideoDriver> BufferPool<D> {
    /// Wrap a driver. No buffers are allocated yet.
    pub const fn new(driver: D) -> Self {
        Self {
            driver,
            buffers: Vec::new(),
            streaming: false,
        }
    }

    /// The underlying driver.
    pub const fn driver(&self) -> &D {
        &self.driver
    }

    /// The underlying driver, for format negotiation before allocation.
    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    /// Number of buffers in the pool.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Whether no buffers are allocated.
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Whether the driver is streaming.
    pub const fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// The allocated buffers.
    pub fn buffers(&self) -> &[Buffer<D::Mapping>] {
        &self.buffers
    }

    /// Request `count` buffers, map each one and queue it.
    ///
    /// The driver may grant a different count. If any map fails, the buffers
    /// mapped so far are unmapped, the driver request is undone and the
    /// failing index is reported.
    pub fn allocate(&mut self, count: u32) -> Result<&[Buffer<D::Mapping>]> {
        if !self.buffers.is_empty() {
            return Err(CameraError::AlreadyAllocated(self.buffers.len()));
        }
        if count == 0 {
            return Err(CameraError::InvalidControl(
                "buffer count must be positive".to_owned(),
            ));
        }

        let infos = self.driver.request_buffers(count)?;
        if infos.is_empty() {
            return Err(CameraError::NotAllocated);
        }
        info!("{} buffers requested, {} granted", count, infos.len());

        let mut buffers = Vec::with_capacity(infos.len());
        for info in infos {
            let mapped = self.driver.map_buffer(&info).and_then(|mapping| {
                self.driver.queue_buffer(info.index)?;
                Ok(mapping)
            });

            match mapped {
                Ok(mapping) => {
                    debug!(
                        "buffer {}: length {} offset {}",
                        info.index, info.length, info.offset
                    );
                    buffers.push(Buffer {
                        info,
                        mapping,
                        state: BufferState::Queued,
                    });
                }
                Err(err) => {
                    warn!("allocation failed at buffer {}: {err}", info.index);
                    drop(buffers);
                    if let Err(release_err) = self.driver.release_buffers() {
                        warn!("rollback could not release buffers: {release_err}");
                    }
                    return Err(err);
                }
            }
        }

        self.buffers = buffers;
        Ok(&self.buffers)
    }

    /// Stop streaming if needed, unmap every buffer and tell the driver that
    /// no buffers are in use. Does nothing when the pool is empty.
    pub fn release(&mut self) -> Result<()> {
        if self.buffers.is_empty() {
            return Ok(());
        }
        self.stop_streaming()?;

        let count = self.buffers.len();
        self.buffers.clear();
        self.driver.release_buffers()?;
        info!("{count} buffers released");
        Ok(())
    }

    /// Switch streaming on, queueing any buffer a previous stop handed back.
    pub fn start_streaming(&mut self) -> Result<()> {
        if self.buffers.is_empty() {
            return Err(CameraError::NotAllocated);
        }
        if !self.streaming {
            for index in 0..self.buffers.len() {
                self.requeue_index(index)?;
            }
            self.driver.set_streaming(true)?;
            self.streaming = true;
            debug!("streaming on");
        }
        Ok(())
    }

    /// Switch streaming off. The driver gives every buffer back.
    pub fn stop_streaming(&mut self) -> Result<()> {
        if self.streaming {
            self.driver.set_streaming(false)?;
            self.streaming = false;
            for buffer in &mut self.buffers {
                buffer.state = BufferState::Dequeued;
            }
            debug!("streaming off");
        }
        Ok(())
    }

    /// Block until the driver returns a filled buffer.
    pub fn dequeue(&mut self) -> Result<DequeuedBuffer<'_, D>> {
        if self.buffers.is_empty() {
            return Err(CameraError::NotAllocated);
        }

        let metadata = self.driver.dequeue_buffer()?;
        let buffer = self
            .buffers
            .get_mut(metadata.index)
            .ok_or(CameraError::UnknownBuffer(metadata.index))?;
        if buffer.state != BufferState::Queued {
            return Err(CameraError::BufferNotQueued(metadata.index));
        }
        buffer.state = BufferState::Dequeued;

        Ok(DequeuedBuffer {
            pool: self,
            metadata,
            requeued: false,
        })
    }

    fn requeue_index(&mut self, index: usize) -> Result<()> {
        let buffer = self
            .buffers
            .get_mut(index)
            .ok_or(CameraError::UnknownBuffer(index))?;
        if buffer.state == BufferState::Queued {
            return Ok(());
        }
        self.driver.queue_buffer(index)?;
        buffer.state = BufferState::Queued;
        Ok(())
    }
}

impl<D: VideoDriver> Drop for BufferPool<D> {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            warn!("failed to release buffers: {err}");
        }
    }
}

/// A buffer the application currently owns.
///
/// Call [`DequeuedBuffer::requeue`] to hand it back. Dropping the guard
/// requeues it as well, logging any failure.
pub struct DequeuedBuffer<'a, D: VideoDriver> {
    pool: &'a mut BufferPool<D>,
    metadata: FrameMetadata,
    requeued: bool,
}

impl<D: VideoDriver> DequeuedBuffer<'_, D> {
    /// Buffer index.
    pub const fn index(&self) -> usize {
        self.metadata.index
    }

    /// Metadata reported by the driver.
    pub const fn metadata(&self) -> &FrameMetadata {
        &self.metadata
    }

    /// Mapped bytes.
    pub fn bytes(&self) -> &[u8] {
        self.pool
            .buffers
            .get(self.metadata.index)
            .map_or(&[][..], |buffer| buffer.mapping.as_ref())
    }

    /// Mapped bytes, writable.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.pool
            .buffers
            .get_mut(self.metadata.index)
            .map_or(&mut [][..], |buffer| buffer.mapping.as_mut())
    }

    /// Return the buffer to the driver's incoming queue.
    pub fn requeue(mut self) -> Result<()> {
        self.requeued = true;
        self.pool.requeue_index(self.metadata.index)
    }
}

impl<D: VideoDriver> Drop for DequeuedBuffer<'_, D> {
    fn drop(&mut self) {
        if self.requeued || !self.pool.streaming {
            return;
        }
        if let Err(err) = self.pool.requeue_index(self.metadata.index) {
            warn!("failed to requeue buffer {}: {err}", self.metadata.index);
        }
    }
}
