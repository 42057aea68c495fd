//! V4L2 driver implementation on top of the v4l crate.
//!
//! Format negotiation goes through the crate's safe `Capture` API. Buffer
//! exchange talks to the driver directly (REQBUFS/QUERYBUF/QBUF/DQBUF and
//! mmap) so the pool can see every buffer index and its mapping.

#![allow(unsafe_code)]

use std::io;
use std::mem;
use std::os::raw::c_void;
use std::ptr::{self, NonNull};
use std::slice;
use std::time::Duration;

use tracing::{debug, info, warn};
use v4l::buffer::Type;
use v4l::memory::Memory;
use v4l::v4l2;
use v4l::v4l_sys::{v4l2_buffer, v4l2_requestbuffers};
use v4l::video::Capture;
use v4l::Device;

use crate::error::{CameraError, Result};
use crate::traits::{BufferInfo, DeviceCapabilities, Format, FourCC, FrameMetadata, VideoDriver};

/// V4L2 device implementation wrapping the v4l crate.
pub struct V4L2Device {
    device: Device,
    capabilities: DeviceCapabilities,
    buf_type: Type,
}

impl V4L2Device {
    /// Open a V4L2 device by index (e.g., 0 for /dev/video0).
    ///
    /// Fails unless the device supports both video capture and streaming I/O.
    pub fn open(index: usize) -> Result<Self> {
        let device = Device::new(index)
            .map_err(|err| CameraError::DeviceOpenFailed(err.to_string()))?;

        let caps = device
            .query_caps()
            .map_err(|err| CameraError::DeviceOpenFailed(err.to_string()))?;

        let capabilities = DeviceCapabilities {
            driver: caps.driver,
            card: caps.card,
            bus_info: caps.bus,
            can_capture: caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE),
            can_stream: caps.capabilities.contains(v4l::capability::Flags::STREAMING),
        };

        if !capabilities.can_capture {
            return Err(CameraError::MissingCapability("video capture"));
        }
        if !capabilities.can_stream {
            return Err(CameraError::MissingCapability("streaming"));
        }

        Ok(Self {
            device,
            capabilities,
            buf_type: Type::VideoCapture,
        })
    }

    fn fd(&self) -> std::os::raw::c_int {
        self.device.handle().fd()
    }

    fn requestbuffers_desc(&self, count: u32) -> v4l2_requestbuffers {
        v4l2_requestbuffers {
            count,
            type_: self.buf_type as u32,
            memory: Memory::Mmap as u32,
            // SAFETY: v4l2_requestbuffers is a plain C struct, all-zero is valid.
            ..unsafe { mem::zeroed() }
        }
    }

    fn buffer_desc(&self, index: u32) -> v4l2_buffer {
        v4l2_buffer {
            index,
            type_: self.buf_type as u32,
            memory: Memory::Mmap as u32,
            // SAFETY: v4l2_buffer is a plain C struct, all-zero is valid.
            ..unsafe { mem::zeroed() }
        }
    }

    fn query_buffer(&self, index: u32) -> Result<BufferInfo> {
        let mut buf = self.buffer_desc(index);
        // SAFETY: `buf` is a valid v4l2_buffer that outlives the call.
        unsafe {
            v4l2::ioctl(
                self.fd(),
                v4l2::vidioc::VIDIOC_QUERYBUF,
                ptr::addr_of_mut!(buf).cast::<c_void>(),
            )
        }
        .map_err(|err| CameraError::driver("VIDIOC_QUERYBUF", err))?;

        // SAFETY: for MMAP memory the driver fills the `offset` member.
        let offset = unsafe { buf.m.offset };

        Ok(BufferInfo {
            index: index as usize,
            offset,
            length: buf.length as usize,
        })
    }

    fn raw_format(fmt: &v4l::Format) -> Format {
        Format {
            width: fmt.width,
            height: fmt.height,
            fourcc: FourCC::from(fmt.fourcc),
            stride: fmt.stride,
            size: fmt.size,
        }
    }
}

impl VideoDriver for V4L2Device {
    type Mapping = MmapRegion;

    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn format(&self) -> Result<Format> {
        let fmt = self
            .device
            .format()
            .map_err(|err| CameraError::driver("VIDIOC_G_FMT", err))?;

        Ok(Self::raw_format(&fmt))
    }

    fn negotiate_format(&mut self, requested: &Format) -> Result<Format> {
        let mut fmt = self
            .device
            .format()
            .map_err(|err| CameraError::driver("VIDIOC_G_FMT", err))?;

        fmt.width = requested.width;
        fmt.height = requested.height;
        fmt.fourcc = requested.fourcc.into();

        let fmt = self
            .device
            .set_format(&fmt)
            .map_err(|err| CameraError::driver("VIDIOC_S_FMT", err))?;

        let actual = Self::raw_format(&fmt);
        if actual.fourcc != requested.fourcc {
            return Err(CameraError::FormatNotSupported(actual));
        }
        info!("negotiated {actual}");
        Ok(actual)
    }

    fn request_buffers(&mut self, count: u32) -> Result<Vec<BufferInfo>> {
        let mut req = self.requestbuffers_desc(count);
        // SAFETY: `req` is a valid v4l2_requestbuffers that outlives the call.
        unsafe {
            v4l2::ioctl(
                self.fd(),
                v4l2::vidioc::VIDIOC_REQBUFS,
                ptr::addr_of_mut!(req).cast::<c_void>(),
            )
        }
        .map_err(|err| CameraError::driver("VIDIOC_REQBUFS", err))?;

        debug!("VIDIOC_REQBUFS granted {} of {count}", req.count);
        (0..req.count).map(|index| self.query_buffer(index)).collect()
    }

    fn map_buffer(&mut self, info: &BufferInfo) -> Result<MmapRegion> {
        #[allow(clippy::cast_possible_wrap)]
        let offset = info.offset as libc::off_t;

        // SAFETY: a fresh shared mapping of a driver buffer; offset and length
        // come from VIDIOC_QUERYBUF for this fd.
        let addr = unsafe {
            v4l2::mmap(
                ptr::null_mut(),
                info.length,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fd(),
                offset,
            )
        }
        .map_err(|source| CameraError::BufferMap {
            index: info.index,
            source,
        })?;

        let ptr = NonNull::new(addr.cast::<u8>()).ok_or_else(|| CameraError::BufferMap {
            index: info.index,
            source: io::Error::other("mmap returned a null address"),
        })?;

        debug!("buffer {} mapped at {:p}", info.index, ptr.as_ptr());

        Ok(MmapRegion {
            ptr,
            len: info.length,
        })
    }

    fn queue_buffer(&mut self, index: usize) -> Result<()> {
        let mut buf = self.buffer_desc(index as u32);
        // SAFETY: `buf` is a valid v4l2_buffer that outlives the call.
        unsafe {
            v4l2::ioctl(
                self.fd(),
                v4l2::vidioc::VIDIOC_QBUF,
                ptr::addr_of_mut!(buf).cast::<c_void>(),
            )
        }
        .map_err(|err| CameraError::driver("VIDIOC_QBUF", err))
    }

    fn dequeue_buffer(&mut self) -> Result<FrameMetadata> {
        let mut buf = self.buffer_desc(0);
        loop {
            // SAFETY: `buf` is a valid v4l2_buffer that outlives the call.
            let ret = unsafe {
                v4l2::ioctl(
                    self.fd(),
                    v4l2::vidioc::VIDIOC_DQBUF,
                    ptr::addr_of_mut!(buf).cast::<c_void>(),
                )
            };
            match ret {
                Ok(()) => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(CameraError::driver("VIDIOC_DQBUF", err)),
            }
        }

        // V4L2 timestamps are always non-negative in practice
        let secs = buf.timestamp.tv_sec.max(0) as u64;
        let nanos = (buf.timestamp.tv_usec.max(0) as u32).saturating_mul(1000);

        Ok(FrameMetadata {
            index: buf.index as usize,
            sequence: buf.sequence,
            timestamp: Duration::new(secs, nanos),
            bytes_used: buf.bytesused,
        })
    }

    fn set_streaming(&mut self, on: bool) -> Result<()> {
        let (request, op) = if on {
            (v4l2::vidioc::VIDIOC_STREAMON, "VIDIOC_STREAMON")
        } else {
            (v4l2::vidioc::VIDIOC_STREAMOFF, "VIDIOC_STREAMOFF")
        };
        let mut typ = self.buf_type as u32;
        // SAFETY: the request takes a pointer to the buffer type.
        unsafe { v4l2::ioctl(self.fd(), request, ptr::addr_of_mut!(typ).cast::<c_void>()) }
            .map_err(|err| CameraError::driver(op, err))
    }

    fn release_buffers(&mut self) -> Result<()> {
        let mut req = self.requestbuffers_desc(0);
        // SAFETY: `req` is a valid v4l2_requestbuffers that outlives the call.
        unsafe {
            v4l2::ioctl(
                self.fd(),
                v4l2::vidioc::VIDIOC_REQBUFS,
                ptr::addr_of_mut!(req).cast::<c_void>(),
            )
        }
        .map_err(|err| CameraError::driver("VIDIOC_REQBUFS", err))
    }
}

/// One driver buffer mapped into this process. Unmapped on drop.
pub struct MmapRegion {
    ptr: NonNull<u8>,
    len: usize,
}

impl AsRef<[u8]> for MmapRegion {
    fn as_ref(&self) -> &[u8] {
        // SAFETY: `ptr` points to `len` mapped bytes for as long as `self` lives.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl AsMut<[u8]> for MmapRegion {
    fn as_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees exclusive access.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        // SAFETY: the region was created by mmap with this exact length and
        // is unmapped only here.
        if let Err(err) = unsafe { v4l2::munmap(self.ptr.as_ptr().cast::<c_void>(), self.len) } {
            warn!("Unable to unmap buffer at {:p}: {err}", self.ptr.as_ptr());
        }
    }
}
