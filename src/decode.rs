//! Raw buffer to RGB decoding.
//!
//! Bayer sensors deliver one little-endian 16-bit sample per pixel. Samples
//! are reduced to 8 bits (black level removed, then shifted by the sensor bit
//! depth) and demosaiced. YUV422 sensors deliver packed YUYV which is
//! converted directly.

use std::fmt;
use std::io::Cursor;
use std::str::FromStr;

use bayer::{BayerDepth, Demosaic, RasterDepth, RasterMut};
use image::RgbImage;
use rayon::prelude::*;
use serde::Deserialize;

use crate::control::BayerPattern;
use crate::error::{CameraError, Result};

/// Decoded frame: 8-bit RGB, width x height.
pub type ColorImage = RgbImage;

/// Fixed sensor bias removed before scaling raw samples.
pub const BLACK_LEVEL: u16 = 64;

/// Sample layout of the sensor payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    /// 10-bit bayer samples in 16-bit words.
    #[default]
    Raw10,
    /// 12-bit bayer samples in 16-bit words.
    Raw12,
    /// Packed YUYV 4:2:2.
    Yuv422,
}

impl SampleFormat {
    /// Map a control flag to a format: `1` RAW10, `2` RAW12, `3` YUV422.
    /// Unknown values fall back to RAW10.
    pub const fn from_flag(flag: u32) -> Self {
        match flag {
            2 => Self::Raw12,
            3 => Self::Yuv422,
            _ => Self::Raw10,
        }
    }

    /// Control flag value for this format.
    pub const fn flag(self) -> u32 {
        match self {
            Self::Raw10 => 1,
            Self::Raw12 => 2,
            Self::Yuv422 => 3,
        }
    }

    /// Bits discarded to reach 8-bit intensity. Zero selects the YUV path.
    pub const fn shift(self) -> u32 {
        match self {
            Self::Raw10 => 2,
            Self::Raw12 => 4,
            Self::Yuv422 => 0,
        }
    }

    /// Whether frames in this format go through demosaicing.
    pub const fn is_bayer(self) -> bool {
        self.shift() != 0
    }
}

impl FromStr for SampleFormat {
    type Err = CameraError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "1" | "raw10" => Ok(Self::Raw10),
            "2" | "raw12" => Ok(Self::Raw12),
            "3" | "yuv422" | "yuyv" => Ok(Self::Yuv422),
            other => Err(CameraError::InvalidControl(format!(
                "unknown sample format '{other}'"
            ))),
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Raw10 => "RAW10",
            Self::Raw12 => "RAW12",
            Self::Yuv422 => "YUV422",
        };
        f.write_str(name)
    }
}

/// Reduce one raw sample to 8 bits.
///
/// Samples at or below the black level clip to zero. Results that do not fit
/// in 8 bits (only possible with out-of-range input) saturate at 255.
#[inline]
pub fn unshift_sample(sample: u16, shift: u32) -> u8 {
    if sample > BLACK_LEVEL {
        ((sample - BLACK_LEVEL) >> shift).min(255) as u8
    } else {
        0
    }
}

/// Borrowed view of one dequeued buffer, valid for a single decode call.
#[derive(Debug, Clone, Copy)]
pub struct RawFrame<'a> {
    data: &'a [u8],
    width: u32,
    height: u32,
    stride: usize,
    format: SampleFormat,
}

impl<'a> RawFrame<'a> {
    /// Wrap tightly packed buffer bytes, checking that the geometry fits them.
    ///
    /// Both layouts use two bytes per pixel. Trailing bytes beyond
    /// `width * height * 2` are ignored.
    pub fn new(data: &'a [u8], width: u32, height: u32, format: SampleFormat) -> Result<Self> {
        Self::with_stride(data, width, height, 0, format)
    }

    /// Wrap buffer bytes whose lines are `stride` bytes apart. A stride of
    /// zero means the lines are tightly packed.
    pub fn with_stride(
        data: &'a [u8],
        width: u32,
        height: u32,
        stride: u32,
        format: SampleFormat,
    ) -> Result<Self> {
        let invalid = |reason: String| CameraError::InvalidDimensions {
            width,
            height,
            reason,
        };

        if width == 0 || height == 0 {
            return Err(invalid("dimensions must be positive".to_owned()));
        }
        if format.is_bayer() && (width < 2 || height < 2) {
            return Err(invalid("bayer frames need at least 2x2 pixels".to_owned()));
        }
        if !format.is_bayer() && width % 2 != 0 {
            return Err(invalid("YUYV frames need an even width".to_owned()));
        }

        let line = (width as usize)
            .checked_mul(2)
            .ok_or_else(|| invalid("frame size overflows".to_owned()))?;
        let stride = match stride as usize {
            0 => line,
            stride if stride < line => {
                return Err(invalid(format!(
                    "{stride} bytes per line cannot hold {line}"
                )));
            }
            stride => stride,
        };

        // The last line needs no padding after it
        let required = stride
            .checked_mul(height as usize - 1)
            .and_then(|bytes| bytes.checked_add(line))
            .ok_or_else(|| invalid("frame size overflows".to_owned()))?;
        let data = data.get(..required).ok_or_else(|| {
            invalid(format!(
                "buffer holds {} bytes, {required} required",
                data.len()
            ))
        })?;

        Ok(Self {
            data,
            width,
            height,
            stride,
            format,
        })
    }

    /// Frame bytes, trimmed to the declared geometry. Line padding is kept.
    pub const fn data(&self) -> &[u8] {
        self.data
    }

    /// Bytes from the start of one line to the start of the next.
    pub const fn stride(&self) -> usize {
        self.stride
    }

    /// Width in pixels.
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels.
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// Declared sample format.
    pub const fn format(&self) -> SampleFormat {
        self.format
    }
}

/// Converts raw frames to [`ColorImage`]s.
///
/// Keeps its 8-bit scratch plane between frames so steady-state decoding
/// does not reallocate it.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    mono: Vec<u8>,
}

impl FrameDecoder {
    /// Create a decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one frame. `pattern` is ignored on the YUV path.
    pub fn decode(&mut self, frame: &RawFrame<'_>, pattern: BayerPattern) -> Result<ColorImage> {
        if frame.format.is_bayer() {
            self.decode_bayer(frame, pattern)
        } else {
            decode_yuv422(frame)
        }
    }

    /// Unshifted 8-bit plane from the last bayer decode.
    pub fn mono_plane(&self) -> &[u8] {
        &self.mono
    }

    fn decode_bayer(&mut self, frame: &RawFrame<'_>, pattern: BayerPattern) -> Result<ColorImage> {
        let width = frame.width as usize;
        let height = frame.height as usize;
        let shift = frame.format.shift();

        self.mono.clear();
        self.mono.resize(width * height, 0);
        self.mono
            .par_chunks_mut(width)
            .zip(frame.data.par_chunks(frame.stride))
            .for_each(|(dst, src)| {
                for (out, sample) in dst.iter_mut().zip(src.chunks_exact(2)) {
                    if let [lo, hi] = *sample {
                        *out = unshift_sample(u16::from_le_bytes([lo, hi]), shift);
                    }
                }
            });

        let mut rgb = vec![0u8; width * height * 3];
        let mut raster = RasterMut::new(width, height, RasterDepth::Depth8, &mut rgb);
        bayer::run_demosaic(
            &mut Cursor::new(self.mono.as_slice()),
            BayerDepth::Depth8,
            pattern.cfa(),
            Demosaic::Linear,
            &mut raster,
        )
        .map_err(|err| CameraError::Demosaic(format!("{err:?}")))?;

        into_image(frame, rgb)
    }
}

fn decode_yuv422(frame: &RawFrame<'_>) -> Result<ColorImage> {
    let width = frame.width as usize;
    let height = frame.height as usize;

    let mut rgb = vec![0u8; width * height * 3];
    rgb.par_chunks_mut(width * 3)
        .zip(frame.data.par_chunks(frame.stride))
        .for_each(|(dst, src)| {
            // YUYV format: [Y0 U Y1 V] repeats, each pair shares U and V
            for (out, pair) in dst.chunks_exact_mut(6).zip(src.chunks_exact(4)) {
                if let [y0, u, y1, v] = *pair {
                    let (r0, g0, b0) = yuv_to_rgb(y0, u, v);
                    let (r1, g1, b1) = yuv_to_rgb(y1, u, v);
                    out.copy_from_slice(&[r0, g0, b0, r1, g1, b1]);
                }
            }
        });

    into_image(frame, rgb)
}

fn into_image(frame: &RawFrame<'_>, rgb: Vec<u8>) -> Result<ColorImage> {
    RgbImage::from_raw(frame.width, frame.height, rgb).ok_or_else(|| {
        CameraError::InvalidDimensions {
            width: frame.width,
            height: frame.height,
            reason: "decoded plane does not match frame size".to_owned(),
        }
    })
}

/// Convert YUV values to RGB.
///
/// Uses the ITU-R BT.601 conversion formula.
///
/// # Arguments
///
/// * `y` - Luminance value (16-235 for studio range)
/// * `u` - Blue-difference chroma value (16-240)
/// * `v` - Red-difference chroma value (16-240)
///
/// # Returns
///
/// RGB tuple with values clamped to 0-255 range.
#[must_use]
#[allow(clippy::many_single_char_names)]
pub fn yuv_to_rgb(y: u8, u: u8, v: u8) -> (u8, u8, u8) {
    let y_f = f32::from(y);
    let u_f = f32::from(u) - 128.0;
    let v_f = f32::from(v) - 128.0;

    let r = 1.402f32.mul_add(v_f, y_f);
    let g = 0.714_14f32.mul_add(-v_f, 0.344_14f32.mul_add(-u_f, y_f));
    let b = 1.772f32.mul_add(u_f, y_f);

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let clamp = |val: f32| -> u8 { val.clamp(0.0, 255.0) as u8 };

    (clamp(r), clamp(g), clamp(b))
}
