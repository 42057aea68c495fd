//! Capture control flags shared with an external control surface.
//!
//! The flags live in a `MAP_SHARED | MAP_ANONYMOUS` page so a forked control
//! process writes the same memory the capture loop reads. Every field is an
//! atomic; nothing here blocks.

#![allow(unsafe_code)]

use std::fmt;
use std::mem;
use std::ptr::{self, NonNull};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use serde::Deserialize;

use crate::decode::SampleFormat;
use crate::error::{CameraError, Result};

/// Bayer color-filter arrangement of the sensor.
///
/// Names follow the common conversion-code convention: they spell the
/// second and third pixel of the second row, not the top-left 2x2 tile.
/// `Bg` is therefore an RGGB sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BayerPattern {
    /// RGGB tile.
    Bg,
    /// GRBG tile.
    Gb,
    /// BGGR tile.
    #[default]
    Rg,
    /// GBRG tile.
    Gr,
}

impl BayerPattern {
    /// All patterns in flag order.
    pub const ALL: [Self; 4] = [Self::Bg, Self::Gb, Self::Rg, Self::Gr];

    /// Map a control flag (`1..=4`) to a pattern. Anything else selects the
    /// default, `Rg`.
    pub fn from_flag(flag: u32) -> Self {
        match flag {
            1 => Self::Bg,
            2 => Self::Gb,
            4 => Self::Gr,
            _ => Self::Rg,
        }
    }

    /// Control flag value for this pattern.
    pub const fn flag(self) -> u32 {
        self.index() as u32 + 1
    }

    /// Position in the pattern family (`Bg` = 0 .. `Gr` = 3).
    pub const fn index(self) -> usize {
        match self {
            Self::Bg => 0,
            Self::Gb => 1,
            Self::Rg => 2,
            Self::Gr => 3,
        }
    }

    /// Filter arrangement understood by the demosaic routine.
    pub const fn cfa(self) -> bayer::CFA {
        match self {
            Self::Bg => bayer::CFA::RGGB,
            Self::Gb => bayer::CFA::GRBG,
            Self::Rg => bayer::CFA::BGGR,
            Self::Gr => bayer::CFA::GBRG,
        }
    }
}

impl FromStr for BayerPattern {
    type Err = CameraError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "1" | "bg" | "rggb" => Ok(Self::Bg),
            "2" | "gb" | "grbg" => Ok(Self::Gb),
            "3" | "rg" | "bggr" => Ok(Self::Rg),
            "4" | "gr" | "gbrg" => Ok(Self::Gr),
            other => Err(CameraError::InvalidControl(format!(
                "unknown bayer pattern '{other}'"
            ))),
        }
    }
}

impl fmt::Display for BayerPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Bg => "BG",
            Self::Gb => "GB",
            Self::Rg => "RG",
            Self::Gr => "GR",
        };
        f.write_str(name)
    }
}

/// Control values read once per frame by the capture loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlSnapshot {
    /// Sensor sample format, which selects the bit shift.
    pub format: SampleFormat,
    /// Bayer pattern used for demosaicing.
    pub bayer: BayerPattern,
    /// Software white balance enabled.
    pub white_balance: bool,
    /// Auto brightness/contrast enabled.
    pub auto_contrast: bool,
    /// Gamma exponent.
    pub gamma: f32,
}

impl Default for ControlSnapshot {
    fn default() -> Self {
        Self {
            format: SampleFormat::Raw10,
            bayer: BayerPattern::Rg,
            white_balance: false,
            auto_contrast: false,
            gamma: 1.0,
        }
    }
}

#[repr(C)]
struct ControlBlock {
    save_still: AtomicBool,
    save_raw: AtomicBool,
    white_balance: AtomicBool,
    auto_contrast: AtomicBool,
    bayer_flag: AtomicU32,
    shift_flag: AtomicU32,
    gamma_bits: AtomicU32,
}

/// Control flags in memory shared across process boundaries.
pub struct SharedControls {
    block: NonNull<ControlBlock>,
}

// SAFETY: the block holds only atomics and is unmapped only on drop.
unsafe impl Send for SharedControls {}
// SAFETY: as above; all access goes through atomic operations.
unsafe impl Sync for SharedControls {}

impl SharedControls {
    /// Map a fresh shared control page and seed it from `initial`.
    pub fn new(initial: &ControlSnapshot) -> Result<Self> {
        // SAFETY: anonymous mapping, no fd or offset involved.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mem::size_of::<ControlBlock>(),
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(CameraError::Io(std::io::Error::last_os_error()));
        }

        let block = NonNull::new(addr.cast::<ControlBlock>()).ok_or_else(|| {
            CameraError::Io(std::io::Error::other("mmap returned a null address"))
        })?;

        // Anonymous pages are zero filled, which is a valid ControlBlock.
        let controls = Self { block };
        controls.set_bit_shift_mode(initial.format);
        controls.set_bayer_pattern(initial.bayer);
        controls.set_white_balance_enabled(initial.white_balance);
        controls.set_auto_contrast_enabled(initial.auto_contrast);
        controls.set_gamma(initial.gamma)?;
        Ok(controls)
    }

    fn block(&self) -> &ControlBlock {
        // SAFETY: the mapping is valid and page aligned until drop.
        unsafe { self.block.as_ref() }
    }

    /// Ask for the next decoded frame to be saved as a bitmap.
    pub fn request_save_still(&self) {
        self.block().save_still.store(true, Ordering::Release);
    }

    /// Ask for the next dequeued buffer to be saved verbatim.
    pub fn request_save_raw(&self) {
        self.block().save_raw.store(true, Ordering::Release);
    }

    /// Consume a pending still request. Returns whether one was pending.
    pub fn take_save_still(&self) -> bool {
        self.block().save_still.swap(false, Ordering::AcqRel)
    }

    /// Consume a pending raw request. Returns whether one was pending.
    pub fn take_save_raw(&self) -> bool {
        self.block().save_raw.swap(false, Ordering::AcqRel)
    }

    /// Enable or disable software white balance.
    pub fn set_white_balance_enabled(&self, enabled: bool) {
        self.block().white_balance.store(enabled, Ordering::Release);
    }

    /// Enable or disable auto brightness and contrast.
    pub fn set_auto_contrast_enabled(&self, enabled: bool) {
        self.block().auto_contrast.store(enabled, Ordering::Release);
    }

    /// Set the gamma exponent. Must be finite and positive.
    pub fn set_gamma(&self, gamma: f32) -> Result<()> {
        if !gamma.is_finite() || gamma <= 0.0 {
            return Err(CameraError::InvalidControl(format!(
                "gamma must be positive, got {gamma}"
            )));
        }
        self.block()
            .gamma_bits
            .store(gamma.to_bits(), Ordering::Release);
        Ok(())
    }

    /// Select the sensor sample format (RAW10, RAW12 or YUV422).
    pub fn set_bit_shift_mode(&self, format: SampleFormat) {
        self.block()
            .shift_flag
            .store(format.flag(), Ordering::Release);
    }

    /// Select the bayer pattern.
    pub fn set_bayer_pattern(&self, pattern: BayerPattern) {
        self.block()
            .bayer_flag
            .store(pattern.flag(), Ordering::Release);
    }

    /// Store a raw bayer flag as a control surface would. Unknown values are
    /// kept and read back as the default pattern.
    pub fn set_bayer_flag(&self, flag: u32) {
        self.block().bayer_flag.store(flag, Ordering::Release);
    }

    /// Read every non one-shot control.
    pub fn snapshot(&self) -> ControlSnapshot {
        let block = self.block();
        let gamma = f32::from_bits(block.gamma_bits.load(Ordering::Acquire));
        ControlSnapshot {
            format: SampleFormat::from_flag(block.shift_flag.load(Ordering::Acquire)),
            bayer: BayerPattern::from_flag(block.bayer_flag.load(Ordering::Acquire)),
            white_balance: block.white_balance.load(Ordering::Acquire),
            auto_contrast: block.auto_contrast.load(Ordering::Acquire),
            gamma: if gamma > 0.0 { gamma } else { 1.0 },
        }
    }
}

impl fmt::Debug for SharedControls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedControls")
            .field("snapshot", &self.snapshot())
            .finish_non_exhaustive()
    }
}

impl Drop for SharedControls {
    fn drop(&mut self) {
        // SAFETY: mapped in `new` with this size and unmapped only here.
        unsafe {
            libc::munmap(
                self.block.as_ptr().cast::<libc::c_void>(),
                mem::size_of::<ControlBlock>(),
            );
        }
    }
}
