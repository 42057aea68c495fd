//! TOML configuration for the capture binary.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::color::ColorConfig;
use crate::control::{BayerPattern, ControlSnapshot};
use crate::decode::SampleFormat;
use crate::store::DEFAULT_PREFIX;
use crate::traits::{Format, FourCC};

/// Configuration loading errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not valid TOML for this schema.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Complete configuration. Every section is optional.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Capture device settings.
    pub device: DeviceConfig,
    /// Output settings.
    pub capture: CaptureConfig,
    /// Initial control values.
    pub controls: ControlsConfig,
    /// Color correction tunables.
    pub color: ColorConfig,
}

/// `[device]` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Opens `/dev/video<index>`.
    pub index: usize,
    /// Requested frame width.
    pub width: u32,
    /// Requested frame height.
    pub height: u32,
    /// Requested pixel format code, e.g. `"Y16"` or `"YUYV"`.
    pub pixel_format: String,
    /// Buffers to request from the driver.
    pub buffer_count: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            index: 0,
            width: 1920,
            height: 1080,
            pixel_format: "Y16".to_owned(),
            buffer_count: 4,
        }
    }
}

impl DeviceConfig {
    /// The format to negotiate with the driver.
    pub fn requested_format(&self) -> Result<Format, ConfigError> {
        let fourcc = FourCC::parse(&self.pixel_format).ok_or_else(|| {
            ConfigError::Invalid(format!("bad pixel format {:?}", self.pixel_format))
        })?;
        Ok(Format::new(self.width, self.height, fourcc))
    }
}

/// `[capture]` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Directory for saved raw buffers and stills.
    pub output_dir: PathBuf,
    /// File name prefix.
    pub file_prefix: String,
    /// Stop after this many frames.
    pub max_frames: Option<u64>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            file_prefix: DEFAULT_PREFIX.to_owned(),
            max_frames: None,
        }
    }
}

/// `[controls]` section.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ControlsConfig {
    /// Gamma exponent.
    pub gamma: f32,
    /// Bayer pattern.
    pub bayer: BayerPattern,
    /// Sample format of the sensor.
    pub mode: SampleFormat,
    /// Start with white balance enabled.
    pub white_balance: bool,
    /// Start with auto contrast enabled.
    pub auto_contrast: bool,
}

impl Default for ControlsConfig {
    fn default() -> Self {
        let defaults = ControlSnapshot::default();
        Self {
            gamma: defaults.gamma,
            bayer: defaults.bayer,
            mode: defaults.format,
            white_balance: defaults.white_balance,
            auto_contrast: defaults.auto_contrast,
        }
    }
}

impl ControlsConfig {
    /// Initial values for the shared controls.
    pub const fn snapshot(&self) -> ControlSnapshot {
        ControlSnapshot {
            format: self.mode,
            bayer: self.bayer,
            white_balance: self.white_balance,
            auto_contrast: self.auto_contrast,
            gamma: self.gamma,
        }
    }
}

impl Config {
    /// Load and validate a config file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Load `path` if given, otherwise use the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        path.map_or_else(|| Ok(Self::default()), Self::load)
    }

    /// Parse and validate TOML text.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device.width == 0 || self.device.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "frame size {}x{} must be positive",
                self.device.width, self.device.height
            )));
        }
        if self.device.buffer_count == 0 {
            return Err(ConfigError::Invalid("buffer_count must be positive".to_owned()));
        }
        self.device.requested_format()?;

        if !self.controls.gamma.is_finite() || self.controls.gamma <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "gamma {} must be positive",
                self.controls.gamma
            )));
        }
        if !(0.0..100.0).contains(&self.color.clip_percent) {
            return Err(ConfigError::Invalid(format!(
                "clip_percent {} must be in [0, 100)",
                self.color.clip_percent
            )));
        }
        if self.capture.max_frames == Some(0) {
            return Err(ConfigError::Invalid("max_frames must be positive".to_owned()));
        }
        Ok(())
    }
}
