//! Color correction applied to decoded bayer frames.
//!
//! Stages run in a fixed order: gamma lookup, white balance (channel gains
//! followed by a 3x3 cross-channel matrix) and histogram based auto
//! brightness/contrast. Each stage works in place, row-parallel.

use rayon::prelude::*;
use serde::Deserialize;
use tracing::{debug, trace};

use crate::control::ControlSnapshot;
use crate::decode::ColorImage;

/// Lookup table mapping `i` to `round(255 * (i / 255)^gamma)`.
#[derive(Debug, Clone)]
pub struct GammaLut {
    gamma: f32,
    table: [u8; 256],
}

impl GammaLut {
    /// Build the table for `gamma`. Values below one brighten shadows,
    /// values above one darken them.
    pub fn new(gamma: f32) -> Self {
        let exponent = f64::from(gamma);
        let mut table = [0u8; 256];
        for (i, entry) in table.iter_mut().enumerate() {
            let value = (i as f64 / 255.0).powf(exponent) * 255.0;
            *entry = value.round().clamp(0.0, 255.0) as u8;
        }
        Self { gamma, table }
    }

    /// Exponent the table was built for.
    pub const fn gamma(&self) -> f32 {
        self.gamma
    }

    /// The 256 table entries.
    pub const fn table(&self) -> &[u8; 256] {
        &self.table
    }

    /// Whether the table maps every value to itself.
    pub fn is_identity(&self) -> bool {
        self.table.iter().enumerate().all(|(i, &v)| usize::from(v) == i)
    }

    /// Look up every sample of `image`.
    pub fn apply(&self, image: &mut ColorImage) {
        apply_table(image, &self.table);
    }
}

/// Per-channel gains applied before the color matrix.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct ChannelGains {
    /// Red multiplier.
    pub red: f32,
    /// Green multiplier.
    pub green: f32,
    /// Blue multiplier.
    pub blue: f32,
}

/// Mean value of each channel.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ChannelMeans {
    /// Red mean.
    pub red: f64,
    /// Green mean.
    pub green: f64,
    /// Blue mean.
    pub blue: f64,
}

/// Software white balance: fixed calibration gains, then a 3x3 matrix.
///
/// The defaults are the calibration of the Leopard USB3 bayer sensors.
/// Matrix rows produce red, green and blue from the gain-adjusted
/// `[red, green, blue]` column vector.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct WhiteBalance {
    /// Channel gains.
    pub gains: ChannelGains,
    /// Cross-channel correction matrix.
    pub matrix: [[f32; 3]; 3],
}

impl Default for WhiteBalance {
    fn default() -> Self {
        Self {
            gains: ChannelGains {
                red: 471.0 / 256.0,
                green: 403.0 / 256.0,
                blue: 267.0 / 256.0,
            },
            matrix: [
                [409.0 / 256.0, -137.0 / 256.0, -15.0 / 256.0],
                [-136.0 / 256.0, 468.0 / 256.0, -77.0 / 256.0],
                [4.0 / 256.0, -303.0 / 256.0, 554.0 / 256.0],
            ],
        }
    }
}

impl WhiteBalance {
    /// Correct `image` in place and return the channel means measured
    /// before correction.
    ///
    /// The gains are constants, so applying this twice compounds.
    pub fn apply(&self, image: &mut ColorImage) -> ChannelMeans {
        let means = channel_means(image);
        debug!(
            "white balance: means r={:.1} g={:.1} b={:.1}",
            means.red, means.green, means.blue
        );

        let gains = [self.gains.red, self.gains.green, self.gains.blue];
        let matrix = self.matrix;
        let row_len = image.width() as usize * 3;

        image.par_chunks_mut(row_len.max(3)).for_each(|row| {
            for px in row.chunks_exact_mut(3) {
                if let [r, g, b] = px {
                    let adjusted = [
                        f32::from(*r) * gains[0],
                        f32::from(*g) * gains[1],
                        f32::from(*b) * gains[2],
                    ];
                    let [out_r, out_g, out_b] = matrix.map(|coeffs| saturate(dot(coeffs, adjusted)));
                    *r = out_r;
                    *g = out_g;
                    *b = out_b;
                }
            }
        });

        means
    }
}

/// Per-channel means of an image.
pub fn channel_means(image: &ColorImage) -> ChannelMeans {
    let pixels = u64::from(image.width()) * u64::from(image.height());
    if pixels == 0 {
        return ChannelMeans::default();
    }

    let sums = image
        .par_chunks(3)
        .fold(
            || [0u64; 3],
            |mut acc, px| {
                for (sum, &v) in acc.iter_mut().zip(px) {
                    *sum += u64::from(v);
                }
                acc
            },
        )
        .reduce(
            || [0u64; 3],
            |a, b| [a[0] + b[0], a[1] + b[1], a[2] + b[2]],
        );

    let n = pixels as f64;
    ChannelMeans {
        red: sums[0] as f64 / n,
        green: sums[1] as f64 / n,
        blue: sums[2] as f64 / n,
    }
}

/// Gray levels and the linear stretch derived from them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContrastLevels {
    /// Darkest kept gray level.
    pub min_gray: u8,
    /// Brightest kept gray level.
    pub max_gray: u8,
    /// Gain, `255 / (max_gray - min_gray)`.
    pub alpha: f32,
    /// Offset, `-min_gray * alpha`.
    pub beta: f32,
}

/// Histogram-based auto brightness and contrast.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AutoContrast {
    /// Percent of the histogram mass cut off, split evenly between the dark
    /// and bright ends. Zero stretches the actual gray range.
    pub clip_percent: f32,
}

impl Default for AutoContrast {
    fn default() -> Self {
        Self { clip_percent: 1.0 }
    }
}

impl AutoContrast {
    /// Compute the stretch for `image`, or `None` when its gray range is
    /// empty after clipping.
    pub fn levels(&self, image: &ColorImage) -> Option<ContrastLevels> {
        let hist = gray_histogram(image);
        let (min_gray, max_gray) = if self.clip_percent <= 0.0 {
            let min = hist.iter().position(|&count| count > 0)?;
            let max = hist.iter().rposition(|&count| count > 0)?;
            (min, max)
        } else {
            clipped_range(&hist, self.clip_percent)?
        };

        if max_gray <= min_gray {
            return None;
        }

        let alpha = 255.0 / (max_gray - min_gray) as f32;
        let beta = -(min_gray as f32) * alpha;
        Some(ContrastLevels {
            min_gray: min_gray as u8,
            max_gray: max_gray as u8,
            alpha,
            beta,
        })
    }

    /// Stretch `image` in place. Returns the levels used, if any.
    pub fn apply(&self, image: &mut ColorImage) -> Option<ContrastLevels> {
        let levels = self.levels(image)?;
        trace!(
            "auto contrast: gray {}..{} alpha {:.3} beta {:.1}",
            levels.min_gray,
            levels.max_gray,
            levels.alpha,
            levels.beta
        );

        let mut table = [0u8; 256];
        for (i, entry) in table.iter_mut().enumerate() {
            *entry = saturate(levels.alpha.mul_add(i as f32, levels.beta));
        }
        apply_table(image, &table);
        Some(levels)
    }
}

/// Locate the gray levels cutting `clip_percent / 2` of the mass on each side.
fn clipped_range(hist: &[u32; 256], clip_percent: f32) -> Option<(usize, usize)> {
    let mut accumulator = [0f64; 256];
    let mut running = 0f64;
    for (acc, &count) in accumulator.iter_mut().zip(hist) {
        running += f64::from(count);
        *acc = running;
    }

    let total = running;
    if total <= 0.0 {
        return None;
    }
    let clip = f64::from(clip_percent) * total / 100.0 / 2.0;

    let min_gray = accumulator.iter().position(|&acc| acc >= clip)?;
    let max_gray = accumulator.iter().rposition(|&acc| acc < total - clip)?;
    Some((min_gray, max_gray))
}

/// Histogram of the image's gray levels.
///
/// Gray is the BT.601 luma, computed in 14-bit fixed point.
pub fn gray_histogram(image: &ColorImage) -> [u32; 256] {
    let row_len = (image.width() as usize * 3).max(3);
    image
        .par_chunks(row_len)
        .fold(
            || [0u32; 256],
            |mut hist, row| {
                for px in row.chunks_exact(3) {
                    if let [r, g, b] = *px {
                        if let Some(bin) = hist.get_mut(usize::from(gray_level(r, g, b))) {
                            *bin += 1;
                        }
                    }
                }
                hist
            },
        )
        .reduce(
            || [0u32; 256],
            |mut a, b| {
                for (x, y) in a.iter_mut().zip(b) {
                    *x += y;
                }
                a
            },
        )
}

/// BT.601 luma of one pixel.
#[inline]
pub fn gray_level(r: u8, g: u8, b: u8) -> u8 {
    let weighted = u32::from(r) * 4899 + u32::from(g) * 9617 + u32::from(b) * 1868;
    ((weighted + (1 << 13)) >> 14) as u8
}

/// Tunables for [`ColorPipeline`], usually read from the config file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ColorConfig {
    /// Histogram clip for auto contrast, in percent.
    pub clip_percent: f32,
    /// White balance calibration.
    pub white_balance: WhiteBalance,
}

impl Default for ColorConfig {
    fn default() -> Self {
        Self {
            clip_percent: AutoContrast::default().clip_percent,
            white_balance: WhiteBalance::default(),
        }
    }
}

/// The correction chain for bayer frames.
#[derive(Debug, Clone)]
pub struct ColorPipeline {
    gamma: GammaLut,
    white_balance: WhiteBalance,
    auto_contrast: AutoContrast,
}

impl Default for ColorPipeline {
    fn default() -> Self {
        Self::new(ColorConfig::default())
    }
}

impl ColorPipeline {
    /// Build a pipeline from config.
    pub fn new(config: ColorConfig) -> Self {
        Self {
            gamma: GammaLut::new(1.0),
            white_balance: config.white_balance,
            auto_contrast: AutoContrast {
                clip_percent: config.clip_percent,
            },
        }
    }

    /// Run gamma, then white balance and auto contrast when enabled.
    ///
    /// The gamma table is rebuilt only when the requested exponent changes.
    pub fn process(&mut self, image: &mut ColorImage, controls: &ControlSnapshot) {
        if self.gamma.gamma().to_bits() != controls.gamma.to_bits() {
            debug!("gamma changed to {}", controls.gamma);
            self.gamma = GammaLut::new(controls.gamma);
        }
        if !self.gamma.is_identity() {
            self.gamma.apply(image);
        }

        if controls.white_balance {
            self.white_balance.apply(image);
        }

        if controls.auto_contrast {
            self.auto_contrast.apply(image);
        }
    }

    /// Current gamma table.
    pub const fn gamma_lut(&self) -> &GammaLut {
        &self.gamma
    }
}

fn apply_table(image: &mut ColorImage, table: &[u8; 256]) {
    let row_len = (image.width() as usize * 3).max(3);
    image.par_chunks_mut(row_len).for_each(|row| {
        for v in row.iter_mut() {
            if let Some(&mapped) = table.get(usize::from(*v)) {
                *v = mapped;
            }
        }
    });
}

fn dot(coeffs: [f32; 3], values: [f32; 3]) -> f32 {
    coeffs
        .iter()
        .zip(values)
        .map(|(c, v)| c * v)
        .sum()
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn saturate(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}
