//! Checks that decoded frames show known test patterns.
//!
//! Used by the mock-driven unit tests and by the integration tests against
//! the vivid virtual camera.

use crate::decode::ColorImage;
use crate::error::{CameraError, Result};
use crate::traits::FrameMetadata;

/// Expected RGB values for the 8 SMPTE color bars after BT.601 decoding.
///
/// Colors in order: White, Yellow, Cyan, Green, Magenta, Red, Blue, Black
const SMPTE_COLOR_BARS: [[u8; 3]; 8] = [
    [235, 235, 235], // White
    [235, 235, 11],  // Yellow
    [12, 236, 237],  // Cyan
    [13, 237, 13],   // Green
    [237, 13, 237],  // Magenta
    [238, 14, 13],   // Red
    [15, 15, 239],   // Blue
    [16, 16, 16],    // Black
];

/// Per-channel tolerance for color matching.
const COLOR_TOLERANCE: u8 = 15;

/// Minimum luma rise across a gradient frame.
const MIN_GRADIENT_RISE: f32 = 50.0;

fn pixel(image: &ColorImage, x: u32, y: u32) -> Result<[u8; 3]> {
    image
        .get_pixel_checked(x, y)
        .map(|p| p.0)
        .ok_or_else(|| CameraError::PatternMismatch(format!("no pixel at ({x}, {y})")))
}

/// Check the center of each of the 8 vertical bars.
///
/// # Errors
///
/// Returns `PatternMismatch` if any bar differs from its expected color by
/// more than the tolerance.
pub fn validate_color_bars(image: &ColorImage) -> Result<()> {
    let bar_width = image.width() / 8;
    let center_y = image.height() / 2;
    if bar_width == 0 {
        return Err(CameraError::PatternMismatch(format!(
            "image {} pixels wide is too narrow for 8 bars",
            image.width()
        )));
    }

    for (bar_idx, expected) in (0u32..).zip(SMPTE_COLOR_BARS.iter()) {
        let sample_x = bar_idx * bar_width + bar_width / 2;
        let actual = pixel(image, sample_x, center_y)?;

        if !colors_match(actual, *expected, COLOR_TOLERANCE) {
            return Err(CameraError::PatternMismatch(format!(
                "color bar {bar_idx} at ({sample_x}, {center_y}): \
                 expected {expected:?}, got {actual:?}"
            )));
        }
    }

    Ok(())
}

/// Check that luma rises left to right along the center row.
///
/// Small dips from rounding are tolerated; the total rise must be at
/// least 50 levels.
///
/// # Errors
///
/// Returns `PatternMismatch` if luma drops or the frame is nearly flat.
pub fn validate_gradient(image: &ColorImage) -> Result<()> {
    let center_y = image.height() / 2;
    let mut first: Option<f32> = None;
    let mut prev: Option<f32> = None;

    for x in (0..image.width()).step_by(10) {
        let [r, g, b] = pixel(image, x, center_y)?;
        // Rec. 601 luma
        let luma = 0.114f32.mul_add(
            f32::from(b),
            0.587f32.mul_add(f32::from(g), 0.299 * f32::from(r)),
        );

        if let Some(prev) = prev {
            if luma < prev - 1.0 {
                return Err(CameraError::PatternMismatch(format!(
                    "gradient drops at x={x}: {luma} < {prev}"
                )));
            }
        }
        first.get_or_insert(luma);
        prev = Some(luma);
    }

    let rise = prev.zip(first).map_or(0.0, |(last, first)| last - first);
    if rise < MIN_GRADIENT_RISE {
        return Err(CameraError::PatternMismatch(format!(
            "gradient rises only {rise} (expected at least {MIN_GRADIENT_RISE})"
        )));
    }

    Ok(())
}

/// Check that frame sequence numbers increase by exactly one.
///
/// # Errors
///
/// Returns `PatternMismatch` for an empty slice or any gap.
pub fn validate_frame_sequence(frames: &[FrameMetadata]) -> Result<()> {
    if frames.is_empty() {
        return Err(CameraError::PatternMismatch(
            "cannot validate an empty frame sequence".to_owned(),
        ));
    }

    for (i, pair) in frames.windows(2).enumerate() {
        if let [prev, curr] = pair {
            if curr.sequence != prev.sequence.wrapping_add(1) {
                return Err(CameraError::PatternMismatch(format!(
                    "sequence gap after frame {i}: expected {}, got {}",
                    prev.sequence.wrapping_add(1),
                    curr.sequence
                )));
            }
        }
    }

    Ok(())
}

/// Whether every channel of `actual` is within `tolerance` of `expected`.
pub fn colors_match(actual: [u8; 3], expected: [u8; 3], tolerance: u8) -> bool {
    actual
        .iter()
        .zip(expected)
        .all(|(a, e)| a.abs_diff(e) <= tolerance)
}
