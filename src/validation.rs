//! Frame validation utilities for test pattern verification.
//!
//! These check that delivered frames carry the patterns the mock driver (or
//! a virtual V4L2 camera) writes. Dimensions are taken from each frame's
//! delivery metadata.

use thiserror::Error;

use crate::error::Error;
use crate::frame::{Frame, FramePtr};

/// Expected RGB values for SMPTE color bars (8 bars).
///
/// These are the RGB values resulting from converting the YUV values
/// used by the mock driver's color bar pattern.
///
/// Colors in order: White, Yellow, Cyan, Green, Magenta, Red, Blue, Black
const SMPTE_COLOR_BARS: [(u8, u8, u8); 8] = [
    (235, 235, 235), // White
    (235, 235, 11),  // Yellow
    (12, 236, 237),  // Cyan
    (13, 237, 13),   // Green
    (237, 13, 237),  // Magenta
    (238, 14, 13),   // Red
    (15, 15, 239),   // Blue
    (16, 16, 16),    // Black
];

/// Tolerance for RGB color matching (accounts for YUV->RGB conversion errors).
const COLOR_TOLERANCE: u32 = 15;

/// Why a frame failed validation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The frame could not be read.
    #[error("frame unreadable: {0}")]
    Frame(#[from] Error),

    /// The content does not match the expected pattern.
    #[error("pattern mismatch: {0}")]
    Mismatch(String),
}

/// Result type for validation helpers.
pub type Result<T> = std::result::Result<T, ValidationError>;

fn sample(frame: &Frame, x: u32, y: u32) -> Result<(u8, u8, u8)> {
    frame
        .pixel_at(x, y)?
        .ok_or_else(|| ValidationError::Mismatch(format!("no pixel at ({x}, {y})")))
}

/// Validates that a frame contains the SMPTE color bar pattern.
///
/// Checks 8 vertical stripes at their center positions, allowing for
/// YUV-to-RGB conversion inaccuracies.
///
/// # Errors
///
/// Returns `Frame` if the frame has no image or dimensions, and `Mismatch`
/// if any color bar doesn't match the expected color within tolerance.
pub fn validate_color_bars(frame: &Frame) -> Result<()> {
    let bar_width = frame.width()? / 8;
    let center_y = frame.height()? / 2;

    for (bar_idx, expected_rgb) in (0u32..).zip(SMPTE_COLOR_BARS.iter()) {
        let sample_x = bar_idx * bar_width + bar_width / 2;
        let actual_rgb = sample(frame, sample_x, center_y)?;

        if !colors_match(actual_rgb, *expected_rgb, COLOR_TOLERANCE) {
            return Err(ValidationError::Mismatch(format!(
                "color bar {bar_idx} at ({sample_x}, {center_y}): \
                 expected RGB{expected_rgb:?}, got RGB{actual_rgb:?}"
            )));
        }
    }

    Ok(())
}

/// Validates that a frame contains a horizontal gradient pattern.
///
/// Samples the center row every 10 pixels; luminance must not fall from
/// left to right and must rise by at least 50 overall.
///
/// # Errors
///
/// Returns `Frame` if the frame has no image or dimensions, and `Mismatch`
/// if the luminance decreases or barely changes (solid color).
pub fn validate_gradient(frame: &Frame) -> Result<()> {
    let width = frame.width()?;
    let center_y = frame.height()? / 2;

    let mut first_luminance: Option<f32> = None;
    let mut prev_luminance: Option<f32> = None;

    for x in (0..width).step_by(10) {
        let (r, g, b) = sample(frame, x, center_y)?;

        // Rec. 601 luma
        let luminance = 0.114f32.mul_add(
            f32::from(b),
            0.587f32.mul_add(f32::from(g), 0.299 * f32::from(r)),
        );

        first_luminance.get_or_insert(luminance);
        if let Some(prev) = prev_luminance {
            // Allow small decreases due to rounding
            if luminance < prev - 1.0 {
                return Err(ValidationError::Mismatch(format!(
                    "gradient falls at x={x}: luminance {luminance} < previous {prev}"
                )));
            }
        }
        prev_luminance = Some(luminance);
    }

    if let (Some(first), Some(last)) = (first_luminance, prev_luminance) {
        let luminance_change = last - first;
        if luminance_change < 50.0 {
            return Err(ValidationError::Mismatch(format!(
                "luminance change {luminance_change} too small for a gradient"
            )));
        }
    }

    Ok(())
}

/// Validates that frame ids increment by exactly one.
///
/// # Errors
///
/// Returns `Mismatch` for an empty slice or a gap, and `Frame` if a frame
/// carries no frame id.
pub fn validate_frame_sequence(frames: &[FramePtr]) -> Result<()> {
    if frames.is_empty() {
        return Err(ValidationError::Mismatch(
            "cannot validate empty frame sequence".to_owned(),
        ));
    }

    let ids = frames
        .iter()
        .map(|frame| frame.frame_id())
        .collect::<std::result::Result<Vec<_>, _>>()?;

    for (index, pair) in ids.windows(2).enumerate() {
        if let &[prev, curr] = pair {
            if curr != prev + 1 {
                return Err(ValidationError::Mismatch(format!(
                    "frame id gap at index {}: expected {}, got {curr}",
                    index + 1,
                    prev + 1
                )));
            }
        }
    }

    Ok(())
}

/// Returns `true` if all three channels are within `tolerance`.
fn colors_match(actual: (u8, u8, u8), expected: (u8, u8, u8), tolerance: u32) -> bool {
    let (ar, ag, ab) = actual;
    let (er, eg, eb) = expected;

    u32::from(ar.abs_diff(er)) <= tolerance
        && u32::from(ag.abs_diff(eg)) <= tolerance
        && u32::from(ab.abs_diff(eb)) <= tolerance
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{Format, FourCC};
    use crate::frame::{AllocationMode, FrameDelivery, FrameStatus};
    use crate::mock::{fill_pattern, TestPattern};

    fn delivered(format: &Format, pattern: TestPattern, frame_id: u64) -> FramePtr {
        let size = format.size as usize;
        let frame = Frame::new(size, AllocationMode::AnnounceFrame, 1).expect("frame should allocate");
        frame
            .with_buffer_mut(|buffer| fill_pattern(buffer, format, pattern))
            .expect("buffer should be writable");
        frame
            .complete(
                FrameDelivery::new(FrameStatus::Complete)
                    .with_dimension(format.width, format.height)
                    .with_frame_id(frame_id)
                    .with_pixel_format(format.fourcc)
                    .with_image(0, size),
            )
            .expect("complete should succeed");
        frame
    }

    fn vga() -> Format {
        Format::new(640, 480, FourCC::YUYV)
    }

    #[test]
    fn test_validate_color_bars_success() {
        let frame = delivered(&vga(), TestPattern::ColorBars, 1);
        let result = validate_color_bars(&frame);
        assert!(result.is_ok(), "Color bars validation should succeed: {result:?}");
    }

    #[test]
    fn test_validate_color_bars_wrong_pattern() {
        let frame = delivered(&vga(), TestPattern::Gradient, 1);
        assert!(matches!(
            validate_color_bars(&frame),
            Err(ValidationError::Mismatch(_))
        ));
    }

    #[test]
    fn test_validate_gradient_success() {
        let frame = delivered(&vga(), TestPattern::Gradient, 1);
        let result = validate_gradient(&frame);
        assert!(result.is_ok(), "Gradient validation should succeed: {result:?}");
    }

    #[test]
    fn test_validate_gradient_wrong_pattern() {
        let frame = delivered(&vga(), TestPattern::Solid(128, 128, 128), 1);
        assert!(validate_gradient(&frame).is_err());
    }

    #[test]
    fn test_undelivered_frame_is_unreadable() {
        let frame = Frame::new(64, AllocationMode::AnnounceFrame, 1).expect("frame should allocate");
        assert!(matches!(
            validate_color_bars(&frame),
            Err(ValidationError::Frame(Error::NotAvailable(_)))
        ));
    }

    #[test]
    fn test_validate_frame_sequence_success() {
        let format = Format::new(16, 4, FourCC::YUYV);
        let frames: Vec<FramePtr> = (1..=5)
            .map(|id| delivered(&format, TestPattern::ColorBars, id))
            .collect();
        assert!(validate_frame_sequence(&frames).is_ok());
    }

    #[test]
    fn test_validate_frame_sequence_empty() {
        assert!(validate_frame_sequence(&[]).is_err());
    }

    #[test]
    fn test_validate_frame_sequence_with_gap() {
        let format = Format::new(16, 4, FourCC::YUYV);
        let frames: Vec<FramePtr> = [1, 2, 4]
            .into_iter()
            .map(|id| delivered(&format, TestPattern::ColorBars, id))
            .collect();
        assert!(matches!(
            validate_frame_sequence(&frames),
            Err(ValidationError::Mismatch(_))
        ));
    }

    #[test]
    fn test_colors_match_exact() {
        assert!(colors_match((100, 150, 200), (100, 150, 200), 10));
    }

    #[test]
    fn test_colors_match_within_tolerance() {
        assert!(colors_match((100, 150, 200), (105, 155, 205), 10));
    }

    #[test]
    fn test_colors_match_outside_tolerance() {
        assert!(!colors_match((100, 150, 200), (120, 150, 200), 10));
    }
}
