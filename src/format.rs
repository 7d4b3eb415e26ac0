//! Pixel format and image geometry types.

/// Pixel format representation (e.g., YUYV, MJPG, RGB3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Create a new `FourCC` from a 4-byte array.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// YUYV pixel format (4:2:2 packed).
    pub const YUYV: Self = Self::new(b"YUYV");
    /// MJPEG pixel format (Motion JPEG).
    pub const MJPG: Self = Self::new(b"MJPG");
    /// RGB3 pixel format (24-bit RGB).
    pub const RGB3: Self = Self::new(b"RGB3");
    /// GREY pixel format (8-bit mono).
    pub const GREY: Self = Self::new(b"GREY");

    /// The code packed little-endian into a `u32`, as V4L2 and GenTL report it.
    #[must_use]
    pub const fn to_u32(self) -> u32 {
        u32::from_le_bytes(self.0)
    }
}

impl From<u32> for FourCC {
    fn from(code: u32) -> Self {
        Self(code.to_le_bytes())
    }
}

impl std::fmt::Display for FourCC {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in self.0 {
            write!(f, "{}", char::from(byte))?;
        }
        Ok(())
    }
}

#[cfg(feature = "v4l2")]
impl From<v4l::FourCC> for FourCC {
    fn from(fourcc: v4l::FourCC) -> Self {
        Self(fourcc.repr)
    }
}

#[cfg(feature = "v4l2")]
impl From<FourCC> for v4l::FourCC {
    fn from(fourcc: FourCC) -> Self {
        Self::new(&fourcc.0)
    }
}

/// Image geometry of a device's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Format {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel format.
    pub fourcc: FourCC,
    /// Bytes per line (stride).
    pub stride: u32,
    /// Total frame size in bytes.
    pub size: u32,
}

impl Format {
    /// Create a format for a packed 2-byte-per-pixel layout such as YUYV.
    #[must_use]
    pub const fn new(width: u32, height: u32, fourcc: FourCC) -> Self {
        Self::with_bytes_per_pixel(width, height, fourcc, 2)
    }

    /// Create a format with an explicit pixel size.
    #[must_use]
    pub const fn with_bytes_per_pixel(
        width: u32,
        height: u32,
        fourcc: FourCC,
        bytes_per_pixel: u32,
    ) -> Self {
        let stride = width * bytes_per_pixel;
        let size = stride * height;
        Self {
            width,
            height,
            fourcc,
            stride,
            size,
        }
    }
}

/// Sample an RGB value from a YUYV image.
///
/// # Arguments
///
/// * `data` - Raw YUYV bytes
/// * `x` - X coordinate (0-based)
/// * `y` - Y coordinate (0-based)
/// * `width` - Image width in pixels
///
/// # Returns
///
/// Returns `Some((r, g, b))` if the coordinates are inside `data`, `None` otherwise.
///
/// # Notes
///
/// For odd x coordinates the Y value of the second pixel in the pair is used
/// together with the shared U/V values.
#[must_use]
pub fn yuyv_pixel_at(data: &[u8], x: u32, y: u32, width: u32) -> Option<(u8, u8, u8)> {
    // YUYV format: [Y0 U Y1 V] repeats
    let pair_x = x & !1;
    let offset = usize::try_from((u64::from(y) * u64::from(width) + u64::from(pair_x)) * 2).ok()?;
    let quad = data.get(offset..offset.checked_add(4)?)?;

    let &[y0, u, y1, v] = quad else {
        return None;
    };
    let luma = if x % 2 == 0 { y0 } else { y1 };

    Some(yuv_to_rgb(luma, u, v))
}

/// Convert YUV values to RGB using the ITU-R BT.601 formula.
///
/// Values are clamped to 0-255.
#[must_use]
#[allow(clippy::many_single_char_names)]
pub fn yuv_to_rgb(y: u8, u: u8, v: u8) -> (u8, u8, u8) {
    let y_f = f32::from(y);
    let u_f = f32::from(u) - 128.0;
    let v_f = f32::from(v) - 128.0;

    let r = 1.402f32.mul_add(v_f, y_f);
    let g = 0.714_14f32.mul_add(-v_f, 0.344_14f32.mul_add(-u_f, y_f));
    let b = 1.772f32.mul_add(u_f, y_f);

    let clamp = |val: f32| -> u8 {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        {
            val.clamp(0.0, 255.0) as u8
        }
    };

    (clamp(r), clamp(g), clamp(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        let format = Format::new(640, 480, FourCC::YUYV);
        assert_eq!(format.stride, 1280);
        assert_eq!(format.size, 640 * 480 * 2);

        let grey = Format::with_bytes_per_pixel(32, 32, FourCC::GREY, 1);
        assert_eq!(grey.size, 1024);
    }

    #[test]
    fn test_fourcc_u32_roundtrip() {
        let code = FourCC::YUYV.to_u32();
        assert_eq!(FourCC::from(code), FourCC::YUYV);
        assert_eq!(FourCC::YUYV.to_string(), "YUYV");
    }

    #[test]
    fn test_pixel_at_bounds() {
        let data = [235u8, 128, 235, 128];
        assert_eq!(yuyv_pixel_at(&data, 0, 0, 2), Some((235, 235, 235)));
        assert_eq!(yuyv_pixel_at(&data, 1, 0, 2), Some((235, 235, 235)));
        assert_eq!(yuyv_pixel_at(&data, 0, 1, 2), None);
    }

    #[test]
    fn test_yuv_to_rgb_neutral_chroma() {
        assert_eq!(yuv_to_rgb(16, 128, 128), (16, 16, 16));
        assert_eq!(yuv_to_rgb(255, 128, 128), (255, 255, 255));
    }
}
