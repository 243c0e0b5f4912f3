use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, RgbImage};
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

/// Colour-filter layout of a raw Bayer sensor, read left to right, top to
/// bottom over each 2x2 cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BayerPattern {
    Rggb,
    Bggr,
    Gbrg,
    Grbg,
}

impl BayerPattern {
    /// Offsets of the red and blue sites inside the 2x2 cell; the other two
    /// sites are green.
    fn red_blue(self) -> (usize, usize) {
        match self {
            BayerPattern::Rggb => (0, 3),
            BayerPattern::Bggr => (3, 0),
            BayerPattern::Gbrg => (2, 1),
            BayerPattern::Grbg => (1, 2),
        }
    }
}

/// Pixel layouts understood by the converter. Names follow the
/// `sensor_msgs/Image` encoding strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelEncoding {
    Rgb8,
    Bgr8,
    Rgba8,
    Bgra8,
    Rgb16,
    Bgr16,
    Mono8,
    Mono16,
    /// Packed 4:2:2 as U Y0 V Y1 (`yuv422`, UYVY).
    Uyvy,
    /// Packed 4:2:2 as Y0 U Y1 V (`yuv422_yuy2`, YUYV).
    Yuyv,
    Bayer8(BayerPattern),
}

impl PixelEncoding {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelEncoding::Rgb8 | PixelEncoding::Bgr8 => 3,
            PixelEncoding::Rgba8 | PixelEncoding::Bgra8 => 4,
            PixelEncoding::Rgb16 | PixelEncoding::Bgr16 => 6,
            PixelEncoding::Mono8 | PixelEncoding::Bayer8(_) => 1,
            PixelEncoding::Mono16 | PixelEncoding::Uyvy | PixelEncoding::Yuyv => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PixelEncoding::Rgb8 => "rgb8",
            PixelEncoding::Bgr8 => "bgr8",
            PixelEncoding::Rgba8 => "rgba8",
            PixelEncoding::Bgra8 => "bgra8",
            PixelEncoding::Rgb16 => "rgb16",
            PixelEncoding::Bgr16 => "bgr16",
            PixelEncoding::Mono8 => "mono8",
            PixelEncoding::Mono16 => "mono16",
            PixelEncoding::Uyvy => "yuv422",
            PixelEncoding::Yuyv => "yuv422_yuy2",
            PixelEncoding::Bayer8(BayerPattern::Rggb) => "bayer_rggb8",
            PixelEncoding::Bayer8(BayerPattern::Bggr) => "bayer_bggr8",
            PixelEncoding::Bayer8(BayerPattern::Gbrg) => "bayer_gbrg8",
            PixelEncoding::Bayer8(BayerPattern::Grbg) => "bayer_grbg8",
        }
    }
}

impl fmt::Display for PixelEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PixelEncoding {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rgb8" => Ok(PixelEncoding::Rgb8),
            "bgr8" | "8UC3" => Ok(PixelEncoding::Bgr8),
            "rgba8" => Ok(PixelEncoding::Rgba8),
            "bgra8" | "8UC4" => Ok(PixelEncoding::Bgra8),
            "rgb16" => Ok(PixelEncoding::Rgb16),
            "bgr16" | "16UC3" => Ok(PixelEncoding::Bgr16),
            "mono8" | "8UC1" => Ok(PixelEncoding::Mono8),
            "mono16" | "16UC1" => Ok(PixelEncoding::Mono16),
            "yuv422" | "uyvy" => Ok(PixelEncoding::Uyvy),
            "yuv422_yuy2" | "yuyv" => Ok(PixelEncoding::Yuyv),
            "bayer_rggb8" => Ok(PixelEncoding::Bayer8(BayerPattern::Rggb)),
            "bayer_bggr8" => Ok(PixelEncoding::Bayer8(BayerPattern::Bggr)),
            "bayer_gbrg8" => Ok(PixelEncoding::Bayer8(BayerPattern::Gbrg)),
            "bayer_grbg8" => Ok(PixelEncoding::Bayer8(BayerPattern::Grbg)),
            other => Err(FrameError::UnsupportedEncoding(other.to_string())),
        }
    }
}

/// One raster image as delivered by the camera topic.
///
/// Rows are `step` bytes apart; only the first `width * bytes_per_pixel`
/// bytes of each row carry pixels.
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub step: u32,
    /// Raw encoding string from the message. Parsed lazily so an unknown
    /// encoding surfaces as a conversion error for that frame only.
    pub encoding: String,
    pub is_bigendian: bool,
    pub data: Vec<u8>,
    /// Capture time from the message header, when the publisher set one.
    pub stamp: Option<DateTime<Utc>>,
    pub received_at: Instant,
}

impl Frame {
    /// Build a tightly packed frame (no row padding) received now.
    pub fn packed(width: u32, height: u32, encoding: PixelEncoding, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            step: width.saturating_mul(encoding.bytes_per_pixel() as u32),
            encoding: encoding.as_str().to_string(),
            is_bigendian: false,
            data,
            stamp: None,
            received_at: Instant::now(),
        }
    }

    pub fn with_stamp(mut self, stamp: DateTime<Utc>) -> Self {
        self.stamp = Some(stamp);
        self
    }

    pub fn with_received_at(mut self, received_at: Instant) -> Self {
        self.received_at = received_at;
        self
    }

    pub fn pixel_encoding(&self) -> Result<PixelEncoding, FrameError> {
        self.encoding.parse()
    }

    /// Convert to an 8-bit, three-channel RGB raster.
    pub fn to_rgb(&self) -> Result<RgbImage, FrameError> {
        let encoding = self.pixel_encoding()?;
        if self.width == 0 || self.height == 0 {
            return Err(FrameError::Empty {
                width: self.width,
                height: self.height,
            });
        }

        let width = self.width as usize;
        let height = self.height as usize;
        let step = self.step as usize;
        let row_bytes = width
            .checked_mul(encoding.bytes_per_pixel())
            .ok_or(FrameError::Overflow)?;
        if step < row_bytes {
            return Err(FrameError::StrideTooShort { step, row_bytes });
        }
        let expected = step.checked_mul(height).ok_or(FrameError::Overflow)?;
        if self.data.len() < expected {
            return Err(FrameError::TooShort {
                got: self.data.len(),
                expected,
            });
        }
        match encoding {
            PixelEncoding::Uyvy | PixelEncoding::Yuyv if width % 2 != 0 => {
                return Err(FrameError::Geometry(format!(
                    "{encoding} needs an even width, got {width}"
                )));
            }
            PixelEncoding::Bayer8(_) if width < 2 || height < 2 => {
                return Err(FrameError::Geometry(format!(
                    "{encoding} needs at least 2x2 pixels, got {width}x{height}"
                )));
            }
            _ => {}
        }

        let rows: Vec<&[u8]> = self
            .data
            .chunks_exact(step)
            .take(height)
            .map(|row| &row[..row_bytes])
            .collect();
        // Most significant byte of a 16-bit sample.
        let high = |px: &[u8]| if self.is_bigendian { px[0] } else { px[1] };

        let mut rgb = Vec::with_capacity(width * height * 3);
        for (y, row) in rows.iter().enumerate() {
            match encoding {
                PixelEncoding::Rgb8 => rgb.extend_from_slice(row),
                PixelEncoding::Bgr8 => {
                    for px in row.chunks_exact(3) {
                        rgb.extend_from_slice(&[px[2], px[1], px[0]]);
                    }
                }
                PixelEncoding::Rgba8 => {
                    for px in row.chunks_exact(4) {
                        rgb.extend_from_slice(&px[..3]);
                    }
                }
                PixelEncoding::Bgra8 => {
                    for px in row.chunks_exact(4) {
                        rgb.extend_from_slice(&[px[2], px[1], px[0]]);
                    }
                }
                PixelEncoding::Rgb16 => {
                    for px in row.chunks_exact(6) {
                        rgb.extend_from_slice(&[high(&px[0..2]), high(&px[2..4]), high(&px[4..6])]);
                    }
                }
                PixelEncoding::Bgr16 => {
                    for px in row.chunks_exact(6) {
                        rgb.extend_from_slice(&[high(&px[4..6]), high(&px[2..4]), high(&px[0..2])]);
                    }
                }
                PixelEncoding::Mono8 => {
                    for &v in row.iter() {
                        rgb.extend_from_slice(&[v, v, v]);
                    }
                }
                PixelEncoding::Mono16 => {
                    for px in row.chunks_exact(2) {
                        let v = high(px);
                        rgb.extend_from_slice(&[v, v, v]);
                    }
                }
                PixelEncoding::Uyvy => {
                    for px in row.chunks_exact(4) {
                        rgb.extend_from_slice(&yuv_to_rgb(px[1], px[0], px[2]));
                        rgb.extend_from_slice(&yuv_to_rgb(px[3], px[0], px[2]));
                    }
                }
                PixelEncoding::Yuyv => {
                    for px in row.chunks_exact(4) {
                        rgb.extend_from_slice(&yuv_to_rgb(px[0], px[1], px[3]));
                        rgb.extend_from_slice(&yuv_to_rgb(px[2], px[1], px[3]));
                    }
                }
                PixelEncoding::Bayer8(pattern) => {
                    let cy = cell_origin(y, height);
                    for x in 0..width {
                        let cx = cell_origin(x, width);
                        let cell = [
                            rows[cy][cx],
                            rows[cy][cx + 1],
                            rows[cy + 1][cx],
                            rows[cy + 1][cx + 1],
                        ];
                        rgb.extend_from_slice(&demosaic_cell(pattern, cell));
                    }
                }
            }
        }

        RgbImage::from_raw(self.width, self.height, rgb).ok_or(FrameError::Overflow)
    }
}

/// BT.601 video-range YCbCr to RGB.
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = f32::from(y) - 16.0;
    let d = f32::from(u) - 128.0;
    let e = f32::from(v) - 128.0;
    let clamp = |x: f32| x.round().clamp(0.0, 255.0) as u8;
    [
        clamp(1.164 * c + 1.596 * e),
        clamp(1.164 * c - 0.392 * d - 0.813 * e),
        clamp(1.164 * c + 2.017 * d),
    ]
}

/// First index of the 2x2 cell covering `i`. A trailing odd row or column
/// borrows the previous cell so the colour phase stays intact.
fn cell_origin(i: usize, len: usize) -> usize {
    let origin = i & !1;
    if origin + 1 < len {
        origin
    } else {
        origin - 2
    }
}

/// Nearest-cell demosaic: every pixel of a 2x2 cell gets the cell's red,
/// blue and mean green.
fn demosaic_cell(pattern: BayerPattern, cell: [u8; 4]) -> [u8; 3] {
    let (r, b) = pattern.red_blue();
    let green: u16 = (0..4)
        .filter(|&i| i != r && i != b)
        .map(|i| u16::from(cell[i]))
        .sum();
    [cell[r], (green / 2) as u8, cell[b]]
}

/// Compress an RGB raster to JPEG at the given quality (1..=100).
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, FrameError> {
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality)
        .encode(
            image.as_raw(),
            image.width(),
            image.height(),
            ExtendedColorType::Rgb8,
        )
        .map_err(|e| FrameError::Encode(e.to_string()))?;
    if buf.is_empty() {
        return Err(FrameError::Encode("encoder produced no output".into()));
    }
    Ok(buf)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("unsupported pixel encoding `{0}`")]
    UnsupportedEncoding(String),
    #[error("frame has no pixels: {width}x{height}")]
    Empty { width: u32, height: u32 },
    #[error("row stride {step} is shorter than a row of {row_bytes} bytes")]
    StrideTooShort { step: usize, row_bytes: usize },
    #[error("frame data too short: got {got} bytes, expected at least {expected}")]
    TooShort { got: usize, expected: usize },
    #[error("frame geometry not supported: {0}")]
    Geometry(String),
    #[error("frame dimensions overflow")]
    Overflow,
    #[error("jpeg encoding failed: {0}")]
    Encode(String),
}
