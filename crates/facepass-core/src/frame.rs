//! Still frame type and the image operations the capture flow needs:
//! mirroring, PNG encode/decode, brightness checks.

use crate::types::EncodedImage;
use image::{DynamicImage, GrayImage, ImageFormat, RgbImage};
use std::io::Cursor;
use std::time::Instant;

/// Pixel layout of a [`StillFrame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelLayout {
    /// 8-bit grayscale, 1 byte/pixel.
    Gray8,
    /// 8-bit RGB, 3 bytes/pixel.
    Rgb8,
}

impl PixelLayout {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelLayout::Gray8 => 1,
            PixelLayout::Rgb8 => 3,
        }
    }
}

/// A single image grabbed from a live camera stream.
#[derive(Debug, Clone)]
pub struct StillFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub layout: PixelLayout,
    pub sequence: u32,
    /// True once the frame was flipped to match a mirrored preview.
    pub mirrored: bool,
    pub captured_at: Instant,
}

impl StillFrame {
    /// Wrap raw pixel data, checking that the buffer covers `width * height`.
    pub fn new(
        data: Vec<u8>,
        width: u32,
        height: u32,
        layout: PixelLayout,
    ) -> Result<Self, FrameError> {
        let expected = width as usize * height as usize * layout.bytes_per_pixel();
        if data.len() != expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
            layout,
            sequence: 0,
            mirrored: false,
            captured_at: Instant::now(),
        })
    }

    pub fn with_sequence(mut self, sequence: u32) -> Self {
        self.sequence = sequence;
        self
    }

    /// Flip the frame horizontally, toggling [`mirrored`](Self::mirrored).
    pub fn mirror(mut self) -> Self {
        let bpp = self.layout.bytes_per_pixel();
        let row_len = self.width as usize * bpp;
        if row_len > 0 {
            for row in self.data.chunks_exact_mut(row_len) {
                let pixels = self.width as usize;
                for x in 0..pixels / 2 {
                    let left = x * bpp;
                    let right = (pixels - 1 - x) * bpp;
                    for c in 0..bpp {
                        row.swap(left + c, right + c);
                    }
                }
            }
        }
        self.mirrored = !self.mirrored;
        self
    }

    /// Average luma (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        let lumas = self.lumas();
        lumas.iter().map(|&b| b as f32).sum::<f32>() / lumas.len() as f32
    }

    /// True if more than `threshold_pct` of the pixels are in the darkest
    /// bucket (luma below 32).
    pub fn is_dark(&self, threshold_pct: f32) -> bool {
        let lumas = self.lumas();
        if lumas.is_empty() {
            return true;
        }
        let dark = lumas.iter().filter(|&&p| p < 32).count();
        (dark as f32 / lumas.len() as f32) > threshold_pct
    }

    /// Encode as PNG.
    pub fn to_png(&self) -> Result<EncodedImage, FrameError> {
        let image = self.to_dynamic()?;
        let mut out = Cursor::new(Vec::new());
        image
            .write_to(&mut out, ImageFormat::Png)
            .map_err(|e| FrameError::Encode(e.to_string()))?;
        Ok(EncodedImage::png(out.into_inner()))
    }

    /// Decode any format the `image` crate recognizes into an RGB still.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let rgb = image::load_from_memory(bytes)
            .map_err(|e| FrameError::Decode(e.to_string()))?
            .to_rgb8();
        let (width, height) = rgb.dimensions();
        Self::new(rgb.into_raw(), width, height, PixelLayout::Rgb8)
    }

    fn to_dynamic(&self) -> Result<DynamicImage, FrameError> {
        let invalid = || FrameError::InvalidLength {
            expected: self.width as usize * self.height as usize * self.layout.bytes_per_pixel(),
            actual: self.data.len(),
        };
        Ok(match self.layout {
            PixelLayout::Gray8 => DynamicImage::ImageLuma8(
                GrayImage::from_raw(self.width, self.height, self.data.clone()).ok_or_else(invalid)?,
            ),
            PixelLayout::Rgb8 => DynamicImage::ImageRgb8(
                RgbImage::from_raw(self.width, self.height, self.data.clone()).ok_or_else(invalid)?,
            ),
        })
    }

    fn lumas(&self) -> std::borrow::Cow<'_, [u8]> {
        match self.layout {
            PixelLayout::Gray8 => std::borrow::Cow::Borrowed(&self.data),
            // ITU-R BT.601 integer approximation.
            PixelLayout::Rgb8 => std::borrow::Cow::Owned(
                self.data
                    .chunks_exact(3)
                    .map(|p| ((p[0] as u32 * 299 + p[1] as u32 * 587 + p[2] as u32 * 114) / 1000) as u8)
                    .collect(),
            ),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum FrameError {
    #[error("invalid frame length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("image encode failed: {0}")]
    Encode(String),
    #[error("image decode failed: {0}")]
    Decode(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gray(data: Vec<u8>, width: u32, height: u32) -> StillFrame {
        StillFrame::new(data, width, height, PixelLayout::Gray8).unwrap()
    }

    #[test]
    fn test_new_rejects_short_buffer() {
        let result = StillFrame::new(vec![0; 5], 2, 3, PixelLayout::Gray8);
        assert!(matches!(
            result,
            Err(FrameError::InvalidLength { expected: 6, actual: 5 })
        ));
    }

    #[test]
    fn test_mirror_gray_rows() {
        let frame = gray(vec![1, 2, 3, 4, 5, 6], 3, 2).mirror();
        assert_eq!(frame.data, vec![3, 2, 1, 6, 5, 4]);
        assert!(frame.mirrored);
    }

    #[test]
    fn test_mirror_rgb_keeps_channel_order() {
        let frame = StillFrame::new(vec![1, 2, 3, 4, 5, 6], 2, 1, PixelLayout::Rgb8)
            .unwrap()
            .mirror();
        assert_eq!(frame.data, vec![4, 5, 6, 1, 2, 3]);
    }

    #[test]
    fn test_mirror_twice_restores() {
        let original = gray((0..12).collect(), 4, 3);
        let twice = original.clone().mirror().mirror();
        assert_eq!(twice.data, original.data);
        assert!(!twice.mirrored);
    }

    #[test]
    fn test_dark_frame() {
        assert!(gray(vec![0; 100], 10, 10).is_dark(0.95));
        assert!(!gray(vec![128; 100], 10, 10).is_dark(0.95));
    }

    #[test]
    fn test_avg_brightness_rgb() {
        let frame = StillFrame::new(vec![100; 12], 2, 2, PixelLayout::Rgb8).unwrap();
        assert!((frame.avg_brightness() - 100.0).abs() < 1.0);
    }

    #[test]
    fn test_png_roundtrip_preserves_size() {
        let frame = gray((0..64).map(|i| i * 4).collect(), 8, 8);
        let png = frame.to_png().unwrap();
        assert_eq!(png.mime, EncodedImage::PNG);
        let decoded = StillFrame::decode(&png.bytes).unwrap();
        assert_eq!((decoded.width, decoded.height), (8, 8));
        assert_eq!(decoded.layout, PixelLayout::Rgb8);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(matches!(
            StillFrame::decode(b"not an image"),
            Err(FrameError::Decode(_))
        ));
    }
}
