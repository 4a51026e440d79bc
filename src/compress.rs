//! Decode, halve and re-encode one image.

use crate::error::CompressionError;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::imageops::FilterType;
use image::{ColorType, DynamicImage, GenericImageView, ImageFormat};

/// Quality used when re-encoding JPEG sources.
pub const DEFAULT_JPEG_QUALITY: u8 = 70;

/// Output of a single compression.
#[derive(Debug, Clone)]
pub struct Compressed {
    pub bytes: Vec<u8>,
    /// Measured after encoding.
    pub size: i64,
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
}

/// Halves an image's height, keeps its aspect ratio, and re-encodes it in the
/// family it came in: lossy JPEG at a fixed quality, lossless PNG as-is.
#[derive(Debug, Clone, Copy)]
pub struct Compressor {
    jpeg_quality: u8,
}

impl Default for Compressor {
    fn default() -> Self {
        Self::new(DEFAULT_JPEG_QUALITY)
    }
}

impl Compressor {
    pub fn new(jpeg_quality: u8) -> Self {
        Self {
            jpeg_quality: jpeg_quality.clamp(1, 100),
        }
    }

    /// Identifies the raster encoding of `bytes` from its magic number.
    pub fn detect_format(bytes: &[u8]) -> Result<ImageFormat, CompressionError> {
        let format = image::guess_format(bytes)
            .map_err(|_| CompressionError::UnsupportedFormat("unrecognised".to_string()))?;
        Self::ensure_supported(format)?;
        Ok(format)
    }

    fn ensure_supported(format: ImageFormat) -> Result<(), CompressionError> {
        match format {
            ImageFormat::Jpeg | ImageFormat::Png => Ok(()),
            other => Err(CompressionError::UnsupportedFormat(format!("{:?}", other).to_lowercase())),
        }
    }

    /// Target dimensions: height floored to half, width from the same ratio.
    pub fn target_dimensions(width: u32, height: u32) -> Result<(u32, u32), CompressionError> {
        if height < 2 {
            return Err(CompressionError::TooSmall { height });
        }
        let new_height = height / 2;
        let scaled = (u64::from(width) * u64::from(new_height) + u64::from(height) / 2) / u64::from(height);
        let new_width = u32::try_from(scaled).unwrap_or(u32::MAX).max(1);
        Ok((new_width, new_height))
    }

    pub fn compress(&self, source: &[u8], format: ImageFormat) -> Result<Compressed, CompressionError> {
        Self::ensure_supported(format)?;

        let img = image::load_from_memory_with_format(source, format)?;
        let (width, height) = img.dimensions();
        let (new_width, new_height) = Self::target_dimensions(width, height)?;
        let resized = img.resize_exact(new_width, new_height, FilterType::Lanczos3);

        let mut bytes = Vec::new();
        match format {
            ImageFormat::Jpeg => {
                let encoder = JpegEncoder::new_with_quality(&mut bytes, self.jpeg_quality);
                Self::jpeg_compatible(resized).write_with_encoder(encoder)?;
            }
            _ => {
                resized.write_with_encoder(PngEncoder::new(&mut bytes))?;
            }
        }

        log::debug!(
            "Compressed {:?} image {}x{} -> {}x{} ({} bytes -> {} bytes)",
            format,
            width,
            height,
            new_width,
            new_height,
            source.len(),
            bytes.len()
        );

        Ok(Compressed {
            size: bytes.len() as i64,
            bytes,
            format,
            width: new_width,
            height: new_height,
        })
    }

    // The JPEG encoder only takes 8-bit gray or RGB.
    fn jpeg_compatible(img: DynamicImage) -> DynamicImage {
        match img.color() {
            ColorType::L8 | ColorType::Rgb8 => img,
            _ => DynamicImage::ImageRgb8(img.to_rgb8()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage, Rgba, RgbaImage};
    use std::io::Cursor;

    fn encode(img: DynamicImage, format: ImageFormat) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, format).unwrap();
        out.into_inner()
    }

    fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 128]))
    }

    #[test]
    fn test_jpeg_is_halved_and_stays_jpeg() {
        let source = encode(DynamicImage::ImageRgb8(gradient(1000, 800)), ImageFormat::Jpeg);
        let format = Compressor::detect_format(&source).unwrap();
        assert_eq!(format, ImageFormat::Jpeg);

        let out = Compressor::default().compress(&source, format).unwrap();
        assert_eq!((out.width, out.height), (500, 400));
        assert_eq!(out.size, out.bytes.len() as i64);
        assert!(out.size > 0);

        let decoded = image::load_from_memory_with_format(&out.bytes, ImageFormat::Jpeg).unwrap();
        assert_eq!(decoded.dimensions(), (500, 400));
    }

    #[test]
    fn test_png_keeps_alpha_and_aspect_ratio() {
        let img = RgbaImage::from_pixel(301, 201, Rgba([10, 20, 30, 100]));
        let source = encode(DynamicImage::ImageRgba8(img), ImageFormat::Png);

        let out = Compressor::default().compress(&source, ImageFormat::Png).unwrap();
        assert_eq!(out.height, 100);
        let expected_width = 301.0 * 100.0 / 201.0;
        assert!((f64::from(out.width) - expected_width).abs() <= 1.0);

        let decoded = image::load_from_memory_with_format(&out.bytes, ImageFormat::Png).unwrap();
        assert!(decoded.color().has_alpha());
    }

    #[test]
    fn test_odd_height_is_floored() {
        assert_eq!(Compressor::target_dimensions(640, 481).unwrap(), (319, 240));
        assert_eq!(Compressor::target_dimensions(640, 480).unwrap(), (320, 240));
        assert_eq!(Compressor::target_dimensions(3, 2).unwrap(), (2, 1));
    }

    #[test]
    fn test_single_row_image_is_rejected() {
        assert!(matches!(
            Compressor::target_dimensions(10, 1),
            Err(CompressionError::TooSmall { height: 1 })
        ));
    }

    #[test]
    fn test_unsupported_formats() {
        assert!(matches!(
            Compressor::detect_format(b"GIF89a\x01\x00\x01\x00"),
            Err(CompressionError::UnsupportedFormat(_))
        ));
        assert!(matches!(
            Compressor::detect_format(b"plain text"),
            Err(CompressionError::UnsupportedFormat(_))
        ));
        assert!(matches!(
            Compressor::default().compress(b"", ImageFormat::Gif),
            Err(CompressionError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_corrupt_jpeg_is_a_codec_error() {
        let mut source = encode(DynamicImage::ImageRgb8(gradient(64, 64)), ImageFormat::Jpeg);
        source.truncate(20);
        assert!(matches!(
            Compressor::default().compress(&source, ImageFormat::Jpeg),
            Err(CompressionError::Image(_))
        ));
    }
}
