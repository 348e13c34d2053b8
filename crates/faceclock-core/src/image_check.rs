//! Byte-level and structural admission checks run before an image reaches
//! the extractor.

use image::ImageFormat;
use serde::Serialize;
use thiserror::Error;

pub const DEFAULT_MIN_IMAGE_BYTES: usize = 100;
pub const DEFAULT_MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageLimits {
    pub min_bytes: usize,
    pub max_bytes: usize,
    /// Smallest accepted width and height, in pixels.
    pub min_dimension: u32,
}

#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImageRejection {
    #[error("image is {size} bytes, below the {min}-byte minimum")]
    TooSmall { size: usize, min: usize },
    #[error("image is {size} bytes, above the {max}-byte maximum")]
    TooLarge { size: usize, max: usize },
    #[error("unsupported image format (expected JPEG, PNG or WEBP)")]
    UnsupportedFormat,
    #[error("image could not be decoded: {message}")]
    Undecodable { message: String },
    #[error("image is {width}x{height}, below the {min}px minimum")]
    DimensionsTooSmall { width: u32, height: u32, min: u32 },
}

/// What the admission check learned about an accepted image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    pub bytes: usize,
}

/// Admit `bytes` if it is a decodable JPEG/PNG/WEBP within `limits`.
pub fn inspect_image(bytes: &[u8], limits: &ImageLimits) -> Result<ImageInfo, ImageRejection> {
    if bytes.len() < limits.min_bytes {
        return Err(ImageRejection::TooSmall {
            size: bytes.len(),
            min: limits.min_bytes,
        });
    }
    if bytes.len() > limits.max_bytes {
        return Err(ImageRejection::TooLarge {
            size: bytes.len(),
            max: limits.max_bytes,
        });
    }

    let format = image::guess_format(bytes).map_err(|_| ImageRejection::UnsupportedFormat)?;
    if !matches!(format, ImageFormat::Jpeg | ImageFormat::Png | ImageFormat::WebP) {
        return Err(ImageRejection::UnsupportedFormat);
    }

    // Full decode: a valid header over a truncated body must still be rejected.
    let decoded = image::load_from_memory_with_format(bytes, format).map_err(|e| {
        ImageRejection::Undecodable {
            message: e.to_string(),
        }
    })?;
    let (width, height) = (decoded.width(), decoded.height());

    if width < limits.min_dimension || height < limits.min_dimension {
        return Err(ImageRejection::DimensionsTooSmall {
            width,
            height,
            min: limits.min_dimension,
        });
    }

    Ok(ImageInfo {
        format,
        width,
        height,
        bytes: bytes.len(),
    })
}

/// File extension used when persisting an accepted image.
pub fn extension_for(format: ImageFormat) -> &'static str {
    match format {
        ImageFormat::Png => "png",
        ImageFormat::WebP => "webp",
        _ => "jpg",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use std::io::Cursor;

    fn limits() -> ImageLimits {
        ImageLimits {
            min_bytes: 16,
            max_bytes: 1024 * 1024,
            min_dimension: 50,
        }
    }

    fn encode(width: u32, height: u32, format: ImageFormat) -> Vec<u8> {
        let img =
            RgbImage::from_fn(width, height, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 90]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, format).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_accepts_png() {
        let bytes = encode(64, 80, ImageFormat::Png);
        let info = inspect_image(&bytes, &limits()).unwrap();
        assert_eq!(info.format, ImageFormat::Png);
        assert_eq!((info.width, info.height), (64, 80));
        assert_eq!(info.bytes, bytes.len());
    }

    #[test]
    fn test_accepts_jpeg() {
        let bytes = encode(64, 64, ImageFormat::Jpeg);
        assert_eq!(inspect_image(&bytes, &limits()).unwrap().format, ImageFormat::Jpeg);
    }

    #[test]
    fn test_rejects_below_min_bytes() {
        let err = inspect_image(&[0x89, 0x50], &limits()).unwrap_err();
        assert_eq!(err, ImageRejection::TooSmall { size: 2, min: 16 });
    }

    #[test]
    fn test_rejects_above_max_bytes() {
        let bytes = encode(64, 64, ImageFormat::Png);
        let tight = ImageLimits { max_bytes: bytes.len() - 1, ..limits() };
        assert!(matches!(
            inspect_image(&bytes, &tight).unwrap_err(),
            ImageRejection::TooLarge { .. }
        ));
    }

    #[test]
    fn test_rejects_unknown_format() {
        let bytes = vec![0x42u8; 64];
        assert_eq!(
            inspect_image(&bytes, &limits()).unwrap_err(),
            ImageRejection::UnsupportedFormat
        );
    }

    #[test]
    fn test_rejects_unsupported_known_format() {
        let bytes = encode(64, 64, ImageFormat::Bmp);
        assert_eq!(
            inspect_image(&bytes, &limits()).unwrap_err(),
            ImageRejection::UnsupportedFormat
        );
    }

    #[test]
    fn test_rejects_truncated_body() {
        let bytes = encode(64, 64, ImageFormat::Png);
        let truncated = &bytes[..bytes.len() / 2];
        assert!(matches!(
            inspect_image(truncated, &limits()).unwrap_err(),
            ImageRejection::Undecodable { .. }
        ));
    }

    #[test]
    fn test_rejects_tiny_dimensions() {
        let bytes = encode(40, 64, ImageFormat::Png);
        assert_eq!(
            inspect_image(&bytes, &limits()).unwrap_err(),
            ImageRejection::DimensionsTooSmall { width: 40, height: 64, min: 50 }
        );
    }
}
