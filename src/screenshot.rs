use std::io::Cursor;
use std::str::FromStr;

use base64::{engine::general_purpose, Engine as _};
use image::imageops::FilterType;
use image::ImageFormat;
use serde::Serialize;

use crate::backend::{BackendError, Capture};
use crate::error::ValidationError;
use crate::geometry::{Dimensions, REFERENCE_HEIGHT, REFERENCE_WIDTH};

/// Resolution a screenshot can be re-encoded for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizeFor {
    /// The 1260x700 reference the `normalized` space is defined against.
    Lux,
}

impl FromStr for OptimizeFor {
    type Err = ValidationError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_lowercase().as_str() {
            "lux" | "lux_sdk" | "normalized" => Ok(OptimizeFor::Lux),
            other => Err(ValidationError::UnknownValue {
                field: "optimize_for",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EncodedImage {
    pub image_base64: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct OptimizedImage {
    pub image_base64: String,
    pub width: u32,
    pub height: u32,
    pub original_width: u32,
    pub original_height: u32,
    pub scale_x: f64,
    pub scale_y: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Screenshot {
    pub original: EncodedImage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lux_optimized: Option<OptimizedImage>,
}

impl Screenshot {
    pub fn from_capture(capture: &Capture, optimize: Option<OptimizeFor>) -> Result<Self, BackendError> {
        let lux_optimized = match optimize {
            Some(OptimizeFor::Lux) => Some(resize_to_reference(capture)?),
            None => None,
        };
        Ok(Self {
            original: EncodedImage {
                image_base64: general_purpose::STANDARD.encode(&capture.png),
                width: capture.width,
                height: capture.height,
            },
            lux_optimized,
        })
    }
}

fn resize_to_reference(capture: &Capture) -> Result<OptimizedImage, BackendError> {
    let img = image::load_from_memory(&capture.png)
        .map_err(|e| BackendError::Execution(format!("Failed to decode screenshot: {}", e)))?;
    let reference = Dimensions::reference();
    let resized = img.resize_exact(reference.width, reference.height, FilterType::Lanczos3);

    let mut buffer = Cursor::new(Vec::new());
    resized
        .write_to(&mut buffer, ImageFormat::Png)
        .map_err(|e| BackendError::Execution(format!("Failed to encode screenshot: {}", e)))?;

    Ok(OptimizedImage {
        image_base64: general_purpose::STANDARD.encode(buffer.get_ref()),
        width: REFERENCE_WIDTH,
        height: REFERENCE_HEIGHT,
        original_width: capture.width,
        original_height: capture.height,
        scale_x: capture.width as f64 / REFERENCE_WIDTH as f64,
        scale_y: capture.height as f64 / REFERENCE_HEIGHT as f64,
    })
}

/// Encodes an RGBA frame as PNG.
pub fn encode_png(img: image::RgbaImage) -> Result<Capture, BackendError> {
    let (width, height) = img.dimensions();
    let mut buffer = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgba8(img)
        .write_to(&mut buffer, ImageFormat::Png)
        .map_err(|e| BackendError::Execution(format!("Failed to encode screenshot: {}", e)))?;
    Ok(Capture {
        png: buffer.into_inner(),
        width,
        height,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capture(width: u32, height: u32) -> Capture {
        encode_png(image::RgbaImage::from_pixel(width, height, image::Rgba([1, 2, 3, 255]))).unwrap()
    }

    #[test]
    fn lux_variant_is_reference_sized() {
        let shot = Screenshot::from_capture(&capture(1920, 1080), Some(OptimizeFor::Lux)).unwrap();
        let lux = shot.lux_optimized.unwrap();
        assert_eq!((lux.width, lux.height), (1260, 700));
        assert_eq!((lux.original_width, lux.original_height), (1920, 1080));
        assert!((lux.scale_x - 1920.0 / 1260.0).abs() < 1e-9);
        assert!((lux.scale_y - 1080.0 / 700.0).abs() < 1e-9);

        let decoded = general_purpose::STANDARD.decode(lux.image_base64).unwrap();
        let img = image::load_from_memory(&decoded).unwrap();
        assert_eq!((img.width(), img.height()), (1260, 700));
    }

    #[test]
    fn original_only_by_default() {
        let shot = Screenshot::from_capture(&capture(64, 32), None).unwrap();
        assert!(shot.lux_optimized.is_none());
        assert_eq!((shot.original.width, shot.original.height), (64, 32));
        let json = serde_json::to_value(&shot).unwrap();
        assert!(json.get("lux_optimized").is_none());
    }

    #[test]
    fn parses_optimize_target() {
        assert_eq!("lux".parse::<OptimizeFor>().unwrap(), OptimizeFor::Lux);
        assert!("gemini".parse::<OptimizeFor>().is_err());
    }
}
