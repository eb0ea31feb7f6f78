//! JPEG encoding for previews, archived alerts and notifications.

use image::{RgbImage, codecs::jpeg::JpegEncoder, imageops};

use crate::error::VisionError;

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, VisionError> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100)).encode_image(image)?;
    Ok(buffer)
}

/// Shrink `image` to at most `max_width` pixels wide, keeping aspect ratio.
pub fn fit_width(image: &RgbImage, max_width: u32) -> Option<RgbImage> {
    let (w, h) = image.dimensions();
    if w <= max_width || max_width == 0 {
        return None;
    }
    let new_h = ((u64::from(h) * u64::from(max_width)) / u64::from(w)).max(1) as u32;
    Some(imageops::resize(
        image,
        max_width,
        new_h,
        imageops::FilterType::Triangle,
    ))
}

/// Downscale to `max_width` if needed, then encode.
pub fn encode_scaled(image: &RgbImage, max_width: u32, quality: u8) -> Result<Vec<u8>, VisionError> {
    match fit_width(image, max_width) {
        Some(small) => encode_jpeg(&small, quality),
        None => encode_jpeg(image, quality),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wide_images_are_downscaled() {
        let image = RgbImage::new(1280, 720);
        let small = fit_width(&image, 640).unwrap();
        assert_eq!(small.dimensions(), (640, 360));
        assert!(fit_width(&RgbImage::new(320, 240), 640).is_none());
    }

    #[test]
    fn encoded_output_is_jpeg() {
        let jpeg = encode_scaled(&RgbImage::new(64, 48), 640, 80).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }
}
