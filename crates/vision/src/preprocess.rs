use image::{DynamicImage, GrayImage, RgbImage, imageops};
use imageproc::contrast::equalize_histogram;
use video_ingest::Frame;

use crate::config::PreprocessMode;

/// Apply `mode` to a copy of `frame`. `PreprocessMode::None` returns an
/// unchanged clone.
pub fn preprocess(frame: &Frame, mode: PreprocessMode) -> Frame {
    let image = match mode {
        PreprocessMode::None => return frame.clone(),
        PreprocessMode::Grayscale => gray_to_rgb(imageops::grayscale(&frame.image)),
        PreprocessMode::GrayscaleEqualize => {
            gray_to_rgb(equalize_histogram(&imageops::grayscale(&frame.image)))
        }
        PreprocessMode::Equalize => equalize_luminance(&frame.image),
    };
    Frame {
        image,
        timestamp_ms: frame.timestamp_ms,
        sequence: frame.sequence,
    }
}

fn gray_to_rgb(gray: GrayImage) -> RgbImage {
    DynamicImage::ImageLuma8(gray).to_rgb8()
}

/// Equalise the luminance histogram and shift each pixel's channels by the
/// change in its luminance, keeping hue.
fn equalize_luminance(image: &RgbImage) -> RgbImage {
    let luma = imageops::grayscale(image);
    let equalized = equalize_histogram(&luma);
    let mut out = image.clone();
    for (x, y, px) in out.enumerate_pixels_mut() {
        let delta = i16::from(equalized.get_pixel(x, y).0[0]) - i16::from(luma.get_pixel(x, y).0[0]);
        for c in px.0.iter_mut() {
            *c = (i16::from(*c) + delta).clamp(0, 255) as u8;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use image::Rgb;

    use super::*;

    fn gradient() -> Frame {
        let image = RgbImage::from_fn(16, 4, |x, _| Rgb([100 + x as u8, 110, 120 + x as u8]));
        Frame::new(image, 1)
    }

    #[test]
    fn none_is_identity() {
        let frame = gradient();
        assert_eq!(preprocess(&frame, PreprocessMode::None).image, frame.image);
    }

    #[test]
    fn grayscale_has_equal_channels() {
        let out = preprocess(&gradient(), PreprocessMode::Grayscale);
        assert!(out.image.pixels().all(|p| p.0[0] == p.0[1] && p.0[1] == p.0[2]));
    }

    #[test]
    fn equalize_stretches_contrast() {
        let frame = gradient();
        let spread = |img: &RgbImage| {
            let l = imageops::grayscale(img);
            let (min, max) = l.pixels().fold((255u8, 0u8), |(lo, hi), p| (lo.min(p.0[0]), hi.max(p.0[0])));
            max - min
        };
        let out = preprocess(&frame, PreprocessMode::GrayscaleEqualize);
        assert!(spread(&out.image) > spread(&frame.image));
        let out = preprocess(&frame, PreprocessMode::Equalize);
        assert!(spread(&out.image) > spread(&frame.image));
    }
}
