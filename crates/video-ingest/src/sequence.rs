//! Still-image directories replayed as a looping video.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::types::{CaptureError, Frame, frame_period};

const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

pub struct ImageSequence {
    paths: Vec<PathBuf>,
    cursor: usize,
    sequence: u64,
    period: Duration,
    open: bool,
}

impl ImageSequence {
    pub fn open(dir: &Path, fps: f64) -> Result<Self, CaptureError> {
        let mut paths: Vec<PathBuf> = fs::read_dir(dir)
            .map_err(|_| CaptureError::Open {
                uri: dir.display().to_string(),
            })?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .collect();
        if paths.is_empty() {
            return Err(CaptureError::Open {
                uri: dir.display().to_string(),
            });
        }
        paths.sort();
        Ok(Self {
            paths,
            cursor: 0,
            sequence: 0,
            period: frame_period(fps),
            open: true,
        })
    }

    pub fn read(&mut self) -> Result<Option<Frame>, CaptureError> {
        if !self.open {
            return Ok(None);
        }
        let Some(path) = self.paths.get(self.cursor) else {
            return Ok(None);
        };
        self.cursor += 1;
        let image = image::open(path)
            .map_err(|source| CaptureError::Decode {
                path: path.clone(),
                source,
            })?
            .to_rgb8();
        self.sequence = self.sequence.wrapping_add(1);
        Ok(Some(Frame::new(image, self.sequence)))
    }

    pub fn rewind(&mut self) -> Result<(), CaptureError> {
        self.cursor = 0;
        Ok(())
    }

    pub fn frame_period(&self) -> Duration {
        self.period
    }

    pub fn is_opened(&self) -> bool {
        self.open
    }

    pub fn release(&mut self) {
        self.open = false;
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use image::{Rgb, RgbImage};

    use super::*;

    #[test]
    fn images_are_read_in_name_order_and_rewound() {
        let dir = tempfile::tempdir().unwrap();
        RgbImage::from_pixel(4, 4, Rgb([2, 2, 2]))
            .save(dir.path().join("b.png"))
            .unwrap();
        RgbImage::from_pixel(4, 4, Rgb([1, 1, 1]))
            .save(dir.path().join("a.png"))
            .unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut seq = ImageSequence::open(dir.path(), 10.0).unwrap();
        assert_eq!(seq.len(), 2);
        assert_eq!(seq.read().unwrap().unwrap().image.get_pixel(0, 0).0, [1, 1, 1]);
        assert_eq!(seq.read().unwrap().unwrap().image.get_pixel(0, 0).0, [2, 2, 2]);
        assert!(seq.read().unwrap().is_none());

        seq.rewind().unwrap();
        assert_eq!(seq.read().unwrap().unwrap().image.get_pixel(0, 0).0, [1, 1, 1]);
    }

    #[test]
    fn empty_directory_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ImageSequence::open(dir.path(), 10.0),
            Err(CaptureError::Open { .. })
        ));
    }
}
