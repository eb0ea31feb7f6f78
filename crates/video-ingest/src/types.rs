use std::{path::PathBuf, sync::Arc, time::Duration};

use chrono::Utc;
use image::RgbImage;
use thiserror::Error;

/// Decoded RGB frame captured from a video source.
#[derive(Clone, Debug)]
pub struct Frame {
    pub image: RgbImage,
    pub timestamp_ms: i64,
    pub sequence: u64,
}

impl Frame {
    /// Wrap an already decoded image, stamping it with the wall clock.
    pub fn new(image: RgbImage, sequence: u64) -> Self {
        Self {
            image,
            timestamp_ms: Utc::now().timestamp_millis(),
            sequence,
        }
    }

    /// Build a frame from a tightly packed BGR8 buffer (OpenCV layout).
    pub fn from_bgr(
        data: &[u8],
        width: u32,
        height: u32,
        sequence: u64,
    ) -> Result<Self, CaptureError> {
        let expected = (width as usize) * (height as usize) * 3;
        if data.len() != expected {
            return Err(CaptureError::FrameSize {
                got: data.len(),
                width,
                height,
            });
        }
        let mut rgb = Vec::with_capacity(expected);
        for px in data.chunks_exact(3) {
            rgb.extend_from_slice(&[px[2], px[1], px[0]]);
        }
        Self::from_rgb(rgb, width, height, sequence)
    }

    /// Build a frame from a tightly packed RGB8 buffer.
    pub fn from_rgb(
        data: Vec<u8>,
        width: u32,
        height: u32,
        sequence: u64,
    ) -> Result<Self, CaptureError> {
        let got = data.len();
        let image = RgbImage::from_raw(width, height, data).ok_or(CaptureError::FrameSize {
            got,
            width,
            height,
        })?;
        Ok(Self::new(image, sequence))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video source {uri:?}")]
    Open { uri: String },
    #[error("frame buffer holds {got} bytes, which does not match {width}x{height}")]
    FrameSize { got: usize, width: u32, height: u32 },
    #[error("failed to decode {path:?}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// How a source behaves once it runs out of frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Playback {
    /// Cameras and network streams: a failed read ends the capture loop.
    Live,
    /// Recorded media: a failed read rewinds to the first frame and reads
    /// are paced to the native frame period.
    Looping,
}

/// Frames held in memory, replayed either as a live feed or a looping file.
#[derive(Clone, Debug)]
pub struct MemoryClip {
    pub name: String,
    pub frames: Arc<[RgbImage]>,
    pub fps: Option<f64>,
    pub playback: Playback,
}

impl MemoryClip {
    pub fn new(name: impl Into<String>, frames: Vec<RgbImage>, playback: Playback) -> Self {
        Self {
            name: name.into(),
            frames: frames.into(),
            fps: None,
            playback,
        }
    }

    pub fn with_fps(mut self, fps: f64) -> Self {
        self.fps = Some(fps);
        self
    }
}

/// Description of a video source before it is opened.
#[derive(Clone, Debug)]
pub enum SourceSpec {
    /// Local camera by index (`/dev/videoN`).
    Device(i32),
    /// Recorded video file, looped when it reaches the end.
    File(PathBuf),
    /// Network stream (RTSP/HTTP/UDP URI).
    Stream(String),
    /// Directory of still images replayed in name order.
    ImageSequence { dir: PathBuf, fps: f64 },
    /// Pre-decoded frames.
    Memory(MemoryClip),
}

impl SourceSpec {
    /// Interpret a CLI-style URI: integers and `/dev/videoN` are devices,
    /// URIs with a scheme are streams, directories are image sequences and
    /// everything else is a file.
    pub fn parse(uri: &str, sequence_fps: f64) -> Self {
        if let Some(index) = parse_device_index(uri) {
            return SourceSpec::Device(index);
        }
        if uri.contains("://") {
            return SourceSpec::Stream(uri.to_string());
        }
        let path = PathBuf::from(uri);
        if path.is_dir() {
            SourceSpec::ImageSequence {
                dir: path,
                fps: sequence_fps,
            }
        } else {
            SourceSpec::File(path)
        }
    }

    pub fn playback(&self) -> Playback {
        match self {
            SourceSpec::Device(_) | SourceSpec::Stream(_) => Playback::Live,
            SourceSpec::File(_) | SourceSpec::ImageSequence { .. } => Playback::Looping,
            SourceSpec::Memory(clip) => clip.playback,
        }
    }

    /// Short tag used as the prefix of generated source identifiers.
    pub fn kind_tag(&self) -> &'static str {
        match self {
            SourceSpec::Device(_) | SourceSpec::Stream(_) => "live",
            SourceSpec::File(_) | SourceSpec::ImageSequence { .. } => "video",
            SourceSpec::Memory(_) => "memory",
        }
    }

    /// Human-readable name shown next to alerts.
    pub fn display_name(&self) -> String {
        match self {
            SourceSpec::Device(index) => format!("Cámara {index}"),
            SourceSpec::Stream(uri) => uri.clone(),
            SourceSpec::File(path) | SourceSpec::ImageSequence { dir: path, .. } => path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
            SourceSpec::Memory(clip) => clip.name.clone(),
        }
    }

    pub fn uri(&self) -> String {
        match self {
            SourceSpec::Device(index) => format!("/dev/video{index}"),
            SourceSpec::Stream(uri) => uri.clone(),
            SourceSpec::File(path) | SourceSpec::ImageSequence { dir: path, .. } => {
                path.display().to_string()
            }
            SourceSpec::Memory(clip) => format!("memory://{}", clip.name),
        }
    }
}

/// Options shared by the decoding backends.
#[derive(Clone, Copy, Debug)]
pub struct CaptureOptions {
    /// Output size for backends that need a fixed raw frame layout.
    pub target_size: (u32, u32),
    /// Frame rate assumed when the container does not report one.
    pub fallback_fps: f64,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            target_size: (640, 480),
            fallback_fps: 25.0,
        }
    }
}

/// Convert a frame rate into a per-frame duration. Rates below 1 fps are
/// treated as 1 fps.
pub fn frame_period(fps: f64) -> Duration {
    Duration::from_secs_f64(1.0 / fps.max(1.0))
}

/// Parse a `/dev/videoX` style URI and return the zero-based index if present.
pub fn parse_device_index(uri: &str) -> Option<i32> {
    if let Ok(index) = uri.parse::<i32>() {
        return Some(index);
    }
    if let Some(stripped) = uri.strip_prefix("/dev/video") {
        if !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit()) {
            return stripped.parse::<i32>().ok();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bgr_buffers_are_swizzled_to_rgb() {
        let frame = Frame::from_bgr(&[1, 2, 3, 4, 5, 6], 2, 1, 0).unwrap();
        assert_eq!(frame.image.get_pixel(0, 0).0, [3, 2, 1]);
        assert_eq!(frame.image.get_pixel(1, 0).0, [6, 5, 4]);
    }

    #[test]
    fn mismatched_buffer_is_rejected() {
        let err = Frame::from_bgr(&[0; 5], 2, 1, 0).unwrap_err();
        assert!(matches!(err, CaptureError::FrameSize { got: 5, .. }));
    }

    #[test]
    fn uris_map_to_source_kinds() {
        assert!(matches!(SourceSpec::parse("0", 10.0), SourceSpec::Device(0)));
        assert!(matches!(
            SourceSpec::parse("/dev/video2", 10.0),
            SourceSpec::Device(2)
        ));
        assert!(matches!(
            SourceSpec::parse("rtsp://cam/stream", 10.0),
            SourceSpec::Stream(_)
        ));
        assert!(matches!(
            SourceSpec::parse("clips/kitchen.mp4", 10.0),
            SourceSpec::File(_)
        ));
        assert_eq!(parse_device_index("/dev/video"), None);
    }

    #[test]
    fn display_names_follow_source_kind() {
        assert_eq!(SourceSpec::Device(1).display_name(), "Cámara 1");
        assert_eq!(
            SourceSpec::File(PathBuf::from("/tmp/sala.mp4")).display_name(),
            "sala.mp4"
        );
        assert_eq!(SourceSpec::Device(0).playback(), Playback::Live);
        assert_eq!(
            SourceSpec::File(PathBuf::from("a.mp4")).playback(),
            Playback::Looping
        );
    }

    #[test]
    fn frame_period_is_clamped() {
        assert_eq!(frame_period(0.0), Duration::from_secs(1));
        assert_eq!(frame_period(25.0), Duration::from_millis(40));
    }
}
