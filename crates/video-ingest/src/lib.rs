//! Video capture handles used by the monitoring pipeline.
//!
//! A source is described by a [`SourceSpec`] and opened into a
//! [`CaptureHandle`], a closed set of decoding backends that all expose the
//! same pull-based `read` / `rewind` / `release` surface. Live sources stop on
//! the first failed read; recorded sources rewind and are paced by the caller
//! using [`CaptureHandle::frame_period`].

#[cfg(feature = "with-opencv")]
mod camera;
mod ffmpeg;
mod memory;
mod sequence;
mod types;

use std::time::Duration;

#[cfg(feature = "with-opencv")]
pub use camera::OpenCvCapture;
pub use ffmpeg::FfmpegCapture;
pub use memory::MemoryCapture;
pub use sequence::ImageSequence;
pub use types::{
    CaptureError, CaptureOptions, Frame, MemoryClip, Playback, SourceSpec, frame_period,
    parse_device_index,
};

/// An opened video source.
pub enum CaptureHandle {
    #[cfg(feature = "with-opencv")]
    OpenCv(OpenCvCapture),
    Ffmpeg(FfmpegCapture),
    Images(ImageSequence),
    Memory(MemoryCapture),
}

impl CaptureHandle {
    /// Open `spec`, failing with [`CaptureError::Open`] when the source
    /// cannot produce frames.
    pub fn open(spec: &SourceSpec, options: CaptureOptions) -> Result<Self, CaptureError> {
        match spec {
            SourceSpec::Device(_) | SourceSpec::Stream(_) | SourceSpec::File(_) => {
                if let SourceSpec::File(path) = spec {
                    if !path.is_file() {
                        return Err(CaptureError::Open { uri: spec.uri() });
                    }
                }
                open_decoder(&spec.uri(), options)
            }
            SourceSpec::ImageSequence { dir, fps } => {
                ImageSequence::open(dir, *fps).map(CaptureHandle::Images)
            }
            SourceSpec::Memory(clip) => MemoryCapture::open(clip.clone()).map(CaptureHandle::Memory),
        }
    }

    /// Read the next frame. `Ok(None)` means the source produced nothing
    /// (end of file or a dropped device).
    pub fn read(&mut self) -> Result<Option<Frame>, CaptureError> {
        match self {
            #[cfg(feature = "with-opencv")]
            CaptureHandle::OpenCv(cap) => cap.read(),
            CaptureHandle::Ffmpeg(cap) => cap.read(),
            CaptureHandle::Images(cap) => cap.read(),
            CaptureHandle::Memory(cap) => cap.read(),
        }
    }

    /// Seek back to the first frame.
    pub fn rewind(&mut self) -> Result<(), CaptureError> {
        match self {
            #[cfg(feature = "with-opencv")]
            CaptureHandle::OpenCv(cap) => cap.rewind(),
            CaptureHandle::Ffmpeg(cap) => cap.rewind(),
            CaptureHandle::Images(cap) => cap.rewind(),
            CaptureHandle::Memory(cap) => cap.rewind(),
        }
    }

    /// Native duration of one frame, when the source has one.
    pub fn frame_period(&self) -> Option<Duration> {
        match self {
            #[cfg(feature = "with-opencv")]
            CaptureHandle::OpenCv(cap) => Some(cap.frame_period()),
            CaptureHandle::Ffmpeg(cap) => Some(cap.frame_period()),
            CaptureHandle::Images(cap) => Some(cap.frame_period()),
            CaptureHandle::Memory(cap) => cap.frame_period(),
        }
    }

    pub fn is_opened(&self) -> bool {
        match self {
            #[cfg(feature = "with-opencv")]
            CaptureHandle::OpenCv(cap) => cap.is_opened(),
            CaptureHandle::Ffmpeg(cap) => cap.is_opened(),
            CaptureHandle::Images(cap) => cap.is_opened(),
            CaptureHandle::Memory(cap) => cap.is_opened(),
        }
    }

    /// Release the underlying device or process. Safe to call twice.
    pub fn release(&mut self) {
        match self {
            #[cfg(feature = "with-opencv")]
            CaptureHandle::OpenCv(cap) => cap.release(),
            CaptureHandle::Ffmpeg(cap) => cap.release(),
            CaptureHandle::Images(cap) => cap.release(),
            CaptureHandle::Memory(cap) => cap.release(),
        }
    }
}

#[cfg(feature = "with-opencv")]
fn open_decoder(uri: &str, options: CaptureOptions) -> Result<CaptureHandle, CaptureError> {
    OpenCvCapture::open(uri, options).map(CaptureHandle::OpenCv)
}

#[cfg(not(feature = "with-opencv"))]
fn open_decoder(uri: &str, options: CaptureOptions) -> Result<CaptureHandle, CaptureError> {
    FfmpegCapture::open(uri, options).map(CaptureHandle::Ffmpeg)
}
