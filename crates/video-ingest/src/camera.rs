//! OpenCV-backed capture for cameras, files and network streams.

use std::time::Duration;

use opencv::{
    core::MatTraitConstManual,
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTrait},
};
use tracing::warn;

use crate::types::{CaptureError, CaptureOptions, Frame, frame_period, parse_device_index};

pub struct OpenCvCapture {
    cap: VideoCapture,
    frame: Mat,
    sequence: u64,
    period: Duration,
}

impl OpenCvCapture {
    pub fn open(uri: &str, options: CaptureOptions) -> Result<Self, CaptureError> {
        let cap = open_video_capture(uri)?;
        let fps = cap
            .get(videoio::CAP_PROP_FPS)
            .ok()
            .filter(|fps| *fps > 0.0)
            .unwrap_or(options.fallback_fps);
        Ok(Self {
            cap,
            frame: Mat::default(),
            sequence: 0,
            period: frame_period(fps),
        })
    }

    pub fn read(&mut self) -> Result<Option<Frame>, CaptureError> {
        let grabbed = self
            .cap
            .read(&mut self.frame)
            .map_err(|e| CaptureError::Other(e.into()))?;
        if !grabbed {
            return Ok(None);
        }
        let size = self
            .frame
            .size()
            .map_err(|e| CaptureError::Other(e.into()))?;
        if size.width <= 0 || size.height <= 0 {
            return Ok(None);
        }
        let data = self
            .frame
            .data_bytes()
            .map_err(|e| CaptureError::Other(e.into()))?;
        self.sequence = self.sequence.wrapping_add(1);
        Frame::from_bgr(data, size.width as u32, size.height as u32, self.sequence).map(Some)
    }

    /// Seek back to the first frame of a recorded file.
    pub fn rewind(&mut self) -> Result<(), CaptureError> {
        self.cap
            .set(videoio::CAP_PROP_POS_FRAMES, 0.0)
            .map_err(|e| CaptureError::Other(e.into()))?;
        Ok(())
    }

    pub fn frame_period(&self) -> Duration {
        self.period
    }

    pub fn is_opened(&self) -> bool {
        self.cap.is_opened().unwrap_or(false)
    }

    pub fn release(&mut self) {
        if self.is_opened() {
            if let Err(err) = self.cap.release() {
                warn!("video-ingest: failed to release capture: {err}");
            }
        }
    }
}

/// Attempt to open a camera input either by index or URI.
fn open_video_capture(uri: &str) -> Result<VideoCapture, CaptureError> {
    if let Some(index) = parse_device_index(uri) {
        for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
            match VideoCapture::new(index, backend) {
                Ok(cap) => {
                    if cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
                        return Ok(cap);
                    }
                }
                Err(err) => {
                    warn!("video-ingest: failed to open device #{index} with backend {backend}: {err}");
                }
            }
        }
    }

    match VideoCapture::from_file(uri, videoio::CAP_ANY) {
        Ok(cap) => {
            if cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
                return Ok(cap);
            }
        }
        Err(err) => {
            warn!("video-ingest: failed to open {uri}: {err}");
        }
    }

    Err(CaptureError::Open {
        uri: uri.to_string(),
    })
}
