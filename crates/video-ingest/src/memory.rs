use std::time::Duration;

use crate::types::{CaptureError, Frame, MemoryClip, frame_period};

/// Capture handle replaying a [`MemoryClip`].
pub struct MemoryCapture {
    clip: MemoryClip,
    cursor: usize,
    sequence: u64,
    open: bool,
}

impl MemoryCapture {
    pub fn open(clip: MemoryClip) -> Result<Self, CaptureError> {
        if clip.frames.is_empty() {
            return Err(CaptureError::Open {
                uri: format!("memory://{}", clip.name),
            });
        }
        Ok(Self {
            clip,
            cursor: 0,
            sequence: 0,
            open: true,
        })
    }

    pub fn read(&mut self) -> Result<Option<Frame>, CaptureError> {
        if !self.open {
            return Ok(None);
        }
        let Some(image) = self.clip.frames.get(self.cursor) else {
            return Ok(None);
        };
        self.cursor += 1;
        self.sequence = self.sequence.wrapping_add(1);
        Ok(Some(Frame::new(image.clone(), self.sequence)))
    }

    pub fn rewind(&mut self) -> Result<(), CaptureError> {
        self.cursor = 0;
        Ok(())
    }

    pub fn frame_period(&self) -> Option<Duration> {
        self.clip.fps.map(frame_period)
    }

    pub fn is_opened(&self) -> bool {
        self.open
    }

    pub fn release(&mut self) {
        self.open = false;
    }
}
