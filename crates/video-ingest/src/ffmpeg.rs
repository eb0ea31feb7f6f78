//! FFmpeg pipe reader decoding any URI into packed RGB frames.
//!
//! The child process writes raw `rgb24` frames of a fixed size to stdout; the
//! reader pulls one frame per call. Rewinding restarts the process.

use std::{
    io::{ErrorKind, Read},
    process::{Child, ChildStdout, Command, Stdio},
    time::Duration,
};

use anyhow::anyhow;
use tracing::debug;

use crate::types::{CaptureError, CaptureOptions, Frame, frame_period, parse_device_index};

pub struct FfmpegCapture {
    uri: String,
    target_size: (u32, u32),
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    pending: Option<Frame>,
    buffer: Vec<u8>,
    sequence: u64,
    period: Duration,
}

impl FfmpegCapture {
    /// Spawn FFmpeg and read the first frame so that an unreachable source
    /// fails here instead of inside the capture loop.
    pub fn open(uri: &str, options: CaptureOptions) -> Result<Self, CaptureError> {
        let (width, height) = options.target_size;
        let mut capture = Self {
            uri: uri.to_string(),
            target_size: options.target_size,
            child: None,
            stdout: None,
            pending: None,
            buffer: vec![0u8; (width as usize) * (height as usize) * 3],
            sequence: 0,
            period: frame_period(options.fallback_fps),
        };
        capture.spawn()?;
        match capture.read_raw()? {
            Some(frame) => capture.pending = Some(frame),
            None => {
                capture.release();
                return Err(CaptureError::Open {
                    uri: uri.to_string(),
                });
            }
        }
        Ok(capture)
    }

    fn spawn(&mut self) -> Result<(), CaptureError> {
        let (width, height) = self.target_size;
        let scale_arg = format!("scale={width}:{height}");

        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-hide_banner").arg("-loglevel").arg("error");

        if let Some(index) = parse_device_index(&self.uri) {
            cmd.arg("-f")
                .arg("video4linux2")
                .arg("-i")
                .arg(format!("/dev/video{index}"));
        } else {
            if self.uri.starts_with("rtsp://") || self.uri.starts_with("rtsps://") {
                cmd.arg("-rtsp_transport").arg("tcp");
            }
            cmd.arg("-i").arg(&self.uri);
        }

        cmd.arg("-an")
            .arg("-vf")
            .arg(&scale_arg)
            .arg("-pix_fmt")
            .arg("rgb24")
            .arg("-f")
            .arg("rawvideo")
            .arg("-")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut child = cmd.spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CaptureError::Other(anyhow!("failed to capture ffmpeg stdout")))?;
        debug!(uri = %self.uri, "ffmpeg reader started");
        self.child = Some(child);
        self.stdout = Some(stdout);
        Ok(())
    }

    fn read_raw(&mut self) -> Result<Option<Frame>, CaptureError> {
        let Some(stdout) = self.stdout.as_mut() else {
            return Ok(None);
        };
        match stdout.read_exact(&mut self.buffer) {
            Ok(()) => {
                let (width, height) = self.target_size;
                self.sequence = self.sequence.wrapping_add(1);
                Frame::from_rgb(self.buffer.clone(), width, height, self.sequence).map(Some)
            }
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub fn read(&mut self) -> Result<Option<Frame>, CaptureError> {
        if let Some(frame) = self.pending.take() {
            return Ok(Some(frame));
        }
        self.read_raw()
    }

    pub fn rewind(&mut self) -> Result<(), CaptureError> {
        self.release();
        self.spawn()
    }

    pub fn frame_period(&self) -> Duration {
        self.period
    }

    pub fn is_opened(&self) -> bool {
        self.stdout.is_some()
    }

    pub fn release(&mut self) {
        self.stdout = None;
        self.pending = None;
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl Drop for FfmpegCapture {
    fn drop(&mut self) {
        self.release();
    }
}
