use std::{path::PathBuf, time::Duration};

use image::{Rgb, RgbImage};
use video_ingest::{CaptureError, CaptureHandle, CaptureOptions, MemoryClip, Playback, SourceSpec};

fn clip(frames: usize) -> MemoryClip {
    let frames = (0..frames)
        .map(|i| RgbImage::from_pixel(8, 6, Rgb([i as u8, 0, 0])))
        .collect();
    MemoryClip::new("kitchen", frames, Playback::Looping).with_fps(20.0)
}

#[test]
fn memory_handle_reads_rewinds_and_releases() {
    let spec = SourceSpec::Memory(clip(2));
    let mut handle = CaptureHandle::open(&spec, CaptureOptions::default()).unwrap();

    assert_eq!(handle.frame_period(), Some(Duration::from_millis(50)));
    let first = handle.read().unwrap().unwrap();
    assert_eq!(first.sequence, 1);
    assert_eq!((first.width(), first.height()), (8, 6));
    assert!(handle.read().unwrap().is_some());
    assert!(handle.read().unwrap().is_none());

    handle.rewind().unwrap();
    assert_eq!(handle.read().unwrap().unwrap().image.get_pixel(0, 0).0, [0, 0, 0]);

    handle.release();
    assert!(!handle.is_opened());
    assert!(handle.read().unwrap().is_none());
    handle.release();
}

#[test]
fn empty_clip_fails_to_open() {
    let spec = SourceSpec::Memory(MemoryClip::new("empty", Vec::new(), Playback::Live));
    assert!(matches!(
        CaptureHandle::open(&spec, CaptureOptions::default()),
        Err(CaptureError::Open { .. })
    ));
}

#[test]
fn missing_file_fails_to_open() {
    let spec = SourceSpec::File(PathBuf::from("/definitely/not/here.mp4"));
    assert!(matches!(
        CaptureHandle::open(&spec, CaptureOptions::default()),
        Err(CaptureError::Open { .. })
    ));
}
