use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VisionError {
    #[error("failed to access {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path:?}: {source}")]
    Config {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("invalid zone {name:?}: {reason}")]
    Zone { name: String, reason: String },
    #[error("unknown source {0:?}")]
    UnknownSource(String),
    #[error("malformed frame payload: {0}")]
    Payload(String),
    #[error("failed to encode image: {0}")]
    Encode(#[from] image::ImageError),
    #[error(transparent)]
    Capture(#[from] video_ingest::CaptureError),
    #[error(transparent)]
    Detect(#[from] ml_core::DetectError),
}
