//! Child-safety risk analysis over video sources.
//!
//! Frames flow from a capture thread through drop-oldest queues into an
//! inference thread that fuses detections, applies the risk rules and draws
//! the result. Alerts fan out to [`RiskObserver`]s; notifications leave the
//! process through a bounded worker pool.

pub mod annotation;
pub mod config;
pub mod encoding;
pub mod error;
pub mod export;
pub mod live;
pub mod notify;
pub mod observers;
pub mod pipeline;
pub mod preprocess;
pub mod queue;
pub mod risk;
pub mod telemetry;
pub mod watchdog;

pub use config::{
    CooldownConfig, HazardRule, NotifyConfig, PipelineConfig, PreprocessMode, RiskConfig,
    SurfaceConfig, TelemetryOptions,
};
pub use error::VisionError;
pub use live::{LiveSession, Outbound, StreamAlertLog};
pub use notify::{LogNotifier, NotificationDispatcher, NotificationService};
pub use observers::{AlertFeed, AlertMetrics, AlertRecord, Bell, ImageArchive, NotifyObserver};
pub use pipeline::{FrameStore, RenderTicker, SourceInfo, SourceManager};
pub use queue::DropOldestQueue;
pub use risk::{GridCell, RiskEngine, RiskEvent, RiskObserver, ZoneBook, ZoneMap};
