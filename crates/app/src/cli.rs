//! Command line parsing and validation into typed run configurations.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use video_ingest::SourceSpec;
use vision::{NotifyConfig, PipelineConfig, PreprocessMode, RiskConfig};

#[derive(Debug, Parser)]
#[command(
    name = "child-watch",
    version,
    about = "Watches video sources for children near household hazards"
)]
pub struct Cli {
    /// Emit Chrome trace JSON for post-mortem analysis.
    #[arg(long = "chrome-trace", value_name = "PATH", global = true)]
    pub chrome_trace: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the capture/inference pipeline over one or more sources.
    Monitor(MonitorArgs),
    /// Accept frames pushed by remote clients over TCP.
    Live(LiveArgs),
    /// Inspect or edit a zone file.
    Zones(ZonesArgs),
}

/// Detector and rule options shared by `monitor` and `live`.
#[derive(Debug, Args)]
pub struct DetectorArgs {
    /// Primary (domain-specific) TorchScript model.
    #[arg(long = "model", value_name = "PATH")]
    pub model: PathBuf,
    /// Class names of the primary model, one per line.
    #[arg(long = "labels", value_name = "PATH")]
    pub labels: Option<PathBuf>,
    /// Secondary generic model whose labels are remapped.
    #[arg(long = "secondary-model", value_name = "PATH")]
    pub secondary_model: Option<PathBuf>,
    /// Class names of the secondary model; defaults to COCO.
    #[arg(long = "secondary-labels", value_name = "PATH", requires = "secondary_model")]
    pub secondary_labels: Option<PathBuf>,
    /// JSON file overriding thresholds, cooldowns and rule tables.
    #[arg(long = "rules", value_name = "PATH")]
    pub rules: Option<PathBuf>,
    /// Overlap above which same-label boxes from both models are merged.
    #[arg(long = "fusion-iou", value_name = "IOU", default_value_t = ml_core::FUSION_IOU)]
    pub fusion_iou: f32,
}

#[derive(Debug, Args)]
pub struct MonitorArgs {
    /// Source to watch, optionally named: `kitchen=/dev/video0`, `clip.mp4`,
    /// `rtsp://cam/stream`. Repeatable.
    #[arg(long = "source", value_name = "[ID=]URI", required = true)]
    pub sources: Vec<String>,
    #[command(flatten)]
    pub detector: DetectorArgs,
    /// Zone file. Edits are picked up while running.
    #[arg(long = "zones", value_name = "PATH")]
    pub zones: Option<PathBuf>,
    /// Directory for alert snapshots.
    #[arg(long = "alerts-dir", value_name = "DIR", default_value = "alertas")]
    pub alerts_dir: PathBuf,
    /// Do not write alert snapshots.
    #[arg(long = "no-archive", action = clap::ArgAction::SetTrue)]
    pub no_archive: bool,
    /// Write the alert history as CSV on exit.
    #[arg(long = "export-csv", value_name = "PATH")]
    pub export_csv: Option<PathBuf>,
    /// Frame preprocessing: none, grayscale, equalize, grayscale-equalize.
    #[arg(long = "preprocess", value_name = "MODE", default_value = "none")]
    pub preprocess: String,
    /// Frame rate assumed for files that do not report one.
    #[arg(long = "fallback-fps", value_name = "FPS", default_value_t = 25.0)]
    pub fallback_fps: f64,
    /// Playback rate for image directories.
    #[arg(long = "sequence-fps", value_name = "FPS", default_value_t = 10.0)]
    pub sequence_fps: f64,
    /// Capture width for decoders that need a fixed size.
    #[arg(long = "width", value_name = "PX", default_value_t = 640)]
    pub width: u32,
    /// Capture height for decoders that need a fixed size.
    #[arg(long = "height", value_name = "PX", default_value_t = 480)]
    pub height: u32,
    /// Seconds without progress before a stage is reported as stalled.
    #[arg(long = "stall-secs", value_name = "SECS", default_value_t = 10.0)]
    pub stall_secs: f64,
    /// Preview server address.
    #[arg(long = "bind", value_name = "ADDR", default_value = "0.0.0.0:8080")]
    pub bind: SocketAddr,
    /// Do not start the preview server.
    #[arg(long = "no-server", action = clap::ArgAction::SetTrue)]
    pub no_server: bool,
    /// Also accept pushed frames on this address.
    #[arg(long = "live-bind", value_name = "ADDR")]
    pub live_bind: Option<SocketAddr>,
    /// Disable outbound notifications.
    #[arg(long = "no-notify", action = clap::ArgAction::SetTrue)]
    pub no_notify: bool,
    /// Concurrent outbound notifications.
    #[arg(long = "notify-workers", value_name = "N", default_value_t = 2)]
    pub notify_workers: usize,
    /// Do not ring the terminal bell on alerts.
    #[arg(long = "no-sound", action = clap::ArgAction::SetTrue)]
    pub no_sound: bool,
}

#[derive(Debug, Args)]
pub struct LiveArgs {
    #[command(flatten)]
    pub detector: DetectorArgs,
    /// Address to accept clients on.
    #[arg(long = "bind", value_name = "ADDR", default_value = "0.0.0.0:8765")]
    pub bind: SocketAddr,
    /// Write the stream alert log as CSV on exit.
    #[arg(long = "export-csv", value_name = "PATH")]
    pub export_csv: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct ZonesArgs {
    /// Zone file to read and update.
    #[arg(long = "file", value_name = "PATH", default_value = "zones.json")]
    pub file: PathBuf,
    #[command(subcommand)]
    pub action: ZoneAction,
}

#[derive(Debug, Subcommand)]
pub enum ZoneAction {
    /// Print every zone.
    List,
    /// Add a polygon to a zone, creating it if needed.
    Add {
        #[arg(long = "source", value_name = "ID")]
        source: String,
        #[arg(long = "name", value_name = "NAME")]
        name: String,
        /// Vertex as `x,y`; at least three.
        #[arg(long = "point", value_name = "X,Y", value_parser = parse_point, required = true)]
        points: Vec<(f64, f64)>,
        /// Scale of the display the points were picked on.
        #[arg(long = "scale", value_name = "FACTOR", default_value_t = 1.0)]
        scale: f64,
        /// Frame size the points are clamped to, as `WIDTHxHEIGHT`.
        #[arg(long = "frame", value_name = "WxH", value_parser = parse_size)]
        frame: Option<(u32, u32)>,
    },
    /// Remove a zone by name.
    Remove {
        #[arg(long = "source", value_name = "ID")]
        source: String,
        #[arg(long = "name", value_name = "NAME")]
        name: String,
    },
    /// Remove every zone of a source.
    Clear {
        #[arg(long = "source", value_name = "ID")]
        source: String,
    },
}

/// A source to open, with an optional caller-chosen id.
#[derive(Clone, Debug)]
pub struct SourceRequest {
    pub id: Option<String>,
    pub spec: SourceSpec,
}

#[derive(Clone, Debug)]
pub struct DetectorConfig {
    pub model: PathBuf,
    pub labels: Option<PathBuf>,
    pub secondary_model: Option<PathBuf>,
    pub secondary_labels: Option<PathBuf>,
    pub fusion_iou: f32,
    pub risk: RiskConfig,
}

#[derive(Clone, Debug)]
pub struct MonitorConfig {
    pub sources: Vec<SourceRequest>,
    pub detector: DetectorConfig,
    pub zones: Option<PathBuf>,
    pub archive_dir: Option<PathBuf>,
    pub export_csv: Option<PathBuf>,
    pub pipeline: PipelineConfig,
    pub notify: NotifyConfig,
    pub bind: Option<SocketAddr>,
    pub live_bind: Option<SocketAddr>,
}

#[derive(Clone, Debug)]
pub struct LiveConfig {
    pub detector: DetectorConfig,
    pub bind: SocketAddr,
    pub export_csv: Option<PathBuf>,
}

impl TryFrom<DetectorArgs> for DetectorConfig {
    type Error = anyhow::Error;

    fn try_from(args: DetectorArgs) -> Result<Self> {
        let risk = match args.rules.as_deref() {
            Some(path) => RiskConfig::from_file(path)
                .with_context(|| format!("loading rules from {}", path.display()))?,
            None => RiskConfig::default(),
        };
        risk.validate()?;
        if !(args.fusion_iou > 0.0 && args.fusion_iou <= 1.0) {
            bail!("--fusion-iou must be in (0, 1]");
        }
        Ok(Self {
            model: args.model,
            labels: args.labels,
            secondary_model: args.secondary_model,
            secondary_labels: args.secondary_labels,
            fusion_iou: args.fusion_iou,
            risk,
        })
    }
}

impl TryFrom<MonitorArgs> for MonitorConfig {
    type Error = anyhow::Error;

    fn try_from(args: MonitorArgs) -> Result<Self> {
        if !(args.fallback_fps.is_finite() && args.fallback_fps > 0.0) {
            bail!("--fallback-fps must be a positive number");
        }
        if !(args.sequence_fps.is_finite() && args.sequence_fps > 0.0) {
            bail!("--sequence-fps must be a positive number");
        }
        if args.width == 0 || args.height == 0 {
            bail!("--width and --height must be positive");
        }
        if !(args.stall_secs.is_finite() && args.stall_secs > 0.0) {
            bail!("--stall-secs must be a positive number");
        }
        if args.notify_workers == 0 {
            bail!("--notify-workers must be at least 1");
        }

        let sources = args
            .sources
            .iter()
            .map(|raw| parse_source(raw, args.sequence_fps))
            .collect::<Result<Vec<_>>>()?;
        let preprocess: PreprocessMode = args.preprocess.parse()?;

        let pipeline = PipelineConfig {
            fallback_fps: args.fallback_fps,
            capture_size: (args.width, args.height),
            preprocess,
            stall_threshold: Duration::from_secs_f64(args.stall_secs),
            ..PipelineConfig::default()
        };
        let notify = NotifyConfig {
            enabled: !args.no_notify,
            max_concurrency: args.notify_workers,
            sound: !args.no_sound,
            ..NotifyConfig::default()
        };

        Ok(Self {
            sources,
            detector: args.detector.try_into()?,
            zones: args.zones,
            archive_dir: (!args.no_archive).then_some(args.alerts_dir),
            export_csv: args.export_csv,
            pipeline,
            notify,
            bind: (!args.no_server).then_some(args.bind),
            live_bind: args.live_bind,
        })
    }
}

impl TryFrom<LiveArgs> for LiveConfig {
    type Error = anyhow::Error;

    fn try_from(args: LiveArgs) -> Result<Self> {
        Ok(Self {
            detector: args.detector.try_into()?,
            bind: args.bind,
            export_csv: args.export_csv,
        })
    }
}

/// Split `id=uri`. The prefix only counts as an id when it is a plain word,
/// so URIs containing `=` in their query string are left alone.
pub fn parse_source(raw: &str, sequence_fps: f64) -> Result<SourceRequest> {
    let raw = raw.trim();
    if raw.is_empty() {
        bail!("empty --source");
    }
    let (id, uri) = match raw.split_once('=') {
        Some((id, uri))
            if !id.is_empty()
                && id
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') =>
        {
            (Some(id.to_string()), uri)
        }
        _ => (None, raw),
    };
    if uri.is_empty() {
        bail!("--source {raw:?} has no URI");
    }
    Ok(SourceRequest {
        id,
        spec: SourceSpec::parse(uri, sequence_fps),
    })
}

fn parse_point(raw: &str) -> std::result::Result<(f64, f64), String> {
    let (x, y) = raw
        .split_once(',')
        .ok_or_else(|| format!("expected X,Y, got {raw:?}"))?;
    let parse = |v: &str| {
        v.trim()
            .parse::<f64>()
            .ok()
            .filter(|n| n.is_finite())
            .ok_or_else(|| format!("invalid coordinate {v:?}"))
    };
    Ok((parse(x)?, parse(y)?))
}

fn parse_size(raw: &str) -> std::result::Result<(u32, u32), String> {
    let parsed = raw
        .split_once(['x', 'X'])
        .and_then(|(w, h)| Some((w.trim().parse().ok()?, h.trim().parse().ok()?)))
        .filter(|&(w, h): &(u32, u32)| w > 0 && h > 0);
    parsed.ok_or_else(|| format!("expected WIDTHxHEIGHT, got {raw:?}"))
}
