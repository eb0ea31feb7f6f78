//! Built-in [`RiskObserver`]s: alert feed, image archive, metrics,
//! notification hand-off and the terminal bell.

use std::{
    collections::{BTreeMap, VecDeque},
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::Context;
use serde::Serialize;
use tracing::{debug, warn};

use crate::{
    config::{HIGH_SURFACE_RULE, ZONE_RULE_PREFIX},
    encoding::encode_jpeg,
    error::VisionError,
    export,
    notify::NotificationDispatcher,
    risk::{RiskEvent, RiskObserver},
    telemetry,
};

/// One row of the alert history.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AlertRecord {
    pub timestamp: String,
    pub alert: String,
    pub source: String,
}

impl AlertRecord {
    fn fields(&self) -> Vec<String> {
        vec![
            self.timestamp.clone(),
            self.alert.clone(),
            self.source.clone(),
        ]
    }
}

/// In-memory alert history plus the latest alert text for a banner.
#[derive(Debug, Default)]
pub struct AlertFeed {
    records: Mutex<VecDeque<AlertRecord>>,
    banner: Mutex<Option<String>>,
    capacity: Option<usize>,
}

impl AlertFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep only the newest `capacity` records.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity.max(1)),
            ..Self::default()
        }
    }

    pub fn records(&self) -> Vec<AlertRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn banner(&self) -> Option<String> {
        self.banner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn to_csv(&self) -> String {
        export::to_csv(
            &["timestamp", "alert", "source"],
            self.records().iter().map(AlertRecord::fields),
        )
    }

    pub fn export_csv(&self, path: &Path) -> Result<(), VisionError> {
        export::write_csv(
            path,
            &["timestamp", "alert", "source"],
            self.records().iter().map(AlertRecord::fields),
        )
    }
}

impl RiskObserver for AlertFeed {
    fn name(&self) -> &str {
        "alert-feed"
    }

    fn on_alert(&self, event: &RiskEvent) -> anyhow::Result<()> {
        let text = event.text();
        let record = AlertRecord {
            timestamp: event.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
            alert: text.clone(),
            source: event.source_name.clone(),
        };
        {
            let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
            records.push_back(record);
            if let Some(cap) = self.capacity {
                while records.len() > cap {
                    records.pop_front();
                }
            }
        }
        *self.banner.lock().unwrap_or_else(PoisonError::into_inner) = Some(text);
        Ok(())
    }
}

/// Writes the alert frame as a JPEG and keeps the directory bounded.
pub struct ImageArchive {
    dir: PathBuf,
    quality: u8,
    max_images: usize,
}

impl ImageArchive {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            quality: 80,
            max_images: 500,
        }
    }

    pub fn with_limit(mut self, max_images: usize) -> Self {
        self.max_images = max_images;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_name(event: &RiskEvent) -> String {
        let clean: String = event
            .source_name
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { '_' })
            .collect();
        format!(
            "alerta_{clean}_{}.jpg",
            event.timestamp.format("%Y%m%d_%H%M%S_%6f")
        )
    }

    /// Delete the oldest images until at most `max_images` remain.
    fn prune(&self) -> std::io::Result<usize> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_image = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| matches!(e.to_ascii_lowercase().as_str(), "jpg" | "jpeg" | "png"));
            if !is_image {
                continue;
            }
            let modified = fs::metadata(&path)?.modified()?;
            files.push((modified, path));
        }
        if files.len() <= self.max_images {
            return Ok(0);
        }
        files.sort();
        let excess = files.len() - self.max_images;
        for (_, path) in files.into_iter().take(excess) {
            fs::remove_file(path)?;
        }
        Ok(excess)
    }
}

impl RiskObserver for ImageArchive {
    fn name(&self) -> &str {
        "image-archive"
    }

    fn on_alert(&self, event: &RiskEvent) -> anyhow::Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating {}", self.dir.display()))?;
        let path = self.dir.join(Self::file_name(event));
        let jpeg = encode_jpeg(&event.frame.image, self.quality)?;
        fs::write(&path, jpeg).with_context(|| format!("writing {}", path.display()))?;
        debug!(path = %path.display(), "alert image saved");
        match self.prune() {
            Ok(0) => {}
            Ok(removed) => debug!(removed, "pruned old alert images"),
            Err(err) => warn!("failed to prune {}: {err}", self.dir.display()),
        }
        Ok(())
    }
}

/// Metric category for a rule key.
pub fn rule_category(rule: &str) -> &'static str {
    match rule {
        "CHILD_NEAR_KNIFE" => "knife",
        "CHILD_NEAR_STAIRS" => "stairs",
        "CHILD_NEAR_STOVE" => "stove",
        "CHILD_NEAR_POT" => "pot",
        "CHILD_NEAR_OVEN" => "oven",
        "CHILD_NEAR_RAILING" => "railing",
        "CHILD_NEAR_SCISSORS" => "scissors",
        HIGH_SURFACE_RULE => "high_surface",
        r if r.starts_with(ZONE_RULE_PREFIX) => "zone",
        _ => "other",
    }
}

/// Counts alerts per category and exports them as metrics.
#[derive(Debug, Default)]
pub struct AlertMetrics {
    counts: Mutex<BTreeMap<&'static str, u64>>,
}

impl AlertMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counts(&self) -> BTreeMap<&'static str, u64> {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn total(&self) -> u64 {
        self.counts().values().sum()
    }
}

impl RiskObserver for AlertMetrics {
    fn name(&self) -> &str {
        "alert-metrics"
    }

    fn on_alert(&self, event: &RiskEvent) -> anyhow::Result<()> {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        for rule in &event.rules {
            let category = rule_category(rule);
            *counts.entry(category).or_default() += 1;
            metrics::counter!("alerts_total", "category" => category).increment(1);
        }
        metrics::counter!("alert_events_total", "source" => event.source_id.clone()).increment(1);
        Ok(())
    }
}

/// Forwards alerts with their frame to the notification dispatcher.
pub struct NotifyObserver {
    dispatcher: Arc<NotificationDispatcher>,
}

impl NotifyObserver {
    pub fn new(dispatcher: Arc<NotificationDispatcher>) -> Self {
        Self { dispatcher }
    }

    pub fn caption(event: &RiskEvent) -> String {
        format!("🚨 ALERTA ({}): {}", event.source_name, event.text())
    }
}

impl RiskObserver for NotifyObserver {
    fn name(&self) -> &str {
        "notify"
    }

    fn on_alert(&self, event: &RiskEvent) -> anyhow::Result<()> {
        self.dispatcher
            .send_image(event.frame.clone(), Self::caption(event));
        Ok(())
    }
}

type BellSink = Arc<Mutex<Box<dyn Write + Send>>>;

/// Rings the terminal bell on every alert. The write happens on a detached
/// thread; alerts arriving while a ring is still pending are folded into it.
pub struct Bell {
    enabled: bool,
    sink: BellSink,
    ringing: Arc<AtomicBool>,
}

impl Bell {
    /// Bell on stderr.
    pub fn new(enabled: bool) -> Self {
        Self::with_writer(enabled, io::stderr())
    }

    pub fn with_writer(enabled: bool, sink: impl Write + Send + 'static) -> Self {
        Self {
            enabled,
            sink: Arc::new(Mutex::new(Box::new(sink))),
            ringing: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

impl RiskObserver for Bell {
    fn name(&self) -> &str {
        "bell"
    }

    fn on_alert(&self, _event: &RiskEvent) -> anyhow::Result<()> {
        if !self.enabled || self.ringing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let (sink, ringing) = (self.sink.clone(), self.ringing.clone());
        let spawned = telemetry::spawn_thread("alert-bell", move || {
            let mut out = sink.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(err) = out.write_all(b"\x07").and_then(|()| out.flush()) {
                debug!("bell write failed: {err}");
            }
            ringing.store(false, Ordering::Release);
        });
        if let Err(err) = spawned {
            self.ringing.store(false, Ordering::Release);
            return Err(err).context("spawning bell thread");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::{Local, TimeZone};
    use image::RgbImage;
    use video_ingest::Frame;

    use super::*;

    fn event(source: &str, messages: &[&str], rules: &[&str]) -> RiskEvent {
        RiskEvent {
            source_id: "live_1".into(),
            source_name: source.into(),
            messages: messages.iter().map(|m| m.to_string()).collect(),
            rules: rules.iter().map(|r| r.to_string()).collect::<BTreeSet<_>>(),
            frame: Arc::new(Frame::new(RgbImage::new(32, 24), 1)),
            timestamp: Local.with_ymd_and_hms(2025, 3, 9, 14, 5, 6).unwrap(),
        }
    }

    #[test]
    fn feed_records_sorted_messages() {
        let feed = AlertFeed::new();
        feed.on_alert(&event(
            "Cámara 0",
            &["NIÑO CERCA DE HORNO!", "NIÑO CERCA DE CUCHILLO!"],
            &[],
        ))
        .unwrap();
        let records = feed.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].timestamp, "2025-03-09 14:05:06");
        assert_eq!(records[0].alert, "NIÑO CERCA DE CUCHILLO! | NIÑO CERCA DE HORNO!");
        assert_eq!(records[0].source, "Cámara 0");
        assert_eq!(feed.banner().as_deref(), Some(records[0].alert.as_str()));
        assert_eq!(
            feed.to_csv(),
            "timestamp,alert,source\n2025-03-09 14:05:06,NIÑO CERCA DE CUCHILLO! | NIÑO CERCA DE HORNO!,Cámara 0\n"
        );
    }

    #[test]
    fn feed_capacity_keeps_newest() {
        let feed = AlertFeed::with_capacity(1);
        feed.on_alert(&event("a", &["one"], &[])).unwrap();
        feed.on_alert(&event("b", &["two"], &[])).unwrap();
        let records = feed.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].alert, "two");
    }

    #[test]
    fn archive_names_and_prunes_images() {
        let dir = tempfile::tempdir().unwrap();
        let archive = ImageArchive::new(dir.path().join("alerts")).with_limit(2);
        let ev = event("Cámara 0/x", &["m"], &[]);
        assert_eq!(
            ImageArchive::file_name(&ev),
            "alerta_Cámara_0_x_20250309_140506_000000.jpg"
        );
        archive.on_alert(&ev).unwrap();

        fs::write(archive.dir().join("alerta_old_1.jpg"), b"x").unwrap();
        fs::write(archive.dir().join("alerta_old_2.jpg"), b"x").unwrap();
        fs::write(archive.dir().join("notes.txt"), b"x").unwrap();
        assert_eq!(archive.prune().unwrap(), 1);
        let images = fs::read_dir(archive.dir())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .path()
                    .extension()
                    .is_some_and(|x| x == "jpg")
            })
            .count();
        assert_eq!(images, 2);
    }

    #[test]
    fn metrics_count_by_category() {
        let m = AlertMetrics::new();
        m.on_alert(&event(
            "a",
            &[],
            &["CHILD_NEAR_KNIFE", "CHILD_IN_ZONE_cocina", HIGH_SURFACE_RULE],
        ))
        .unwrap();
        m.on_alert(&event("a", &[], &["CHILD_NEAR_KNIFE"])).unwrap();
        let counts = m.counts();
        assert_eq!(counts["knife"], 2);
        assert_eq!(counts["zone"], 1);
        assert_eq!(counts["high_surface"], 1);
        assert_eq!(m.total(), 4);
    }

    #[test]
    fn caption_mentions_source() {
        let ev = event("Cámara 1", &["NIÑO CERCA DE TIJERAS!"], &[]);
        assert_eq!(
            NotifyObserver::caption(&ev),
            "🚨 ALERTA (Cámara 1): NIÑO CERCA DE TIJERAS!"
        );
    }

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn disabled_bell_stays_silent() {
        let buf = SharedBuf::default();
        let bell = Bell::with_writer(false, buf.clone());
        assert!(!bell.is_enabled());
        bell.on_alert(&event("a", &["m"], &[])).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(100));
        assert!(buf.0.lock().unwrap().is_empty());
    }

    #[test]
    fn enabled_bell_writes_bel() {
        let buf = SharedBuf::default();
        let bell = Bell::with_writer(true, buf.clone());
        bell.on_alert(&event("a", &["m"], &[])).unwrap();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while buf.0.lock().unwrap().is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        let written = buf.0.lock().unwrap().clone();
        assert!(!written.is_empty());
        assert!(written.iter().all(|b| *b == 0x07));
    }
}
