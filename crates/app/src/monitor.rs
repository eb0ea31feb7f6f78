//! `monitor` subcommand: run the per-source pipelines until interrupted.

use std::{
    fs,
    net::TcpListener,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, SystemTime},
};

use anyhow::{Context, Result, bail};
use tracing::{error, info, info_span, warn};
use vision::{
    AlertFeed, AlertMetrics, Bell, FrameStore, ImageArchive, LogNotifier, NotificationDispatcher,
    NotifyObserver, RenderTicker, RiskEngine, SourceManager, StreamAlertLog, ZoneBook,
    live::run_listener, telemetry,
};

use crate::{
    cli::{MonitorConfig, SourceRequest},
    detectors, server, shutdown_flag,
};

const ALERT_HISTORY: usize = 10_000;
const IDLE_POLL: Duration = Duration::from_millis(200);

pub fn run(config: MonitorConfig) -> Result<()> {
    let _span = info_span!("monitor").entered();
    if let Err(err) = telemetry::init_metrics_recorder() {
        warn!("metrics disabled: {err:#}");
    }

    let engine = Arc::new(detectors::build_engine(&config.detector)?);
    let feed = Arc::new(AlertFeed::with_capacity(ALERT_HISTORY));
    subscribe_observers(&engine, &feed, &config)?;

    let mut watcher = config.zones.clone().map(ZoneWatcher::new);
    let zones = match &config.zones {
        Some(path) if path.exists() => ZoneBook::load(path)
            .with_context(|| format!("loading zones from {}", path.display()))?,
        Some(path) => {
            warn!(path = %path.display(), "zone file not found; starting without zones");
            ZoneBook::new()
        }
        None => ZoneBook::new(),
    };

    let manager = Arc::new(SourceManager::new(engine.clone(), config.pipeline.clone()));
    manager.start_watchdog()?;

    let opened = open_sources(&manager, &config.sources, &zones);
    if opened == 0 {
        manager.shutdown();
        bail!("none of the {} source(s) could be opened", config.sources.len());
    }

    let store = Arc::new(FrameStore::new());
    let ticker = RenderTicker::spawn(manager.clone(), store.clone(), config.pipeline.render_tick)
        .context("failed to start render ticker")?;

    let preview = match config.bind {
        Some(addr) => Some(server::spawn_preview_server(
            addr,
            manager.clone(),
            store.clone(),
            feed.clone(),
        )?),
        None => None,
    };

    let stop = shutdown_flag()?;
    let live_stop = Arc::new(AtomicBool::new(false));
    let live = match config.live_bind {
        Some(addr) => {
            let listener =
                TcpListener::bind(addr).with_context(|| format!("failed to bind {addr}"))?;
            let (engine, flag) = (engine.clone(), live_stop.clone());
            let alerts = Arc::new(StreamAlertLog::new());
            Some(telemetry::spawn_thread("live-listener", move || {
                if let Err(err) = run_listener(listener, engine, alerts, flag) {
                    error!("live listener failed: {err}");
                }
            })?)
        }
        None => None,
    };

    info!(sources = opened, "monitoring; press Ctrl+C to stop");
    wait_until_idle(&manager, &stop, watcher.as_mut());

    live_stop.store(true, Ordering::Relaxed);
    if let Some(handle) = live {
        let _ = handle.join();
    }
    if let Some(preview) = preview {
        preview.stop();
    }
    ticker.stop();
    manager.shutdown();

    let alerts = feed.records().len();
    if let Some(path) = &config.export_csv {
        feed.export_csv(path)?;
        info!(path = %path.display(), alerts, "alert history exported");
    }
    info!(alerts, "monitor stopped");
    Ok(())
}

/// Register the built-in observers in the order they should see alerts. The
/// notification workers stop when the engine is dropped.
fn subscribe_observers(
    engine: &RiskEngine,
    feed: &Arc<AlertFeed>,
    config: &MonitorConfig,
) -> Result<()> {
    engine.subscribe(feed.clone());
    engine.subscribe(Arc::new(AlertMetrics::new()));
    if let Some(dir) = &config.archive_dir {
        engine.subscribe(Arc::new(ImageArchive::new(dir.clone())));
    }
    engine.subscribe(Arc::new(Bell::new(config.notify.sound)));
    if config.notify.enabled {
        let dispatcher = NotificationDispatcher::start(Arc::new(LogNotifier), &config.notify)?;
        engine.subscribe(Arc::new(NotifyObserver::new(Arc::new(dispatcher))));
    }
    Ok(())
}

/// Open every requested source. Failures are logged and skipped; returns how
/// many sources are running.
fn open_sources(manager: &SourceManager, requests: &[SourceRequest], zones: &ZoneBook) -> usize {
    let mut opened = 0;
    for request in requests {
        let result = match &request.id {
            Some(id) => manager.add_named_source(id, request.spec.clone()),
            None => manager.add_source(request.spec.clone()),
        };
        match result {
            Ok(info) => {
                if let Some(map) = zones.zones(&info.id) {
                    manager.engine().set_zones(&info.id, map.clone());
                    info!(source = %info.id, zones = map.len(), "zones loaded");
                }
                opened += 1;
            }
            Err(err) => error!(uri = %request.spec.uri(), "failed to open source: {err}"),
        }
    }
    opened
}

/// Block until Ctrl+C, or until every source has stopped on its own. Zone
/// file edits are applied to the running sources along the way.
fn wait_until_idle(
    manager: &SourceManager,
    stop: &AtomicBool,
    mut zones: Option<&mut ZoneWatcher>,
) {
    while !stop.load(Ordering::Relaxed) {
        thread::sleep(IDLE_POLL);
        let sources = manager.list();
        if let Some(book) = zones.as_mut().and_then(|watcher| watcher.poll()) {
            let ids: Vec<String> = sources.iter().map(|s| s.id.clone()).collect();
            apply_zones(manager.engine(), &ids, &book);
        }
        if !sources.is_empty() && sources.iter().all(|s| !s.active) {
            info!("every source has ended");
            return;
        }
    }
    info!("interrupt received; shutting down");
}

/// Reloads the zone file when its modification time changes.
struct ZoneWatcher {
    path: PathBuf,
    modified: Option<SystemTime>,
}

impl ZoneWatcher {
    fn new(path: PathBuf) -> Self {
        let modified = modified_at(&path);
        Self { path, modified }
    }

    /// The new zone book if the file changed since the last call. A file that
    /// vanished or fails to parse yields nothing.
    fn poll(&mut self) -> Option<ZoneBook> {
        let modified = modified_at(&self.path);
        if modified == self.modified {
            return None;
        }
        self.modified = modified;
        if modified.is_none() {
            return None;
        }
        match ZoneBook::load(&self.path) {
            Ok(book) => Some(book),
            Err(err) => {
                warn!(path = %self.path.display(), "zone file not reloaded: {err}");
                None
            }
        }
    }
}

fn modified_at(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|meta| meta.modified()).ok()
}

/// Replace the zones of every listed source. Sources missing from `book` lose
/// their zones.
fn apply_zones(engine: &RiskEngine, sources: &[String], book: &ZoneBook) {
    for id in sources {
        let map = book.zones(id).cloned().unwrap_or_default();
        info!(source = %id, zones = map.len(), "zones reloaded");
        engine.set_zones(id, map);
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, fs::File};

    use ml_core::{
        DetectError, DetectionStrategy, DetectorModel, FusionStrategy, PredictOptions, RawBox,
    };
    use video_ingest::Frame;
    use vision::RiskConfig;

    use super::*;

    struct Silent(HashMap<i64, String>);

    impl DetectorModel for Silent {
        fn predict(&self, _: &Frame, _: &PredictOptions) -> Result<Vec<RawBox>, DetectError> {
            Ok(Vec::new())
        }

        fn names(&self) -> &HashMap<i64, String> {
            &self.0
        }
    }

    fn engine() -> RiskEngine {
        let fusion = FusionStrategy::new(
            DetectionStrategy::primary(Arc::new(Silent(HashMap::new()))),
            None,
        );
        RiskEngine::new(fusion, RiskConfig::default())
    }

    fn touch(path: &Path, secs_ahead: u64) {
        let when = SystemTime::now() + Duration::from_secs(secs_ahead);
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(when)
            .unwrap();
    }

    fn book(zone: &str) -> ZoneBook {
        let mut book = ZoneBook::new();
        book.add_polygon("sala", zone, vec![[0, 0], [10, 0], [10, 10]])
            .unwrap();
        book
    }

    #[test]
    fn watcher_reloads_only_after_a_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zones.json");
        book("cocina").save(&path).unwrap();

        let mut watcher = ZoneWatcher::new(path.clone());
        assert!(watcher.poll().is_none());

        book("escalera").save(&path).unwrap();
        touch(&path, 5);
        let reloaded = watcher.poll().unwrap();
        assert!(reloaded.zones("sala").unwrap().contains_key("escalera"));
        assert!(watcher.poll().is_none());

        fs::write(&path, "{not json").unwrap();
        touch(&path, 10);
        assert!(watcher.poll().is_none());
    }

    #[test]
    fn watcher_picks_up_a_file_created_later() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zones.json");
        let mut watcher = ZoneWatcher::new(path.clone());
        assert!(watcher.poll().is_none());

        book("cocina").save(&path).unwrap();
        assert!(watcher.poll().is_some());
    }

    #[test]
    fn applying_a_book_replaces_every_listed_source() {
        let engine = engine();
        engine.set_zones("patio", book("piscina").zones("sala").unwrap().clone());

        let ids = ["sala".to_string(), "patio".to_string()];
        apply_zones(&engine, &ids, &book("cocina"));
        assert_eq!(engine.zones("sala").keys().collect::<Vec<_>>(), ["cocina"]);
        assert!(engine.zones("patio").is_empty());
    }
}
