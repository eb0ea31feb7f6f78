//! Frames pushed by a remote client over a socket.
//!
//! The client sends newline-delimited JSON `{"type":"frame","data":<base64
//! JPEG>,"ts":...}` and receives `ready`, `detections` and `error` messages
//! back. Each connection processes one frame at a time; frames arriving while
//! the previous one is still in flight are dropped.

use std::{
    io::{self, BufRead, BufReader, BufWriter, Write},
    net::{TcpListener, TcpStream},
    path::Path,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::Local;
use ml_core::Detection;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use video_ingest::Frame;

use crate::{encoding::fit_width, error::VisionError, export, risk::RiskEngine, telemetry};

/// Width frames are shrunk to before detection.
pub const LIVE_FRAME_WIDTH: u32 = 416;
/// Minimum spacing between two persisted stream alerts.
pub const LIVE_ALERT_INTERVAL: Duration = Duration::from_secs(2);

/// Messages sent to the client.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Outbound {
    Ready {
        message: String,
    },
    Detections {
        items: Vec<Detection>,
        over: Vec<Detection>,
        ts: Value,
    },
    Error {
        message: String,
    },
}

impl Outbound {
    pub fn ready() -> Self {
        Outbound::Ready {
            message: "stream accepted".into(),
        }
    }

    pub fn to_line(&self) -> String {
        // Serializing these variants cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{\"type\":\"error\"}"))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StreamAlert {
    pub timestamp: String,
    pub alert: String,
}

/// Lightweight alert history shared by all live connections.
#[derive(Debug, Default)]
pub struct StreamAlertLog {
    records: Mutex<Vec<StreamAlert>>,
}

impl StreamAlertLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, alert: String) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(StreamAlert {
                timestamp: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
                alert,
            });
    }

    pub fn records(&self) -> Vec<StreamAlert> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn rows(&self) -> Vec<Vec<String>> {
        self.records()
            .into_iter()
            .map(|r| vec![r.timestamp, r.alert])
            .collect()
    }

    pub fn to_csv(&self) -> String {
        export::to_csv(&["timestamp", "alert"], self.rows())
    }

    pub fn export_csv(&self, path: &Path) -> Result<(), VisionError> {
        export::write_csv(path, &["timestamp", "alert"], self.rows())
    }
}

/// Marks a connection busy until dropped.
pub struct InFlight {
    busy: Arc<AtomicBool>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

/// Per-connection state.
pub struct LiveSession {
    engine: Arc<RiskEngine>,
    alerts: Arc<StreamAlertLog>,
    busy: Arc<AtomicBool>,
    last_alert: Mutex<Option<Instant>>,
    sequence: AtomicU64,
    target_width: u32,
    alert_interval: Duration,
}

impl LiveSession {
    pub fn new(engine: Arc<RiskEngine>, alerts: Arc<StreamAlertLog>) -> Self {
        Self {
            engine,
            alerts,
            busy: Arc::new(AtomicBool::new(false)),
            last_alert: Mutex::new(None),
            sequence: AtomicU64::new(0),
            target_width: LIVE_FRAME_WIDTH,
            alert_interval: LIVE_ALERT_INTERVAL,
        }
    }

    pub fn with_alert_interval(mut self, interval: Duration) -> Self {
        self.alert_interval = interval;
        self
    }

    /// Claim the connection for one frame, or `None` if one is in flight.
    pub fn try_acquire(&self) -> Option<InFlight> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlight {
                busy: self.busy.clone(),
            })
    }

    /// Acquire, process and release in one step. `None` means the message
    /// was dropped or needs no reply.
    pub fn handle_message(&self, text: &str) -> Option<Outbound> {
        let _in_flight = self.try_acquire()?;
        self.process(text)
    }

    /// Handle one inbound message. Callers must hold an [`InFlight`].
    pub fn process(&self, text: &str) -> Option<Outbound> {
        let message: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(err) => {
                return Some(Outbound::Error {
                    message: format!("invalid message: {err}"),
                });
            }
        };
        if message.get("type").and_then(Value::as_str) != Some("frame") {
            return None;
        }
        let data = message.get("data").and_then(Value::as_str).unwrap_or_default();
        if data.is_empty() {
            return None;
        }
        let ts = message.get("ts").cloned().unwrap_or(Value::Null);

        let seq = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let frame = match decode_frame(data, seq).map(|f| self.resize(f)) {
            Ok(frame) => frame,
            Err(err) => {
                metrics::counter!("live_frames_rejected_total").increment(1);
                return Some(Outbound::Error {
                    message: err.to_string(),
                });
            }
        };

        let items = self.engine.fusion().detect(&frame);
        let config = self.engine.config();
        let over: Vec<Detection> = items
            .iter()
            .filter(|d| d.confidence >= config.threshold(&d.label))
            .cloned()
            .collect();
        if !over.is_empty() {
            self.maybe_record_alert(&over);
        }
        metrics::counter!("live_frames_total").increment(1);
        Some(Outbound::Detections { items, over, ts })
    }

    fn resize(&self, frame: Frame) -> Frame {
        match fit_width(&frame.image, self.target_width) {
            Some(image) => Frame { image, ..frame },
            None => frame,
        }
    }

    fn maybe_record_alert(&self, over: &[Detection]) {
        let now = Instant::now();
        let mut last = self.last_alert.lock().unwrap_or_else(PoisonError::into_inner);
        if last.is_some_and(|at| now.duration_since(at) < self.alert_interval) {
            return;
        }
        let text = over
            .iter()
            .map(|d| format!("[{}] {} {:.2}", d.source.label(), d.label, d.confidence))
            .collect::<Vec<_>>()
            .join(" · ");
        debug!(alert = %text, "stream alert");
        self.alerts.push(text);
        *last = Some(now);
    }
}

/// Decode a base64 JPEG, with or without a `data:...;base64,` prefix.
pub fn decode_frame(data: &str, sequence: u64) -> Result<Frame, VisionError> {
    let payload = match data.strip_prefix("data:") {
        Some(rest) => rest
            .split_once(',')
            .map(|(_, b64)| b64)
            .ok_or_else(|| VisionError::Payload("data URI without a comma".into()))?,
        None => data,
    };
    let bytes = STANDARD
        .decode(payload.trim())
        .map_err(|err| VisionError::Payload(format!("bad base64: {err}")))?;
    let image = image::load_from_memory(&bytes)
        .map_err(|err| VisionError::Payload(format!("undecodable image: {err}")))?;
    Ok(Frame::new(image.to_rgb8(), sequence))
}

/// Serve one client: a reader thread feeds frames to this thread, which
/// processes them and writes the replies.
pub fn serve_connection(
    stream: TcpStream,
    engine: Arc<RiskEngine>,
    alerts: Arc<StreamAlertLog>,
) -> io::Result<()> {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".into());
    let session = Arc::new(LiveSession::new(engine, alerts));
    let mut writer = BufWriter::new(stream.try_clone()?);
    writeln!(writer, "{}", Outbound::ready().to_line())?;
    writer.flush()?;

    let (tx, rx) = crossbeam_channel::unbounded::<(String, InFlight)>();
    let reader_session = session.clone();
    let reader = telemetry::spawn_thread(format!("live-reader-{peer}"), move || {
        for line in BufReader::new(stream).lines() {
            let Ok(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }
            match reader_session.try_acquire() {
                Some(guard) => {
                    if tx.send((line, guard)).is_err() {
                        break;
                    }
                }
                None => metrics::counter!("live_frames_dropped_total").increment(1),
            }
        }
    })?;

    for (line, guard) in rx {
        let reply = session.process(&line);
        drop(guard);
        if let Some(reply) = reply {
            writeln!(writer, "{}", reply.to_line())?;
            writer.flush()?;
        }
    }
    let _ = reader.join();
    info!(%peer, "live client disconnected");
    Ok(())
}

/// Accept clients until `stop` is set, one thread pair per connection.
pub fn run_listener(
    listener: TcpListener,
    engine: Arc<RiskEngine>,
    alerts: Arc<StreamAlertLog>,
    stop: Arc<AtomicBool>,
) -> io::Result<()> {
    listener.set_nonblocking(true)?;
    info!(addr = %listener.local_addr()?, "live ingestion listening");
    while !stop.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, addr)) => {
                stream.set_nonblocking(false)?;
                info!(%addr, "live client connected");
                let (engine, alerts) = (engine.clone(), alerts.clone());
                telemetry::spawn_thread(format!("live-{addr}"), move || {
                    if let Err(err) = serve_connection(stream, engine, alerts) {
                        warn!(%addr, "live connection failed: {err}");
                    }
                })?;
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(err) => warn!("accept failed: {err}"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use image::RgbImage;

    use super::*;
    use crate::encoding::encode_jpeg;

    #[test]
    fn data_uri_prefix_is_stripped() {
        let jpeg = encode_jpeg(&RgbImage::new(8, 6), 80).unwrap();
        let b64 = STANDARD.encode(&jpeg);
        let plain = decode_frame(&b64, 1).unwrap();
        let prefixed = decode_frame(&format!("data:image/jpeg;base64,{b64}"), 2).unwrap();
        assert_eq!(plain.image.dimensions(), (8, 6));
        assert_eq!(prefixed.image.dimensions(), (8, 6));
    }

    #[test]
    fn garbage_payload_is_rejected() {
        assert!(matches!(
            decode_frame("not base64!!", 1),
            Err(VisionError::Payload(_))
        ));
        assert!(matches!(
            decode_frame(&STANDARD.encode(b"plain text"), 1),
            Err(VisionError::Payload(_))
        ));
    }

    #[test]
    fn outbound_messages_are_tagged() {
        assert_eq!(
            Outbound::ready().to_line(),
            r#"{"type":"ready","message":"stream accepted"}"#
        );
        let err = Outbound::Error {
            message: "boom".into(),
        };
        assert_eq!(err.to_line(), r#"{"type":"error","message":"boom"}"#);
    }

    #[test]
    fn stream_alert_csv_has_two_columns() {
        let log = StreamAlertLog::new();
        log.push("[primary] cuchillo 0.91".into());
        let csv = log.to_csv();
        let mut lines = csv.lines();
        assert_eq!(lines.next(), Some("timestamp,alert"));
        assert!(lines.next().unwrap().ends_with(",[primary] cuchillo 0.91"));
    }
}
