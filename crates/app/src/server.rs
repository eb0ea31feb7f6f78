//! Actix Web preview server: per-source JPEG snapshots and MJPEG streams,
//! the alert history and the Prometheus scrape endpoint.
//!
//! The server runs on its own thread with a dedicated actix system so the
//! capture and inference threads never touch the async runtime.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use actix_web::{
    App, HttpResponse, HttpServer,
    http::header,
    web::{self, Bytes},
};
use anyhow::{Context, Result};
use async_stream::stream;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{error, info};
use vision::{AlertFeed, AlertRecord, FrameStore, SourceInfo, SourceManager, encoding, telemetry};

const PREVIEW_JPEG_QUALITY: u8 = 80;

/// Shared state backing HTTP handlers.
pub(crate) struct ServerState {
    pub(crate) manager: Arc<SourceManager>,
    pub(crate) store: Arc<FrameStore>,
    pub(crate) feed: Arc<AlertFeed>,
}

/// Handle for the preview server thread.
#[derive(Default)]
pub(crate) struct PreviewServer {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl PreviewServer {
    /// Signal the server to stop and block until the thread exits.
    pub(crate) fn stop(self) {
        if let Some(tx) = self.shutdown {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle {
            let _ = handle.join();
        }
    }
}

#[derive(Deserialize)]
struct SourceQuery {
    source: Option<String>,
}

#[derive(Serialize)]
struct AlertsResponse {
    banner: Option<String>,
    records: Vec<AlertRecord>,
}

pub(crate) fn spawn_preview_server(
    addr: SocketAddr,
    manager: Arc<SourceManager>,
    store: Arc<FrameStore>,
    feed: Arc<AlertFeed>,
) -> Result<PreviewServer> {
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let handle = telemetry::spawn_thread("preview-server", move || {
        if let Err(err) = actix_web::rt::System::new().block_on(async move {
            let state = web::Data::new(ServerState {
                manager,
                store,
                feed,
            });
            let server = HttpServer::new(move || App::new().configure(routes(state.clone())))
                .workers(2)
                .bind(addr)?
                .run();
            info!(%addr, "preview server listening");

            let srv_handle = server.handle();
            actix_web::rt::spawn(async move {
                let _ = shutdown_rx.await;
                srv_handle.stop(true).await;
            });

            server.await
        }) {
            error!("HTTP server error: {err}");
        }
    })
    .context("failed to spawn preview server thread")?;
    Ok(PreviewServer {
        shutdown: Some(shutdown_tx),
        handle: Some(handle),
    })
}

pub(crate) fn routes(
    state: web::Data<ServerState>,
) -> impl FnOnce(&mut web::ServiceConfig) + Clone {
    move |cfg| {
        cfg.app_data(state)
            .route("/sources", web::get().to(sources_handler))
            .route("/frame.jpg", web::get().to(frame_handler))
            .route("/stream.mjpg", web::get().to(stream_handler))
            .route("/alerts", web::get().to(alerts_handler))
            .route("/alerts.csv", web::get().to(alerts_csv_handler))
            .route("/metrics", web::get().to(metrics_handler));
    }
}

/// The requested source, or the first one with a frame.
fn resolve_source(state: &ServerState, requested: Option<&str>) -> Option<String> {
    match requested {
        Some(id) => Some(id.to_string()),
        None => state.store.sources().into_iter().next(),
    }
}

fn latest_jpeg(state: &ServerState, source: &str) -> Option<(u64, Vec<u8>)> {
    let frame = state.store.latest(source)?;
    match encoding::encode_jpeg(&frame.image, PREVIEW_JPEG_QUALITY) {
        Ok(jpeg) => Some((frame.sequence, jpeg)),
        Err(err) => {
            error!(%source, "preview encode failed: {err}");
            None
        }
    }
}

async fn sources_handler(state: web::Data<ServerState>) -> HttpResponse {
    let sources: Vec<SourceInfo> = state.manager.list();
    HttpResponse::Ok().json(sources)
}

/// Return the latest displayable frame of a source as JPEG.
async fn frame_handler(
    query: web::Query<SourceQuery>,
    state: web::Data<ServerState>,
) -> HttpResponse {
    let Some(source) = resolve_source(&state, query.source.as_deref()) else {
        return HttpResponse::NoContent().finish();
    };
    if state.manager.info(&source).is_none() {
        return HttpResponse::NotFound().body(format!("unknown source {source}"));
    }
    match latest_jpeg(&state, &source) {
        Some((sequence, jpeg)) => HttpResponse::Ok()
            .insert_header(("X-Sequence", sequence.to_string()))
            .content_type("image/jpeg")
            .body(jpeg),
        None => HttpResponse::NoContent().finish(),
    }
}

/// Stream a source as multipart MJPEG. Frames are only sent when the
/// sequence number changes.
async fn stream_handler(
    query: web::Query<SourceQuery>,
    state: web::Data<ServerState>,
) -> HttpResponse {
    let Some(source) = resolve_source(&state, query.source.as_deref()) else {
        return HttpResponse::NoContent().finish();
    };
    if state.manager.info(&source).is_none() {
        return HttpResponse::NotFound().body(format!("unknown source {source}"));
    }
    let state = state.clone();
    let stream = stream! {
        let mut interval = actix_web::rt::time::interval(Duration::from_millis(33));
        let mut last_sequence = None;
        loop {
            interval.tick().await;
            if state.manager.info(&source).is_none() {
                break;
            }
            let Some(frame) = state.store.latest(&source) else {
                continue;
            };
            if last_sequence == Some(frame.sequence) {
                continue;
            }
            last_sequence = Some(frame.sequence);
            let Ok(jpeg) = encoding::encode_jpeg(&frame.image, PREVIEW_JPEG_QUALITY) else {
                continue;
            };
            let mut payload = Vec::with_capacity(jpeg.len() + 64);
            payload.extend_from_slice(b"--frame\r\n");
            payload.extend_from_slice(format!("X-Sequence: {}\r\n", frame.sequence).as_bytes());
            payload.extend_from_slice(b"Content-Type: image/jpeg\r\n\r\n");
            payload.extend_from_slice(&jpeg);
            payload.extend_from_slice(b"\r\n");
            yield Ok::<Bytes, actix_web::Error>(Bytes::from(payload));
        }
    };

    HttpResponse::Ok()
        .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .insert_header((header::ACCESS_CONTROL_ALLOW_METHODS, "GET"))
        .append_header(("Cache-Control", "no-cache"))
        .append_header(("Content-Type", "multipart/x-mixed-replace; boundary=frame"))
        .streaming(stream)
}

async fn alerts_handler(state: web::Data<ServerState>) -> HttpResponse {
    HttpResponse::Ok().json(AlertsResponse {
        banner: state.feed.banner(),
        records: state.feed.records(),
    })
}

async fn alerts_csv_handler(state: web::Data<ServerState>) -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/csv; charset=utf-8")
        .insert_header((
            header::CONTENT_DISPOSITION,
            "attachment; filename=\"alertas.csv\"",
        ))
        .body(state.feed.to_csv())
}

async fn metrics_handler() -> HttpResponse {
    match telemetry::prometheus_handle() {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::ServiceUnavailable().body("metrics recorder not installed"),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use actix_web::{http::StatusCode, test};
    use ml_core::{
        DetectError, DetectionStrategy, DetectorModel, FusionStrategy, PredictOptions, RawBox,
    };
    use video_ingest::Frame;
    use vision::{PipelineConfig, RiskConfig, RiskEngine, RiskObserver};

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

    fn state() -> web::Data<ServerState> {
        let fusion = FusionStrategy::new(
            DetectionStrategy::primary(Arc::new(Silent(HashMap::new()))),
            None,
        );
        let engine = Arc::new(RiskEngine::new(fusion, RiskConfig::default()));
        web::Data::new(ServerState {
            manager: Arc::new(SourceManager::new(engine, PipelineConfig::default())),
            store: Arc::new(FrameStore::new()),
            feed: Arc::new(AlertFeed::new()),
        })
    }

    #[actix_web::test]
    async fn empty_pipeline_has_no_frame() {
        let app = test::init_service(App::new().configure(routes(state()))).await;

        let resp = test::call_service(&app, test::TestRequest::get().uri("/frame.jpg").to_request()).await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let resp = test::call_service(
            &app,
            test::TestRequest::get().uri("/frame.jpg?source=nope").to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let body = test::call_and_read_body(&app, test::TestRequest::get().uri("/sources").to_request()).await;
        assert_eq!(body.as_ref(), b"[]");
    }

    #[actix_web::test]
    async fn alert_history_is_exposed() {
        let state = state();
        let event = vision::RiskEvent {
            source_id: "cam".into(),
            source_name: "Cocina".into(),
            messages: ["¡ALERTA! NIÑO CERCA DE CUCHILLO!".to_string()].into_iter().collect(),
            rules: ["CHILD_NEAR_KNIFE".to_string()].into_iter().collect(),
            frame: Arc::new(Frame::new(image::RgbImage::new(4, 4), 1)),
            timestamp: chrono::Local::now(),
        };
        state.feed.on_alert(&event).unwrap();
        let app = test::init_service(App::new().configure(routes(state))).await;

        let body = test::call_and_read_body(&app, test::TestRequest::get().uri("/alerts.csv").to_request()).await;
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.starts_with("timestamp,alert,source\n"));
        assert!(text.contains("NIÑO CERCA DE CUCHILLO"));
        assert!(text.trim_end().ends_with(",Cocina"));

        let json: serde_json::Value =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/alerts").to_request()).await;
        assert_eq!(json["records"].as_array().map(Vec::len), Some(1));
        assert!(json["banner"].as_str().is_some());
    }
}
