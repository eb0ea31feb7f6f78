mod common;

use std::{
    io::{BufRead, BufReader, Write},
    net::{Shutdown, TcpListener, TcpStream},
    sync::Arc,
    thread,
    time::Duration,
};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use common::*;
use image::RgbImage;
use serde_json::{Value, json};
use vision::{
    LiveSession, Outbound, StreamAlertLog, encoding::encode_jpeg, live::serve_connection,
};

fn frame_message(width: u32, height: u32, ts: i64) -> String {
    let jpeg = encode_jpeg(&RgbImage::new(width, height), 80).unwrap();
    json!({
        "type": "frame",
        "data": format!("data:image/jpeg;base64,{}", STANDARD.encode(jpeg)),
        "ts": ts,
    })
    .to_string()
}

fn scripted() -> Arc<ScriptedModel> {
    let model = ScriptedModel::new();
    model.set(vec![
        raw(CHILD, [10.0, 10.0, 60.0, 120.0], 0.9),
        // Below the 0.35 threshold for "cuchillo".
        raw(KNIFE, [70.0, 20.0, 90.0, 40.0], 0.30),
    ]);
    model
}

#[test]
fn frames_produce_items_and_over_threshold_subset() {
    let alerts = Arc::new(StreamAlertLog::new());
    let session = LiveSession::new(engine(scripted()), alerts.clone());

    let reply = session.handle_message(&frame_message(800, 600, 42)).unwrap();
    let Outbound::Detections { items, over, ts } = reply else {
        panic!("expected detections, got {reply:?}");
    };
    assert_eq!(items.len(), 2);
    assert_eq!(over.len(), 1);
    assert_eq!(over[0].label, "nino");
    assert_eq!(ts, json!(42));

    let records = alerts.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].alert, "[primary] nino 0.90");

    // Within the 2 s window nothing new is persisted.
    session.handle_message(&frame_message(320, 240, 43)).unwrap();
    assert_eq!(alerts.records().len(), 1);
}

#[test]
fn alert_interval_is_configurable() {
    let alerts = Arc::new(StreamAlertLog::new());
    let session =
        LiveSession::new(engine(scripted()), alerts.clone()).with_alert_interval(Duration::ZERO);
    session.handle_message(&frame_message(320, 240, 1));
    session.handle_message(&frame_message(320, 240, 2));
    assert_eq!(alerts.records().len(), 2);
}

#[test]
fn frames_are_dropped_while_one_is_in_flight() {
    let session = LiveSession::new(engine(scripted()), Arc::new(StreamAlertLog::new()));
    let guard = session.try_acquire().unwrap();
    assert!(session.handle_message(&frame_message(320, 240, 1)).is_none());
    drop(guard);
    assert!(session.handle_message(&frame_message(320, 240, 2)).is_some());
}

#[test]
fn malformed_input_is_reported_or_ignored() {
    let session = LiveSession::new(engine(scripted()), Arc::new(StreamAlertLog::new()));
    assert!(matches!(
        session.handle_message("{not json"),
        Some(Outbound::Error { .. })
    ));
    assert!(session.handle_message(r#"{"type":"ping"}"#).is_none());
    assert!(session.handle_message(r#"{"type":"frame","data":""}"#).is_none());
    assert!(matches!(
        session.handle_message(r#"{"type":"frame","data":"@@@@"}"#),
        Some(Outbound::Error { .. })
    ));
}

#[test]
fn tcp_client_gets_ready_then_detections() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let engine = engine(scripted());
    let server = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        serve_connection(stream, engine, Arc::new(StreamAlertLog::new())).unwrap();
    });

    let mut client = TcpStream::connect(addr).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut reader = BufReader::new(client.try_clone().unwrap());

    let mut line = String::new();
    reader.read_line(&mut line).unwrap();
    let ready: Value = serde_json::from_str(&line).unwrap();
    assert_eq!(ready["type"], "ready");

    writeln!(client, "{}", frame_message(320, 240, 7)).unwrap();
    line.clear();
    reader.read_line(&mut line).unwrap();
    let detections: Value = serde_json::from_str(&line).unwrap();
    assert_eq!(detections["type"], "detections");
    assert_eq!(detections["ts"], 7);
    assert_eq!(detections["items"].as_array().unwrap().len(), 2);
    assert_eq!(detections["over"][0]["src"], "primary");
    assert_eq!(detections["over"][0]["box"], json!([10, 10, 60, 120]));

    client.shutdown(Shutdown::Write).unwrap();
    server.join().unwrap();
}
