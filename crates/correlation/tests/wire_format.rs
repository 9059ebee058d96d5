//! The newline-delimited JSON stream consumed by collectors and log indexers.

use std::sync::Arc;

use correlation::{
    record::timestamp, Emitter, IdGenerator, LogRecord, NdjsonSink, Router, Sink, SpanRecord,
};
use tokio::io::AsyncReadExt;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writers_produce_whole_parseable_lines() {
    let (client, mut server) = tokio::io::duplex(1 << 20);
    let ndjson = Arc::new(NdjsonSink::buffered(client, 10_000));
    let router = Router::new().logs(ndjson.clone());
    let emitter = Emitter::new("wire-test", IdGenerator::from_os_rng().unwrap(), Arc::new(router));

    let reader = tokio::spawn(async move {
        let mut out = String::new();
        server.read_to_string(&mut out).await.unwrap();
        out
    });

    let handles: Vec<_> = (0..50)
        .map(|n| {
            let emitter = emitter.clone();
            tokio::spawn(async move {
                let root = emitter.start_unit("unit", None);
                for i in 0..10 {
                    root.info(format!("unit {n} step {i}"));
                    tokio::task::yield_now().await;
                }
                root.end_ok();
            })
        })
        .collect();
    for h in handles {
        h.await.unwrap();
    }

    ndjson.flush().await;
    assert_eq!(ndjson.dropped(), 0);
    drop(emitter);
    drop(ndjson);

    let out = reader.await.unwrap();
    let records: Vec<LogRecord> = out
        .lines()
        .map(|line| serde_json::from_str(line).expect("interleaved or truncated line"))
        .collect();
    assert_eq!(records.len(), 50 * 11);
    assert!(records.iter().all(|r| r.trace_id.is_some() && r.span_id.is_some()));
}

#[test]
fn log_record_round_trip_is_lossless() {
    let ids = IdGenerator::from_os_rng().unwrap();
    let mut rec = LogRecord::new(chrono::Utc::now(), correlation::Level::Warn, "sample-app", "slow");
    rec.trace_id = Some(ids.trace_id());
    rec.span_id = Some(ids.span_id());

    let line = rec.to_ndjson().unwrap();
    let text = std::str::from_utf8(&line).unwrap();
    let value: serde_json::Value = serde_json::from_str(text).unwrap();
    let ts = value["timestamp"].as_str().unwrap();
    assert!(ts.ends_with('Z'));
    assert_eq!(timestamp::parse(ts).unwrap(), rec.timestamp);

    let back: LogRecord = serde_json::from_str(text).unwrap();
    assert_eq!(back.trace_id, rec.trace_id);
    assert_eq!(back.span_id, rec.span_id);
    assert_eq!(back.timestamp, rec.timestamp);
}

#[test]
fn span_record_round_trip_is_lossless() {
    let sink = correlation::MemorySink::new();
    let emitter = Emitter::new("wire-test", IdGenerator::from_os_rng().unwrap(), Arc::new(sink.clone()));
    let root = emitter.start_unit("root", None);
    let mut child = root.child("child");
    child.set_attribute("db.execution_time_ms", 12.34);
    child.end_error("boom");
    root.end_ok();

    for span in sink.spans() {
        let json = serde_json::to_string(&span).unwrap();
        let back: SpanRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, span);
    }
}
