use std::fs;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use portmux_observe::{
    event_log_record, segment_path, Event, EventLogConfig, EventLogSink, EventSink, EventType,
    FlowContext, WireProtocol,
};

static TEMP_DIR_COUNTER: AtomicU64 = AtomicU64::new(1);

#[test]
fn record_omits_runtime_clocks() {
    let context = sample_context(11);
    let mut first = Event::new(EventType::ProtocolDetected, context.clone());
    first.sequence_id = 1;
    first.flow_sequence_id = 1;
    first.occurred_at_unix_ms = 111;
    first
        .attributes
        .insert("protocol".to_string(), "socks5".to_string());

    let mut second = first.clone();
    second.occurred_at_unix_ms = 999_999;

    assert_eq!(event_log_record(&first), event_log_record(&second));
}

#[test]
fn record_carries_flow_identity_and_labels() {
    let mut event = Event::new(EventType::TunnelEstablished, sample_context(42));
    event.sequence_id = 3;
    event.flow_sequence_id = 8;
    event
        .attributes
        .insert("upstream".to_string(), "backend.local:443".to_string());

    let record = event_log_record(&event);
    assert_eq!(record.flow_id, 42);
    assert_eq!(record.kind, "tunnel_established");
    assert_eq!(record.protocol, "socks5");
    assert_eq!(
        record.attributes.get("upstream").map(String::as_str),
        Some("backend.local:443")
    );
}

#[test]
fn sink_rotates_segments_at_byte_limit() {
    let temp_dir = unique_temp_dir("event_log_rotates");
    fs::create_dir_all(&temp_dir).expect("create temp dir");
    let log_path = temp_dir.join("events.jsonl");
    let config = EventLogConfig::new(&log_path)
        .with_flush_every(1)
        .with_rotate_bytes(Some(300));

    let sink = EventLogSink::new(config).expect("create sink");
    for sequence_id in 1..=6 {
        let mut event = Event::new(EventType::RelayBufferFlushed, sample_context(77));
        event.sequence_id = sequence_id;
        event.flow_sequence_id = sequence_id;
        event
            .attributes
            .insert("payload".to_string(), "x".repeat(64));
        sink.emit(event);
    }
    sink.flush().expect("flush sink");

    assert_eq!(sink.write_error_count(), 0);
    assert!(sink.last_error().is_none());
    let first_segment = fs::read_to_string(&log_path).expect("read first segment");
    assert!(first_segment.lines().count() >= 1);
    let rotated = segment_path(&log_path, 1);
    assert!(rotated.exists(), "second segment must exist after rotation");

    drop(sink);
    fs::remove_dir_all(&temp_dir).expect("cleanup temp dir");
}

fn sample_context(flow_id: u64) -> FlowContext {
    FlowContext {
        flow_id,
        client_addr: "127.0.0.1:12345".to_string(),
        server_host: "example.com".to_string(),
        server_port: 443,
        protocol: WireProtocol::Socks5,
    }
}

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before unix epoch")
        .as_millis();
    let counter = TEMP_DIR_COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!(
        "portmux_{prefix}_{}_{}_{}",
        process::id(),
        now_ms,
        counter
    ))
}
