use super::{MuxEngine, PortmuxConfig};
use portmux_observe::{Event, EventType, FlowContext, VecEventSink, WireProtocol};

fn sample_context(flow_id: u64) -> FlowContext {
    FlowContext {
        flow_id,
        client_addr: "127.0.0.1:10000".to_string(),
        server_host: "example.com".to_string(),
        server_port: 443,
        protocol: WireProtocol::Socks5,
    }
}

#[test]
fn suppresses_duplicate_stream_closed_for_same_flow() {
    let sink = VecEventSink::default();
    let engine = MuxEngine::new(PortmuxConfig::default(), sink.clone()).expect("valid config");

    let context = sample_context(7);
    let mut first = Event::new(EventType::StreamClosed, context.clone());
    first
        .attributes
        .insert("reason_code".to_string(), "relay_eof".to_string());
    engine.emit_event(first);

    let mut second = Event::new(EventType::StreamClosed, context);
    second
        .attributes
        .insert("reason_code".to_string(), "relay_error".to_string());
    engine.emit_event(second);

    let events = sink.snapshot();
    assert_eq!(events.len(), 1, "only one stream_closed should be emitted");
    assert_eq!(events[0].kind, EventType::StreamClosed);
    assert_eq!(
        events[0].attributes.get("reason_code").map(String::as_str),
        Some("relay_eof")
    );
}

#[test]
fn enforces_max_flow_event_backlog_by_dropping_non_close_events() {
    let sink = VecEventSink::default();
    let config = PortmuxConfig {
        max_flow_event_backlog: 2,
        ..PortmuxConfig::default()
    };
    let engine = MuxEngine::new(config, sink.clone()).expect("valid config");

    let context = sample_context(11);
    engine.emit_event(Event::new(EventType::ProtocolDetected, context.clone()));
    engine.emit_event(Event::new(
        EventType::SocksHandshakeCompleted,
        context.clone(),
    ));
    engine.emit_event(Event::new(EventType::TunnelEstablished, context.clone()));
    engine.emit_event(Event::new(EventType::StreamClosed, context));

    let events = sink.snapshot();
    assert_eq!(events.len(), 3, "third non-close event should be dropped");
    assert_eq!(events[0].kind, EventType::ProtocolDetected);
    assert_eq!(events[1].kind, EventType::SocksHandshakeCompleted);
    assert_eq!(events[2].kind, EventType::StreamClosed);
}

#[test]
fn flow_sequence_ids_are_per_flow_and_monotonic() {
    let sink = VecEventSink::default();
    let engine = MuxEngine::new(PortmuxConfig::default(), sink.clone()).expect("valid config");

    engine.emit_event(Event::new(EventType::ProtocolDetected, sample_context(1)));
    engine.emit_event(Event::new(EventType::ProtocolDetected, sample_context(2)));
    engine.emit_event(Event::new(
        EventType::SocksHandshakeCompleted,
        sample_context(1),
    ));

    let events = sink.snapshot();
    assert_eq!(events[0].flow_sequence_id, 1);
    assert_eq!(events[1].flow_sequence_id, 1);
    assert_eq!(events[2].flow_sequence_id, 2);
    assert!(events.windows(2).all(|w| w[0].sequence_id < w[1].sequence_id));
}

#[test]
fn allocate_flow_id_is_monotonic() {
    let engine =
        MuxEngine::new(PortmuxConfig::default(), VecEventSink::default()).expect("valid config");
    let first = engine.allocate_flow_id();
    let second = engine.allocate_flow_id();
    assert!(second > first);
}
