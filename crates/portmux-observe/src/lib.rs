use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

mod event_log;

pub use event_log::{
    event_log_record, segment_path, EventLogConfig, EventLogRecord, EventLogSink,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    ConnectionAccepted,
    ProtocolDetected,
    SocksHandshakeCompleted,
    SocksHandshakeFailed,
    TlsHandshakeStarted,
    TlsHandshakeSucceeded,
    TlsHandshakeFailed,
    TunnelEstablished,
    TunnelConnectFailed,
    RelayBufferFlushed,
    RelayBufferOverflow,
    BinaryExchangeCompleted,
    UpgradeRequired,
    StreamClosed,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConnectionAccepted => "connection_accepted",
            Self::ProtocolDetected => "protocol_detected",
            Self::SocksHandshakeCompleted => "socks_handshake_completed",
            Self::SocksHandshakeFailed => "socks_handshake_failed",
            Self::TlsHandshakeStarted => "tls_handshake_started",
            Self::TlsHandshakeSucceeded => "tls_handshake_succeeded",
            Self::TlsHandshakeFailed => "tls_handshake_failed",
            Self::TunnelEstablished => "tunnel_established",
            Self::TunnelConnectFailed => "tunnel_connect_failed",
            Self::RelayBufferFlushed => "relay_buffer_flushed",
            Self::RelayBufferOverflow => "relay_buffer_overflow",
            Self::BinaryExchangeCompleted => "binary_exchange_completed",
            Self::UpgradeRequired => "upgrade_required",
            Self::StreamClosed => "stream_closed",
        }
    }
}

/// Wire-level protocol class a flow settled on after detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireProtocol {
    Undetermined,
    Socks4,
    Socks5,
    Tls,
    Http,
    ProxyConnected,
    Binary,
}

impl WireProtocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Undetermined => "undetermined",
            Self::Socks4 => "socks4",
            Self::Socks5 => "socks5",
            Self::Tls => "tls",
            Self::Http => "http",
            Self::ProxyConnected => "proxy_connected",
            Self::Binary => "binary",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowContext {
    pub flow_id: u64,
    pub client_addr: String,
    pub server_host: String,
    pub server_port: u16,
    pub protocol: WireProtocol,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventType,
    pub context: FlowContext,
    pub sequence_id: u64,
    pub flow_sequence_id: u64,
    pub occurred_at_unix_ms: u128,
    pub attributes: BTreeMap<String, String>,
}

impl Event {
    pub fn new(kind: EventType, context: FlowContext) -> Self {
        Self {
            kind,
            context,
            sequence_id: 0,
            flow_sequence_id: 0,
            occurred_at_unix_ms: now_unix_ms(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<String>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

impl<T> EventSink for Box<T>
where
    T: EventSink + ?Sized,
{
    fn emit(&self, event: Event) {
        (**self).emit(event);
    }
}

#[derive(Debug, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: Event) {}
}

#[derive(Debug, Default, Clone)]
pub struct VecEventSink {
    events: Arc<Mutex<Vec<Event>>>,
}

impl VecEventSink {
    pub fn snapshot(&self) -> Vec<Event> {
        self.events.lock().expect("lock poisoned").clone()
    }

    pub fn kinds(&self) -> Vec<EventType> {
        self.snapshot().iter().map(|event| event.kind).collect()
    }
}

impl EventSink for VecEventSink {
    fn emit(&self, event: Event) {
        self.events.lock().expect("lock poisoned").push(event);
    }
}

fn now_unix_ms() -> u128 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis(),
        Err(_) => 0,
    }
}
