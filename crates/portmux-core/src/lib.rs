use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use portmux_observe::{Event, EventSink, EventType};

mod config;
mod flow_state;
pub use config::{
    EventSinkConfig, EventSinkKind, PortmuxConfig, PortmuxConfigError, RemoteEndpoint,
    SocksCredentials,
};
use flow_state::FlowStateTracker;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub server_host: String,
    pub server_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectParseError {
    IncompleteHeaders,
    InvalidUtf8,
    EmptyRequestLine,
    InvalidRequestLine,
    MethodNotConnect,
    InvalidHttpVersion,
    InvalidAuthority,
    MissingPort,
    InvalidPort,
}

impl ConnectParseError {
    pub fn code(self) -> &'static str {
        match self {
            Self::IncompleteHeaders => "incomplete_headers",
            Self::InvalidUtf8 => "invalid_utf8",
            Self::EmptyRequestLine => "empty_request_line",
            Self::InvalidRequestLine => "invalid_request_line",
            Self::MethodNotConnect => "method_not_connect",
            Self::InvalidHttpVersion => "invalid_http_version",
            Self::InvalidAuthority => "invalid_authority",
            Self::MissingPort => "missing_port",
            Self::InvalidPort => "invalid_port",
        }
    }
}

pub fn parse_connect_request_line(request_line: &str) -> Result<ConnectRequest, ConnectParseError> {
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or(ConnectParseError::EmptyRequestLine)?;
    let authority = parts.next().ok_or(ConnectParseError::InvalidRequestLine)?;
    let version = parts.next().ok_or(ConnectParseError::InvalidRequestLine)?;

    if parts.next().is_some() {
        return Err(ConnectParseError::InvalidRequestLine);
    }
    if method != "CONNECT" {
        return Err(ConnectParseError::MethodNotConnect);
    }
    if !version.starts_with("HTTP/") {
        return Err(ConnectParseError::InvalidHttpVersion);
    }

    let (server_host, server_port) = parse_connect_authority(authority)?;
    Ok(ConnectRequest {
        server_host,
        server_port,
    })
}

/// Parse the request head of a CONNECT message. Returns the parsed request
/// and the number of bytes the head occupies, so the caller can replay any
/// same-segment payload into the tunnel.
pub fn parse_connect_request_head(
    input: &[u8],
) -> Result<(ConnectRequest, usize), ConnectParseError> {
    let header_end = header_terminator_index(input).ok_or(ConnectParseError::IncompleteHeaders)?;
    let head =
        std::str::from_utf8(&input[..header_end]).map_err(|_| ConnectParseError::InvalidUtf8)?;
    let request_line = head
        .split("\r\n")
        .next()
        .ok_or(ConnectParseError::EmptyRequestLine)?;
    let request = parse_connect_request_line(request_line)?;
    Ok((request, header_end))
}

fn header_terminator_index(input: &[u8]) -> Option<usize> {
    input
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|index| index + 4)
}

fn parse_connect_authority(authority: &str) -> Result<(String, u16), ConnectParseError> {
    if authority.starts_with('[') {
        let bracket_close = authority
            .find(']')
            .ok_or(ConnectParseError::InvalidAuthority)?;
        let host = &authority[1..bracket_close];
        if host.is_empty() {
            return Err(ConnectParseError::InvalidAuthority);
        }

        let suffix = &authority[bracket_close + 1..];
        let port_text = suffix
            .strip_prefix(':')
            .ok_or(ConnectParseError::MissingPort)?;
        if port_text.is_empty() {
            return Err(ConnectParseError::MissingPort);
        }
        let server_port = port_text
            .parse::<u16>()
            .map_err(|_| ConnectParseError::InvalidPort)?;
        return Ok((host.to_string(), server_port));
    }

    let (host, port_text) = authority
        .rsplit_once(':')
        .ok_or(ConnectParseError::MissingPort)?;
    if host.is_empty() || host.contains(':') {
        return Err(ConnectParseError::InvalidAuthority);
    }
    if port_text.is_empty() {
        return Err(ConnectParseError::MissingPort);
    }
    let server_port = port_text
        .parse::<u16>()
        .map_err(|_| ConnectParseError::InvalidPort)?;
    Ok((host.to_string(), server_port))
}

pub struct MuxEngine<S>
where
    S: EventSink,
{
    pub config: PortmuxConfig,
    sink: S,
    next_flow_id: AtomicU64,
    next_sequence_id: AtomicU64,
    flow_state_tracker: FlowStateTracker,
    recently_closed_flows: Mutex<VecDeque<u64>>,
}

impl<S> MuxEngine<S>
where
    S: EventSink,
{
    pub fn new(config: PortmuxConfig, sink: S) -> Result<Self, PortmuxConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            sink,
            next_flow_id: AtomicU64::new(1),
            next_sequence_id: AtomicU64::new(1),
            flow_state_tracker: FlowStateTracker::default(),
            recently_closed_flows: Mutex::new(VecDeque::new()),
        })
    }

    pub fn allocate_flow_id(&self) -> u64 {
        self.next_flow_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn emit_event(&self, mut event: Event) {
        if event.kind == EventType::StreamClosed
            && !self.register_stream_closed(event.context.flow_id)
        {
            return;
        }

        event.sequence_id = self.next_sequence_id.fetch_add(1, Ordering::Relaxed);
        let flow_sequence_id = self
            .flow_state_tracker
            .on_event(event.context.flow_id, event.kind);
        if flow_sequence_id as usize > self.config.max_flow_event_backlog
            && event.kind != EventType::StreamClosed
        {
            return;
        }
        event.flow_sequence_id = flow_sequence_id;
        self.sink.emit(event);
    }

    /// A flow emits stream_closed at most once, however many paths race to
    /// report the close.
    fn register_stream_closed(&self, flow_id: u64) -> bool {
        const RECENT_CLOSED_FLOW_IDS: usize = 16_384;
        let mut closed = self
            .recently_closed_flows
            .lock()
            .expect("recently_closed_flows lock poisoned");
        if closed.iter().any(|existing| *existing == flow_id) {
            return false;
        }
        closed.push_back(flow_id);
        while closed.len() > RECENT_CLOSED_FLOW_IDS {
            closed.pop_front();
        }
        true
    }
}

#[cfg(test)]
mod tests {
    include!("tests_config_schema.rs");
    include!("tests_connect_parser.rs");
    include!("tests_engine_guardrails.rs");
}
