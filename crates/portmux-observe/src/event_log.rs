use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;

use crate::{Event, EventSink};

pub const EVENT_LOG_SCHEMA: &str = "portmux-event-log-v1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventLogConfig {
    pub log_path: PathBuf,
    pub flush_every: usize,
    pub rotate_bytes: Option<u64>,
}

impl EventLogConfig {
    pub fn new(log_path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: log_path.into(),
            flush_every: 1,
            rotate_bytes: None,
        }
    }

    pub fn with_flush_every(mut self, flush_every: usize) -> Self {
        self.flush_every = flush_every.max(1);
        self
    }

    pub fn with_rotate_bytes(mut self, rotate_bytes: Option<u64>) -> Self {
        self.rotate_bytes = rotate_bytes.filter(|value| *value > 0);
        self
    }
}

/// Stable on-disk shape of one event line. Runtime clocks are excluded so
/// two identical runs produce identical log bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventLogRecord {
    pub schema: &'static str,
    pub sequence_id: u64,
    pub flow_id: u64,
    pub flow_sequence_id: u64,
    pub kind: &'static str,
    pub protocol: &'static str,
    pub client_addr: String,
    pub server_host: String,
    pub server_port: u16,
    pub attributes: BTreeMap<String, String>,
}

pub fn event_log_record(event: &Event) -> EventLogRecord {
    let context = &event.context;
    EventLogRecord {
        schema: EVENT_LOG_SCHEMA,
        sequence_id: event.sequence_id,
        flow_id: context.flow_id,
        flow_sequence_id: event.flow_sequence_id,
        kind: event.kind.as_str(),
        protocol: context.protocol.as_str(),
        client_addr: context.client_addr.clone(),
        server_host: context.server_host.clone(),
        server_port: context.server_port,
        attributes: event.attributes.clone(),
    }
}

#[derive(Debug)]
struct EventLogState {
    writer: BufWriter<File>,
    segment_id: u64,
    segment_bytes: u64,
    events_since_flush: usize,
}

#[derive(Debug)]
pub struct EventLogSink {
    config: EventLogConfig,
    state: Mutex<EventLogState>,
    write_error_count: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl EventLogSink {
    pub fn new(config: EventLogConfig) -> io::Result<Self> {
        if config.log_path.as_os_str().is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "event log path must not be empty",
            ));
        }

        ensure_parent_exists(&config.log_path)?;
        let state = EventLogState {
            writer: BufWriter::new(create_truncated_file(&segment_path(&config.log_path, 0))?),
            segment_id: 0,
            segment_bytes: 0,
            events_since_flush: 0,
        };
        Ok(Self {
            config,
            state: Mutex::new(state),
            write_error_count: AtomicU64::new(0),
            last_error: Mutex::new(None),
        })
    }

    pub fn flush(&self) -> io::Result<()> {
        self.state.lock().expect("lock poisoned").writer.flush()
    }

    pub fn write_error_count(&self) -> u64 {
        self.write_error_count.load(Ordering::Relaxed)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().expect("lock poisoned").clone()
    }

    fn write_event(&self, event: &Event) -> io::Result<()> {
        let record = event_log_record(event);
        let mut line = serde_json::to_vec(&record)
            .map_err(|error| io::Error::other(format!("serialize event log record: {error}")))?;
        line.push(b'\n');

        let mut state = self.state.lock().expect("lock poisoned");
        maybe_rotate_segment(&self.config, &mut state, line.len() as u64)?;
        state.writer.write_all(&line)?;
        state.segment_bytes = state.segment_bytes.saturating_add(line.len() as u64);

        state.events_since_flush = state.events_since_flush.saturating_add(1);
        if state.events_since_flush >= self.config.flush_every {
            state.writer.flush()?;
            state.events_since_flush = 0;
        }
        Ok(())
    }
}

impl EventSink for EventLogSink {
    fn emit(&self, event: Event) {
        if let Err(error) = self.write_event(&event) {
            self.write_error_count.fetch_add(1, Ordering::Relaxed);
            *self.last_error.lock().expect("lock poisoned") = Some(error.to_string());
            eprintln!("event log sink write failed: {error}");
        }
    }
}

fn maybe_rotate_segment(
    config: &EventLogConfig,
    state: &mut EventLogState,
    next_line_len: u64,
) -> io::Result<()> {
    let Some(limit_bytes) = config.rotate_bytes else {
        return Ok(());
    };
    if state.segment_bytes == 0 {
        return Ok(());
    }
    if state.segment_bytes.saturating_add(next_line_len) <= limit_bytes {
        return Ok(());
    }

    state.writer.flush()?;
    state.segment_id = state.segment_id.saturating_add(1);
    state.writer = BufWriter::new(create_truncated_file(&segment_path(
        &config.log_path,
        state.segment_id,
    ))?);
    state.segment_bytes = 0;
    Ok(())
}

pub fn segment_path(log_path: &Path, segment_id: u64) -> PathBuf {
    if segment_id == 0 {
        return log_path.to_path_buf();
    }

    let mut file_name = match log_path.file_name() {
        Some(name) => name.to_os_string(),
        None => OsString::from("events.jsonl"),
    };
    file_name.push(format!(".part{segment_id:05}"));

    match log_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.join(file_name),
        _ => PathBuf::from(file_name),
    }
}

fn ensure_parent_exists(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

fn create_truncated_file(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(path)
}
