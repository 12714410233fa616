//! Handling for the internal proxy-connected marker.
//!
//! A chained listener announces an already-negotiated destination with a
//! single CRLF-terminated marker line. The acknowledgement echoes the line
//! back under the response prefix before any tunnel bytes flow, so the
//! sending side can confirm the handoff without a second round trip.

use std::io;

use portmux_core::MuxEngine;
use portmux_detect::{parse_proxied_marker, PROXIED_RESPONSE_PREFIX};
use portmux_observe::{EventSink, FlowContext};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::connect::{destination_addr_from_host, AckFormat, Destination};
use crate::BoxedStream;

pub(crate) async fn run_proxied<S>(
    engine: &MuxEngine<S>,
    context: &FlowContext,
    client: &mut BoxedStream,
    probe: Vec<u8>,
) -> io::Result<Option<(Destination, AckFormat, Vec<u8>)>>
where
    S: EventSink,
{
    let max_line_bytes = engine.config.max_probe_bytes;
    let mut buf = probe;

    let newline = loop {
        if let Some(index) = buf.iter().position(|byte| *byte == b'\n') {
            break index;
        }
        if buf.len() >= max_line_bytes {
            eprintln!(
                "portmux: flow {} marker line exceeded {max_line_bytes} bytes",
                context.flow_id
            );
            return Ok(None);
        }
        let mut chunk = [0_u8; 512];
        let read = client.read(&mut chunk).await?;
        if read == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..read]);
    };

    let leftover = buf.split_off(newline + 1);
    buf.truncate(newline);
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }

    let line = match std::str::from_utf8(&buf) {
        Ok(line) => line,
        Err(_) => return Ok(None),
    };
    let target = match parse_proxied_marker(line) {
        Some(target) => target,
        None => {
            eprintln!(
                "portmux: flow {} malformed proxy-connected marker",
                context.flow_id
            );
            return Ok(None);
        }
    };

    let mut ack = Vec::with_capacity(PROXIED_RESPONSE_PREFIX.len() + line.len() + 2);
    ack.extend_from_slice(PROXIED_RESPONSE_PREFIX.as_bytes());
    ack.extend_from_slice(line.as_bytes());
    ack.extend_from_slice(b"\r\n");
    client.write_all(&ack).await?;

    let destination = Destination {
        addr: destination_addr_from_host(&target.host),
        port: target.port,
        secure: target.secure,
    };
    Ok(Some((destination, AckFormat::Proxied, leftover)))
}
