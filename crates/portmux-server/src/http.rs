//! Plaintext HTTP handling on the unified port.
//!
//! CONNECT requests turn into tunnels. Everything else is answered by the
//! pluggable [`HttpResponder`], unless TLS is required for HTTP and the
//! request arrived outside a terminated TLS session, in which case the
//! client gets 426 Upgrade Required.

use std::io;
use std::net::SocketAddr;

use portmux_core::{parse_connect_request_head, ConnectRequest, MuxEngine};
use portmux_observe::{Event, EventSink, EventType, FlowContext};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::bindings::PortBindingCache;
use crate::connect::{destination_addr_from_host, AckFormat, Destination};
use crate::relay::find_subsequence;
use crate::BoxedStream;

const UPGRADE_REQUIRED_RESPONSE: &[u8] = b"HTTP/1.1 426 Upgrade Required\r\n\
Upgrade: TLS/1.2, HTTP/1.1\r\n\
Connection: Upgrade\r\n\
Content-Length: 0\r\n\r\n";

const BAD_REQUEST_RESPONSE: &[u8] =
    b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

/// Application seam for plain (non-CONNECT) requests reaching the listener.
pub trait HttpResponder: Send + Sync {
    /// Given the request head (start line through the blank line), produce
    /// the full response bytes to write back.
    fn respond(&self, request_head: &[u8]) -> Vec<u8>;
}

/// Default responder: every request is 404.
#[derive(Debug, Default)]
pub struct NotFoundResponder;

impl HttpResponder for NotFoundResponder {
    fn respond(&self, _request_head: &[u8]) -> Vec<u8> {
        b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n".to_vec()
    }
}

pub(crate) enum HttpOutcome {
    Tunnel {
        destination: Destination,
        ack: AckFormat,
        leftover: Vec<u8>,
    },
    /// A response was written; the flow is done.
    Handled,
}

#[allow(clippy::too_many_arguments)]
pub(crate) async fn run_http<S>(
    engine: &MuxEngine<S>,
    context: &FlowContext,
    client: &mut BoxedStream,
    probe: Vec<u8>,
    downstream_tls: bool,
    responder: &dyn HttpResponder,
    bindings: &PortBindingCache,
    local_addr: SocketAddr,
) -> io::Result<HttpOutcome>
where
    S: EventSink,
{
    // First HTTP traffic on a listening address fills in its alias set;
    // later flows reuse the cached entry.
    bindings.aliases(local_addr);

    if engine.config.tls_required_for_http && !downstream_tls {
        client.write_all(UPGRADE_REQUIRED_RESPONSE).await?;
        engine.emit_event(Event::new(EventType::UpgradeRequired, context.clone()));
        return Ok(HttpOutcome::Handled);
    }

    let head = match read_request_head(client, probe, engine.config.max_probe_bytes).await? {
        Some(head) => head,
        None => {
            client.write_all(BAD_REQUEST_RESPONSE).await?;
            return Ok(HttpOutcome::Handled);
        }
    };

    if head.starts_with(b"CONNECT ") {
        let (request, consumed) = match parse_connect_request_head(&head) {
            Ok(parsed) => parsed,
            Err(error) => {
                eprintln!(
                    "portmux: flow {} rejected CONNECT: {}",
                    context.flow_id,
                    error.code()
                );
                client.write_all(BAD_REQUEST_RESPONSE).await?;
                return Ok(HttpOutcome::Handled);
            }
        };
        let ConnectRequest {
            server_host,
            server_port,
        } = request;
        if bindings.is_local_destination(local_addr, &server_host, server_port) {
            // Tunnelling back into this listener would loop.
            eprintln!(
                "portmux: flow {} refused CONNECT to local alias {server_host}:{server_port}",
                context.flow_id
            );
            engine.emit_event(
                Event::new(EventType::TunnelConnectFailed, context.clone())
                    .with_attribute("upstream", format!("{server_host}:{server_port}"))
                    .with_attribute("error", "destination is the listener itself"),
            );
            client
                .write_all(&AckFormat::HttpConnect.failure_reply())
                .await?;
            return Ok(HttpOutcome::Handled);
        }
        let destination = Destination {
            addr: destination_addr_from_host(&server_host),
            port: server_port,
            secure: false,
        };
        return Ok(HttpOutcome::Tunnel {
            destination,
            ack: AckFormat::HttpConnect,
            leftover: head[consumed..].to_vec(),
        });
    }

    let head_end = find_subsequence(&head, b"\r\n\r\n")
        .map(|index| index + 4)
        .unwrap_or(head.len());
    let response = responder.respond(&head[..head_end]);
    client.write_all(&response).await?;
    Ok(HttpOutcome::Handled)
}

/// Accumulate bytes until the header terminator is present. `None` when the
/// peer closes early or the head outgrows the probe budget.
async fn read_request_head(
    client: &mut BoxedStream,
    probe: Vec<u8>,
    max_head_bytes: usize,
) -> io::Result<Option<Vec<u8>>> {
    let mut buf = probe;
    loop {
        if find_subsequence(&buf, b"\r\n\r\n").is_some() {
            return Ok(Some(buf));
        }
        if buf.len() >= max_head_bytes {
            return Ok(None);
        }
        let mut chunk = [0_u8; 1024];
        let read = client.read(&mut chunk).await?;
        if read == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..read]);
    }
}
