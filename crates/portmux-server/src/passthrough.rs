//! Opaque binary fallback.
//!
//! Streams that never classified are answered with the fixed unknown-format
//! reply, unless a binary remote is configured, in which case the whole
//! client stream is forwarded to that remote as one opaque exchange. An
//! unreachable remote is reported and the connection closed without a reply.

use std::io;
use std::time::Duration;

use portmux_core::MuxEngine;
use portmux_observe::{Event, EventSink, EventType, FlowContext};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::relay::IO_CHUNK_SIZE;
use crate::BoxedStream;

pub(crate) const UNKNOWN_MESSAGE_FORMAT: &[u8] = b"unknown message format";

pub(crate) async fn run_binary<S>(
    engine: &MuxEngine<S>,
    context: &FlowContext,
    client: &mut BoxedStream,
    probe: Vec<u8>,
) -> io::Result<()>
where
    S: EventSink,
{
    let Some(remote) = engine.config.binary_remote.clone() else {
        client.write_all(UNKNOWN_MESSAGE_FORMAT).await?;
        return Ok(());
    };

    let connect_timeout = Duration::from_millis(engine.config.connect_timeout_ms);
    let authority = remote.authority();
    let upstream = match tokio::time::timeout(connect_timeout, TcpStream::connect(&authority)).await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(error)) => {
            eprintln!(
                "portmux: flow {} binary remote {authority} unreachable: {error}",
                context.flow_id
            );
            engine.emit_event(
                Event::new(EventType::TunnelConnectFailed, context.clone())
                    .with_attribute("upstream", &authority)
                    .with_attribute("error", error.to_string()),
            );
            return Ok(());
        }
        Err(_) => {
            eprintln!(
                "portmux: flow {} binary remote {authority} connect timed out",
                context.flow_id
            );
            engine.emit_event(
                Event::new(EventType::TunnelConnectFailed, context.clone())
                    .with_attribute("upstream", &authority)
                    .with_attribute("error", "connect timed out"),
            );
            return Ok(());
        }
    };

    let (request_bytes, response_bytes) =
        exchange(client, upstream, probe, engine.config.binary_exchange_timeout_ms).await?;

    engine.emit_event(
        Event::new(EventType::BinaryExchangeCompleted, context.clone())
            .with_attribute("upstream", &authority)
            .with_attribute("request_bytes", request_bytes.to_string())
            .with_attribute("response_bytes", response_bytes.to_string()),
    );
    Ok(())
}

/// Treat the entire client stream as one opaque request: forward the
/// accumulated probe, then keep draining the client into the remote until it
/// half-closes or goes idle for the exchange window. The response is relayed
/// back the same way, bounded by the same window per read.
async fn exchange(
    client: &mut BoxedStream,
    mut upstream: TcpStream,
    probe: Vec<u8>,
    exchange_timeout_ms: u64,
) -> io::Result<(u64, u64)> {
    let window = Duration::from_millis(exchange_timeout_ms);

    upstream.write_all(&probe).await?;
    let mut request_bytes = probe.len() as u64;

    let mut chunk = vec![0_u8; IO_CHUNK_SIZE];
    loop {
        let read = match tokio::time::timeout(window, client.read(&mut chunk)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(read)) => read,
            Ok(Err(error)) => return Err(error),
            Err(_) => break,
        };
        upstream.write_all(&chunk[..read]).await?;
        request_bytes += read as u64;
    }
    // Half-close signals the remote that the request is complete.
    upstream.shutdown().await?;

    let mut response_bytes = 0_u64;
    loop {
        let read = match tokio::time::timeout(window, upstream.read(&mut chunk)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(read)) => read,
            Ok(Err(error)) => return Err(error),
            Err(_) => break,
        };
        client.write_all(&chunk[..read]).await?;
        response_bytes += read as u64;
    }
    Ok((request_bytes, response_bytes))
}
