//! Tunnel establishment and the per-protocol acknowledgement formats.
//!
//! Whatever protocol carried the request, the path is the same: connect
//! upstream within the configured timeout, send exactly one acknowledgement
//! in the requesting protocol's format, then hand both sockets to the relay.

use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use portmux_core::MuxEngine;
use portmux_detect::DestinationAddr;
use portmux_observe::{Event, EventSink, EventType, FlowContext};
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::relay::{splice_tunnel, Interceptor, RelayDirection, RelayDirectionStats};
use crate::BoxedStream;

const SOCKS4_REPLY_GRANTED: u8 = 0x5a;
const SOCKS4_REPLY_REJECTED: u8 = 0x5b;
const SOCKS5_REPLY_SUCCESS: u8 = 0x00;
const SOCKS5_REPLY_GENERAL_FAILURE: u8 = 0x01;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub addr: DestinationAddr,
    pub port: u16,
    /// The outbound leg must be TLS-wrapped regardless of how the request
    /// arrived.
    pub secure: bool,
}

impl Destination {
    pub fn connect_authority(&self) -> String {
        match &self.addr {
            DestinationAddr::Ipv6(ip) => format!("[{}]:{}", ip, self.port),
            other => format!("{}:{}", other.host_string(), self.port),
        }
    }
}

/// Acknowledgement wire format owed to the client once the upstream connect
/// resolves. Exactly one reply is written per flow, success or failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckFormat {
    Socks4 { port: u16, ip: Ipv4Addr },
    Socks5 { dest: DestinationAddr, port: u16 },
    HttpConnect,
    /// The marker response was already written when the marker line was
    /// parsed, so both replies are empty.
    Proxied,
}

impl AckFormat {
    pub fn success_reply(&self) -> Vec<u8> {
        match self {
            Self::Socks4 { port, ip } => socks4_reply(SOCKS4_REPLY_GRANTED, *port, *ip),
            Self::Socks5 { dest, port } => socks5_success_reply(dest, *port),
            Self::HttpConnect => b"HTTP/1.1 200 Connection Established\r\n\r\n".to_vec(),
            Self::Proxied => Vec::new(),
        }
    }

    pub fn failure_reply(&self) -> Vec<u8> {
        match self {
            Self::Socks4 { port, ip } => socks4_reply(SOCKS4_REPLY_REJECTED, *port, *ip),
            Self::Socks5 { .. } => vec![
                0x05,
                SOCKS5_REPLY_GENERAL_FAILURE,
                0x00,
                0x01,
                0,
                0,
                0,
                0,
                0,
                0,
            ],
            Self::HttpConnect => {
                b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\n\r\n".to_vec()
            }
            Self::Proxied => Vec::new(),
        }
    }
}

/// Interpret a textual host as an IP literal when possible, a DNS name
/// otherwise.
pub(crate) fn destination_addr_from_host(host: &str) -> DestinationAddr {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return DestinationAddr::Ipv4(ip);
    }
    if let Ok(ip) = host.parse::<std::net::Ipv6Addr>() {
        return DestinationAddr::Ipv6(ip);
    }
    DestinationAddr::Domain(host.to_string())
}

fn socks4_reply(status: u8, port: u16, ip: Ipv4Addr) -> Vec<u8> {
    let mut reply = vec![0x00, status];
    reply.extend_from_slice(&port.to_be_bytes());
    reply.extend_from_slice(&ip.octets());
    reply
}

/// SOCKS5 success echoes the requested destination back to the client.
fn socks5_success_reply(dest: &DestinationAddr, port: u16) -> Vec<u8> {
    let mut reply = vec![0x05, SOCKS5_REPLY_SUCCESS, 0x00];
    match dest {
        DestinationAddr::Ipv4(ip) => {
            reply.push(0x01);
            reply.extend_from_slice(&ip.octets());
        }
        DestinationAddr::Domain(name) => {
            let bytes = name.as_bytes();
            let len = bytes.len().min(255);
            reply.push(0x03);
            reply.push(len as u8);
            reply.extend_from_slice(&bytes[..len]);
        }
        DestinationAddr::Ipv6(ip) => {
            reply.push(0x04);
            reply.extend_from_slice(&ip.octets());
        }
    }
    reply.extend_from_slice(&port.to_be_bytes());
    reply
}

/// Connect upstream, acknowledge the client, and relay until both directions
/// finish. `client_leftover` is whatever same-segment payload followed the
/// request bytes.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn establish_tunnel<S>(
    engine: &MuxEngine<S>,
    context: &FlowContext,
    mut client: BoxedStream,
    client_leftover: Vec<u8>,
    destination: &Destination,
    ack: AckFormat,
    upstream_tls: bool,
    upstream_tls_config: Arc<ClientConfig>,
    interceptor: Arc<dyn Interceptor>,
) -> io::Result<()>
where
    S: EventSink,
{
    let connect_timeout = Duration::from_millis(engine.config.connect_timeout_ms);
    let authority = destination.connect_authority();

    let connected = match tokio::time::timeout(connect_timeout, TcpStream::connect(&authority)).await
    {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(error)) => Err(error.to_string()),
        Err(_) => Err(format!("connect timed out after {connect_timeout:?}")),
    };

    let tcp = match connected {
        Ok(stream) => stream,
        Err(error) => {
            engine.emit_event(
                Event::new(EventType::TunnelConnectFailed, context.clone())
                    .with_attribute("upstream", &authority)
                    .with_attribute("error", error),
            );
            client.write_all(&ack.failure_reply()).await?;
            return Ok(());
        }
    };

    client.write_all(&ack.success_reply()).await?;

    let wrap_tls = upstream_tls || destination.secure;
    let upstream: BoxedStream = if wrap_tls {
        let server_name = ServerName::try_from(destination.addr.host_string())
            .map_err(|error| io::Error::new(io::ErrorKind::InvalidInput, error))?;
        let connector = TlsConnector::from(upstream_tls_config);
        Box::new(connector.connect(server_name, tcp).await?)
    } else {
        Box::new(tcp)
    };

    // Port 443 marks the tunnel payload as likely TLS, port 80 as likely
    // plaintext. Recorded for consumers; the relay itself stays opaque.
    let in_tunnel_tls = destination.port == 443;
    engine.emit_event(
        Event::new(EventType::TunnelEstablished, context.clone())
            .with_attribute("upstream", &authority)
            .with_attribute("upstream_tls", if wrap_tls { "true" } else { "false" })
            .with_attribute(
                "in_tunnel_tls_expected",
                if in_tunnel_tls { "true" } else { "false" },
            ),
    );

    let (client_to_upstream, upstream_to_client) = splice_tunnel(
        client,
        upstream,
        client_leftover,
        engine.config.relay_buffer_bytes,
        interceptor,
    )
    .await;

    report_relay_outcome(
        engine,
        context,
        RelayDirection::ClientToUpstream,
        client_to_upstream,
    );
    report_relay_outcome(
        engine,
        context,
        RelayDirection::UpstreamToClient,
        upstream_to_client,
    );
    Ok(())
}

fn report_relay_outcome<S>(
    engine: &MuxEngine<S>,
    context: &FlowContext,
    direction: RelayDirection,
    outcome: io::Result<RelayDirectionStats>,
) where
    S: EventSink,
{
    let stats = match outcome {
        Ok(stats) => stats,
        Err(error) => {
            eprintln!(
                "portmux: flow {} relay {} ended with error: {error}",
                context.flow_id,
                direction.as_str()
            );
            return;
        }
    };
    if stats.buffer_flushes > 0 {
        engine.emit_event(
            Event::new(EventType::RelayBufferFlushed, context.clone())
                .with_attribute("direction", direction.as_str())
                .with_attribute("flushes", stats.buffer_flushes.to_string())
                .with_attribute("bytes_forwarded", stats.bytes_forwarded.to_string()),
        );
    }
    if stats.overflowed {
        engine.emit_event(
            Event::new(EventType::RelayBufferOverflow, context.clone())
                .with_attribute("direction", direction.as_str()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socks4_replies_use_the_request_echo_fields() {
        let ack = AckFormat::Socks4 {
            port: 80,
            ip: Ipv4Addr::new(93, 184, 216, 34),
        };
        assert_eq!(
            ack.success_reply(),
            vec![0x00, 0x5a, 0x00, 0x50, 0x5d, 0xb8, 0xd8, 0x22]
        );
        assert_eq!(
            ack.failure_reply(),
            vec![0x00, 0x5b, 0x00, 0x50, 0x5d, 0xb8, 0xd8, 0x22]
        );
    }

    #[test]
    fn socks5_success_echoes_domain_destination() {
        let ack = AckFormat::Socks5 {
            dest: DestinationAddr::Domain("mock.local".to_string()),
            port: 443,
        };
        let mut expected = vec![0x05, 0x00, 0x00, 0x03, 10];
        expected.extend_from_slice(b"mock.local");
        expected.extend_from_slice(&443_u16.to_be_bytes());
        assert_eq!(ack.success_reply(), expected);
    }

    #[test]
    fn socks5_failure_reply_is_the_fixed_ipv4_zero_form() {
        let ack = AckFormat::Socks5 {
            dest: DestinationAddr::Ipv4(Ipv4Addr::LOCALHOST),
            port: 443,
        };
        assert_eq!(
            ack.failure_reply(),
            vec![0x05, 0x01, 0x00, 0x01, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn proxied_ack_writes_nothing() {
        assert!(AckFormat::Proxied.success_reply().is_empty());
        assert!(AckFormat::Proxied.failure_reply().is_empty());
    }

    #[test]
    fn ipv6_connect_authority_is_bracketed() {
        let destination = Destination {
            addr: DestinationAddr::Ipv6("::1".parse().expect("ipv6")),
            port: 8443,
            secure: false,
        };
        assert_eq!(destination.connect_authority(), "[::1]:8443");
    }
}
