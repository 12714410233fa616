//! SOCKS4 and SOCKS5 handshake execution.
//!
//! Classification already parsed the first client message, so the SOCKS4
//! runner starts from a decoded request while the SOCKS5 runner continues the
//! negotiation on the socket. Both return the destination and the reply
//! format the tunnel owes the client, or `None` when the handshake was
//! refused and the refusal already written.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};

use portmux_core::{MuxEngine, SocksCredentials};
use portmux_detect::{
    DestinationAddr, Socks4Request, Socks5Greeting, SocksCommand, SOCKS5_AUTH_NONE,
    SOCKS5_AUTH_PASSWORD, SOCKS5_VERSION,
};
use portmux_observe::{Event, EventSink, EventType, FlowContext};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::connect::{AckFormat, Destination};
use crate::BoxedStream;

const SOCKS4_REPLY_REJECTED: u8 = 0x5b;

const SOCKS5_CMD_CONNECT: u8 = 0x01;
const SOCKS5_ATYP_IPV4: u8 = 0x01;
const SOCKS5_ATYP_DOMAIN: u8 = 0x03;
const SOCKS5_ATYP_IPV6: u8 = 0x04;
const SOCKS5_REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const SOCKS5_AUTH_SUBNEG_VERSION: u8 = 0x01;

/// Act on an already-parsed SOCKS4/4a request. BIND is refused with the
/// standard rejection reply.
pub(crate) async fn run_socks4<S>(
    engine: &MuxEngine<S>,
    context: &FlowContext,
    client: &mut BoxedStream,
    request: &Socks4Request,
) -> io::Result<Option<(Destination, AckFormat)>>
where
    S: EventSink,
{
    if request.command != SocksCommand::Connect {
        let mut rejection = vec![0x00, SOCKS4_REPLY_REJECTED];
        rejection.extend_from_slice(&request.port.to_be_bytes());
        rejection.extend_from_slice(&request.ip.octets());
        client.write_all(&rejection).await?;
        engine.emit_event(
            Event::new(EventType::SocksHandshakeFailed, context.clone())
                .with_attribute("reason", "command_not_supported"),
        );
        return Ok(None);
    }

    engine.emit_event(
        Event::new(EventType::SocksHandshakeCompleted, context.clone())
            .with_attribute("user_id", &request.user_id),
    );
    let destination = Destination {
        addr: request.destination(),
        port: request.port,
        secure: false,
    };
    let ack = AckFormat::Socks4 {
        port: request.port,
        ip: request.ip,
    };
    Ok(Some((destination, ack)))
}

/// Continue a SOCKS5 negotiation from the parsed greeting: method selection,
/// optional username/password subnegotiation, then the command request.
pub(crate) async fn run_socks5<S>(
    engine: &MuxEngine<S>,
    context: &FlowContext,
    client: &mut BoxedStream,
    greeting: &Socks5Greeting,
    credentials: Option<&SocksCredentials>,
) -> io::Result<Option<(Destination, AckFormat)>>
where
    S: EventSink,
{
    // Prefer username/password only when credentials are configured and the
    // client offered it. Anything else gets NO_AUTH, even when it was not
    // offered, which keeps permissive clients connectable.
    let method = match credentials {
        Some(_) if greeting.offers(SOCKS5_AUTH_PASSWORD) => SOCKS5_AUTH_PASSWORD,
        _ => SOCKS5_AUTH_NONE,
    };
    client.write_all(&[SOCKS5_VERSION, method]).await?;

    if method == SOCKS5_AUTH_PASSWORD {
        let expected = match credentials {
            Some(credentials) => credentials,
            None => return Ok(None),
        };
        if !verify_password_subnegotiation(client, expected).await? {
            engine.emit_event(
                Event::new(EventType::SocksHandshakeFailed, context.clone())
                    .with_attribute("reason", "authentication_failed"),
            );
            return Ok(None);
        }
    }

    let mut header = [0_u8; 4];
    client.read_exact(&mut header).await?;
    let [version, command, _reserved, address_type] = header;
    if version != SOCKS5_VERSION {
        engine.emit_event(
            Event::new(EventType::SocksHandshakeFailed, context.clone())
                .with_attribute("reason", "bad_request_version"),
        );
        return Ok(None);
    }

    let addr = match address_type {
        SOCKS5_ATYP_IPV4 => {
            let mut octets = [0_u8; 4];
            client.read_exact(&mut octets).await?;
            DestinationAddr::Ipv4(Ipv4Addr::from(octets))
        }
        SOCKS5_ATYP_DOMAIN => {
            let mut len = [0_u8; 1];
            client.read_exact(&mut len).await?;
            let mut name = vec![0_u8; len[0] as usize];
            client.read_exact(&mut name).await?;
            match String::from_utf8(name) {
                Ok(name) => DestinationAddr::Domain(name),
                Err(_) => {
                    engine.emit_event(
                        Event::new(EventType::SocksHandshakeFailed, context.clone())
                            .with_attribute("reason", "bad_domain_encoding"),
                    );
                    return Ok(None);
                }
            }
        }
        SOCKS5_ATYP_IPV6 => {
            let mut octets = [0_u8; 16];
            client.read_exact(&mut octets).await?;
            DestinationAddr::Ipv6(Ipv6Addr::from(octets))
        }
        _ => {
            engine.emit_event(
                Event::new(EventType::SocksHandshakeFailed, context.clone())
                    .with_attribute("reason", "bad_address_type"),
            );
            return Ok(None);
        }
    };

    let mut port_bytes = [0_u8; 2];
    client.read_exact(&mut port_bytes).await?;
    let port = u16::from_be_bytes(port_bytes);

    if command != SOCKS5_CMD_CONNECT {
        let refusal = [
            SOCKS5_VERSION,
            SOCKS5_REPLY_COMMAND_NOT_SUPPORTED,
            0x00,
            SOCKS5_ATYP_IPV4,
            0,
            0,
            0,
            0,
            0,
            0,
        ];
        client.write_all(&refusal).await?;
        engine.emit_event(
            Event::new(EventType::SocksHandshakeFailed, context.clone())
                .with_attribute("reason", "command_not_supported")
                .with_attribute("command", command.to_string()),
        );
        return Ok(None);
    }

    engine.emit_event(Event::new(
        EventType::SocksHandshakeCompleted,
        context.clone(),
    ));
    let destination = Destination {
        addr: addr.clone(),
        port,
        secure: false,
    };
    let ack = AckFormat::Socks5 { dest: addr, port };
    Ok(Some((destination, ack)))
}

/// RFC 1929 username/password subnegotiation. Writes the status reply either
/// way and reports whether the credentials matched.
async fn verify_password_subnegotiation(
    client: &mut BoxedStream,
    expected: &SocksCredentials,
) -> io::Result<bool> {
    let mut header = [0_u8; 2];
    client.read_exact(&mut header).await?;
    let [version, username_len] = header;

    let mut username = vec![0_u8; username_len as usize];
    client.read_exact(&mut username).await?;
    let mut password_len = [0_u8; 1];
    client.read_exact(&mut password_len).await?;
    let mut password = vec![0_u8; password_len[0] as usize];
    client.read_exact(&mut password).await?;

    let matched = version == SOCKS5_AUTH_SUBNEG_VERSION
        && username == expected.username.as_bytes()
        && password == expected.password.as_bytes();
    let status = if matched { 0x00 } else { 0x01 };
    client
        .write_all(&[SOCKS5_AUTH_SUBNEG_VERSION, status])
        .await?;
    Ok(matched)
}
