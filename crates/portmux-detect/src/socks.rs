//! SOCKS4/SOCKS4a request and SOCKS5 greeting parsing.
//!
//! Both parsers enforce the exact-consumption rule: a probe is accepted only
//! when it consumes every available byte, so a well-formed frame followed by
//! trailing bytes is not classified as SOCKS.

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::socks4a_hostname_follows;

pub const SOCKS4_VERSION: u8 = 0x04;
pub const SOCKS5_VERSION: u8 = 0x05;

pub const SOCKS5_AUTH_NONE: u8 = 0x00;
pub const SOCKS5_AUTH_GSSAPI: u8 = 0x01;
pub const SOCKS5_AUTH_PASSWORD: u8 = 0x02;

/// Longest NUL-terminated string scan allowed inside a SOCKS4 probe.
const NUL_SCAN_LIMIT: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksCommand {
    Connect,
    Bind,
}

impl SocksCommand {
    fn from_wire(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Connect),
            0x02 => Some(Self::Bind),
            _ => None,
        }
    }
}

/// Destination address forms a SOCKS client can request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestinationAddr {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Domain(String),
}

impl DestinationAddr {
    pub fn host_string(&self) -> String {
        match self {
            Self::Ipv4(ip) => ip.to_string(),
            Self::Ipv6(ip) => ip.to_string(),
            Self::Domain(name) => name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks4Request {
    pub command: SocksCommand,
    pub port: u16,
    pub ip: Ipv4Addr,
    pub user_id: String,
    /// SOCKS4a trailing hostname, present when the address is `0.0.0.x`.
    pub domain: Option<String>,
}

impl Socks4Request {
    pub fn destination(&self) -> DestinationAddr {
        match &self.domain {
            Some(name) => DestinationAddr::Domain(name.clone()),
            None => DestinationAddr::Ipv4(self.ip),
        }
    }
}

/// Parse a complete SOCKS4/SOCKS4a request occupying the entire buffer.
/// Returns `None` for truncated, malformed, or over-long input.
pub fn parse_socks4_request(buf: &[u8]) -> Option<Socks4Request> {
    if buf.len() < 9 || buf[0] != SOCKS4_VERSION {
        return None;
    }
    let command = SocksCommand::from_wire(buf[1])?;
    let port = u16::from_be_bytes([buf[2], buf[3]]);
    let ip = Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7]);

    let (user_id, after_user) = read_nul_terminated(buf, 8)?;
    let (domain, end) = if socks4a_hostname_follows(ip) {
        let (name, after_name) = read_nul_terminated(buf, after_user)?;
        (Some(name), after_name)
    } else {
        (None, after_user)
    };

    if end != buf.len() {
        return None;
    }

    Some(Socks4Request {
        command,
        port,
        ip,
        user_id,
        domain,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks5Greeting {
    pub methods: Vec<u8>,
}

impl Socks5Greeting {
    pub fn offers(&self, method: u8) -> bool {
        self.methods.contains(&method)
    }
}

/// Parse a SOCKS5 method-negotiation greeting occupying the entire buffer.
/// Every offered method must be one of NO_AUTH, GSSAPI, or PASSWORD.
pub fn parse_socks5_greeting(buf: &[u8]) -> Option<Socks5Greeting> {
    if buf.len() < 2 || buf[0] != SOCKS5_VERSION {
        return None;
    }
    let method_count = buf[1] as usize;
    if method_count == 0 || buf.len() != 2 + method_count {
        return None;
    }
    let methods = &buf[2..];
    if !methods.iter().all(|method| {
        matches!(
            *method,
            SOCKS5_AUTH_NONE | SOCKS5_AUTH_GSSAPI | SOCKS5_AUTH_PASSWORD
        )
    }) {
        return None;
    }
    Some(Socks5Greeting {
        methods: methods.to_vec(),
    })
}

/// Scan for a NUL terminator starting at `start`, bounded by
/// [`NUL_SCAN_LIMIT`]. Returns the decoded string and the offset just past
/// the terminator.
fn read_nul_terminated(buf: &[u8], start: usize) -> Option<(String, usize)> {
    let window_end = buf.len().min(start.checked_add(NUL_SCAN_LIMIT)?);
    let window = buf.get(start..window_end)?;
    let nul_offset = window.iter().position(|byte| *byte == 0x00)?;
    let text = std::str::from_utf8(&window[..nul_offset]).ok()?;
    Some((text.to_string(), start + nul_offset + 1))
}
