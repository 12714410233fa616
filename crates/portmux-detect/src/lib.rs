//! Byte-prefix protocol classification for the unified listener.
//!
//! Every check inspects an accumulated prefix of a connection without
//! consuming it. A check returns a negative verdict for partial or ambiguous
//! input; the caller is expected to retry with more bytes until either a
//! check succeeds or the probe limit is reached, at which point the stream
//! is treated as opaque binary.

use std::net::Ipv4Addr;

mod marker;
mod socks;

pub use marker::{
    parse_proxied_marker, ProxiedTarget, PROXIED_PREFIX, PROXIED_RESPONSE_PREFIX,
    PROXIED_SECURE_PREFIX,
};
pub use socks::{
    parse_socks4_request, parse_socks5_greeting, DestinationAddr, Socks4Request, Socks5Greeting,
    SocksCommand, SOCKS4_VERSION, SOCKS5_AUTH_GSSAPI, SOCKS5_AUTH_NONE, SOCKS5_AUTH_PASSWORD,
    SOCKS5_VERSION,
};

/// Outcome of a successful classification pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolClass {
    Socks4,
    Socks5,
    Tls,
    Http,
    ProxyConnected,
    Binary,
}

impl ProtocolClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Socks4 => "socks4",
            Self::Socks5 => "socks5",
            Self::Tls => "tls",
            Self::Http => "http",
            Self::ProxyConnected => "proxy_connected",
            Self::Binary => "binary",
        }
    }
}

const HTTP_METHOD_TOKENS: &[&[u8]] = &[
    b"GET ",
    b"POST ",
    b"PUT ",
    b"HEAD ",
    b"OPTIONS ",
    b"PATCH ",
    b"DELETE ",
    b"TRACE ",
    b"CONNECT ",
];

/// Run the detection checks in priority order against the accumulated
/// prefix. Returns `None` when no check matched; the caller decides between
/// waiting for more bytes and forcing the binary fallback once the probe
/// limit is exceeded.
pub fn classify(buf: &[u8]) -> Option<ProtocolClass> {
    if buf.is_empty() {
        return None;
    }
    if parse_socks4_request(buf).is_some() {
        return Some(ProtocolClass::Socks4);
    }
    if parse_socks5_greeting(buf).is_some() {
        return Some(ProtocolClass::Socks5);
    }
    if is_tls_record(buf) {
        return Some(ProtocolClass::Tls);
    }
    if is_http_request(buf) {
        return Some(ProtocolClass::Http);
    }
    if is_proxied_marker(buf) {
        return Some(ProtocolClass::ProxyConnected);
    }
    None
}

/// TLS record-header heuristic: handshake content type followed by an
/// SSL3/TLS major version byte.
pub fn is_tls_record(buf: &[u8]) -> bool {
    buf.len() >= 3 && buf[0] == 0x16 && buf[1] == 0x03 && buf[2] <= 0x04
}

/// True when the prefix starts with a known HTTP/1.x method token followed
/// by a space.
pub fn is_http_request(buf: &[u8]) -> bool {
    HTTP_METHOD_TOKENS.iter().any(|token| buf.starts_with(token))
}

/// True when the prefix starts with the internal proxy-connected marker
/// (plain or secure variant).
pub fn is_proxied_marker(buf: &[u8]) -> bool {
    buf.starts_with(PROXIED_SECURE_PREFIX.as_bytes()) || buf.starts_with(PROXIED_PREFIX.as_bytes())
}

pub(crate) fn socks4a_hostname_follows(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    octets[0] == 0 && octets[1] == 0 && octets[2] == 0 && octets[3] != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn socks4_connect_probe() -> Vec<u8> {
        // CONNECT 93.184.216.34:80, user id "abc"
        let mut probe = vec![0x04, 0x01, 0x00, 0x50, 93, 184, 216, 34];
        probe.extend_from_slice(b"abc\0");
        probe
    }

    #[test]
    fn socks4_connect_classifies_as_socks4_only() {
        let probe = socks4_connect_probe();
        assert_eq!(classify(&probe), Some(ProtocolClass::Socks4));
        assert!(parse_socks5_greeting(&probe).is_none());
        assert!(!is_tls_record(&probe));
        assert!(!is_http_request(&probe));
    }

    #[test]
    fn socks4a_probe_requires_trailing_hostname() {
        let mut probe = vec![0x04, 0x01, 0x00, 0x50, 0, 0, 0, 1];
        probe.extend_from_slice(b"abc\0");
        // Hostname not yet terminated: undecidable.
        probe.extend_from_slice(b"example.com");
        assert_eq!(classify(&probe), None);

        probe.push(0x00);
        assert_eq!(classify(&probe), Some(ProtocolClass::Socks4));
        let request = parse_socks4_request(&probe).expect("socks4a request");
        assert_eq!(request.domain.as_deref(), Some("example.com"));
    }

    #[test]
    fn socks4_probe_with_trailing_byte_is_rejected() {
        let mut probe = socks4_connect_probe();
        probe.push(0x00);
        assert!(parse_socks4_request(&probe).is_none());
        assert_eq!(classify(&probe), None);
    }

    #[test]
    fn socks4_unterminated_user_id_beyond_bound_is_rejected() {
        let mut probe = vec![0x04, 0x01, 0x00, 0x50, 93, 184, 216, 34];
        probe.extend_from_slice(&[b'x'; 300]);
        assert!(parse_socks4_request(&probe).is_none());
    }

    #[test]
    fn socks5_greeting_requires_exact_length() {
        let probe = [0x05, 0x02, 0x00, 0x02];
        assert_eq!(classify(&probe), Some(ProtocolClass::Socks5));

        let short = [0x05, 0x02, 0x00];
        assert_eq!(classify(&short), None);

        let long = [0x05, 0x02, 0x00, 0x02, 0x05];
        assert_eq!(classify(&long), None);
    }

    #[test]
    fn socks5_greeting_rejects_unknown_method_codes() {
        let probe = [0x05, 0x01, 0x7f];
        assert!(parse_socks5_greeting(&probe).is_none());
    }

    #[test]
    fn tls_client_hello_prefix_classifies_as_tls() {
        let probe = [0x16, 0x03, 0x01, 0x02, 0x00, 0x01];
        assert_eq!(classify(&probe), Some(ProtocolClass::Tls));
    }

    #[test]
    fn http_methods_classify_as_http() {
        for request in [
            &b"GET / HTTP/1.1\r\n"[..],
            b"POST /api HTTP/1.1\r\n",
            b"CONNECT example.com:443 HTTP/1.1\r\n",
            b"DELETE /thing HTTP/1.0\r\n",
        ] {
            assert_eq!(classify(request), Some(ProtocolClass::Http), "{request:?}");
        }
    }

    #[test]
    fn partial_http_method_is_undecidable() {
        assert_eq!(classify(b"GE"), None);
        assert_eq!(classify(b"CONNECT"), None);
    }

    #[test]
    fn proxied_marker_prefixes_classify_as_proxy_connected() {
        assert_eq!(
            classify(b"PROXIED example.com:443\r\n"),
            Some(ProtocolClass::ProxyConnected)
        );
        assert_eq!(
            classify(b"PROXIED_SECURE example.com:443\r\n"),
            Some(ProtocolClass::ProxyConnected)
        );
        assert_eq!(classify(b"PROXIE"), None);
    }

    #[test]
    fn random_binary_prefix_matches_nothing() {
        assert_eq!(classify(&[0xde, 0xad, 0xbe, 0xef, 0x00, 0x01]), None);
    }
}
