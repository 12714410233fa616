//! Internal proxy-connected marker used for same-process chaining.
//!
//! Wire format: an ASCII literal prefix, a `host:port` target, and a CRLF
//! terminator. The secure variant signals that the forwarded tunnel must be
//! TLS-wrapped on the outbound leg.

pub const PROXIED_PREFIX: &str = "PROXIED ";
pub const PROXIED_SECURE_PREFIX: &str = "PROXIED_SECURE ";
pub const PROXIED_RESPONSE_PREFIX: &str = "PROXIED_RESPONSE ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxiedTarget {
    pub host: String,
    pub port: u16,
    pub secure: bool,
}

/// Parse a full marker line (without the CRLF terminator) into its target.
pub fn parse_proxied_marker(line: &str) -> Option<ProxiedTarget> {
    let (payload, secure) = if let Some(rest) = line.strip_prefix(PROXIED_SECURE_PREFIX) {
        (rest, true)
    } else if let Some(rest) = line.strip_prefix(PROXIED_PREFIX) {
        (rest, false)
    } else {
        return None;
    };

    let (host, port_text) = payload.trim().rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    let port = port_text.parse::<u16>().ok()?;
    Some(ProxiedTarget {
        host: host.to_string(),
        port,
        secure,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_marker_parses_host_and_port() {
        let target = parse_proxied_marker("PROXIED backend.local:8443").expect("marker");
        assert_eq!(target.host, "backend.local");
        assert_eq!(target.port, 8443);
        assert!(!target.secure);
    }

    #[test]
    fn secure_marker_sets_secure_flag() {
        let target = parse_proxied_marker("PROXIED_SECURE 10.1.2.3:443").expect("marker");
        assert_eq!(target.host, "10.1.2.3");
        assert_eq!(target.port, 443);
        assert!(target.secure);
    }

    #[test]
    fn marker_without_port_is_rejected() {
        assert!(parse_proxied_marker("PROXIED backend.local").is_none());
        assert!(parse_proxied_marker("PROXIED :443").is_none());
        assert!(parse_proxied_marker("NOT_A_MARKER x:1").is_none());
    }
}
