//! Local bind-address alias cache.
//!
//! Each listening address maps to the set of hostnames and IP literals that
//! name this process, so the HTTP stage can recognize destinations that
//! would loop straight back into the listener. An entry is computed once per
//! unique local address and kept for the process lifetime; recomputation
//! yields the same set, so concurrent first lookups are harmless.

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;

#[derive(Debug, Default)]
pub struct PortBindingCache {
    entries: DashMap<SocketAddr, Arc<Vec<String>>>,
}

impl PortBindingCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hostnames and IP literals treated as local for the given listening
    /// address, lowercased and without ports.
    pub fn aliases(&self, local: SocketAddr) -> Arc<Vec<String>> {
        if let Some(entry) = self.entries.get(&local) {
            return Arc::clone(entry.value());
        }
        let computed = Arc::new(compute_aliases(local));
        self.entries.insert(local, Arc::clone(&computed));
        computed
    }

    /// True when `host:port` names the listening address itself.
    pub fn is_local_destination(&self, local: SocketAddr, host: &str, port: u16) -> bool {
        if port != local.port() {
            return false;
        }
        let host = host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_ascii_lowercase();
        self.aliases(local).iter().any(|alias| *alias == host)
    }
}

fn compute_aliases(local: SocketAddr) -> Vec<String> {
    let mut aliases = vec![local.ip().to_string(), "localhost".to_string()];
    if local.ip().is_loopback() || local.ip().is_unspecified() {
        aliases.push("127.0.0.1".to_string());
        aliases.push("::1".to_string());
    }
    aliases.sort();
    aliases.dedup();
    aliases
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().expect("socket addr")
    }

    #[test]
    fn loopback_listener_gets_the_loopback_aliases() {
        let cache = PortBindingCache::new();
        let aliases = cache.aliases(loopback(1080));
        assert!(aliases.iter().any(|alias| alias == "localhost"));
        assert!(aliases.iter().any(|alias| alias == "127.0.0.1"));
        assert!(aliases.iter().any(|alias| alias == "::1"));
    }

    #[test]
    fn entry_is_computed_once_per_local_address() {
        let cache = PortBindingCache::new();
        let first = cache.aliases(loopback(1080));
        let second = cache.aliases(loopback(1080));
        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &cache.aliases(loopback(1081))));
    }

    #[test]
    fn local_destination_requires_matching_port() {
        let cache = PortBindingCache::new();
        let local = loopback(1080);
        assert!(cache.is_local_destination(local, "localhost", 1080));
        assert!(cache.is_local_destination(local, "127.0.0.1", 1080));
        assert!(cache.is_local_destination(local, "[::1]", 1080));
        assert!(!cache.is_local_destination(local, "localhost", 1081));
        assert!(!cache.is_local_destination(local, "example.com", 1080));
    }
}
