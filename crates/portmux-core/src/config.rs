use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSinkKind {
    Queue,
    File,
}

impl Default for EventSinkKind {
    fn default() -> Self {
        Self::Queue
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EventSinkConfig {
    pub kind: EventSinkKind,
    pub path: Option<String>,
}

impl Default for EventSinkConfig {
    fn default() -> Self {
        Self {
            kind: EventSinkKind::Queue,
            path: None,
        }
    }
}

impl EventSinkConfig {
    pub fn validate(&self) -> Result<(), PortmuxConfigError> {
        match self.kind {
            EventSinkKind::Queue => Ok(()),
            EventSinkKind::File => match self.path.as_deref() {
                Some(path) if !path.trim().is_empty() => Ok(()),
                _ => Err(PortmuxConfigError::MissingEventSinkPath),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SocksCredentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteEndpoint {
    pub host: String,
    pub port: u16,
}

impl RemoteEndpoint {
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PortmuxConfig {
    pub listen_addr: String,
    pub listen_port: u16,
    /// Accumulated-prefix ceiling for detection. A connection whose prefix
    /// grows past this without classifying is forced to binary.
    pub max_probe_bytes: usize,
    pub relay_buffer_bytes: usize,
    pub connect_timeout_ms: u64,
    pub binary_exchange_timeout_ms: u64,
    pub max_concurrent_flows: usize,
    pub max_flow_event_backlog: usize,
    /// When set, plaintext HTTP requests are refused with 426 Upgrade
    /// Required instead of being served.
    pub tls_required_for_http: bool,
    pub socks_credentials: Option<SocksCredentials>,
    /// Fixed upstream for opaque binary streams. Without one, unclassified
    /// traffic gets the fixed unknown-format reply.
    pub binary_remote: Option<RemoteEndpoint>,
    pub ca_cert_pem_path: Option<String>,
    pub ca_key_pem_path: Option<String>,
    pub ca_common_name: String,
    pub ca_organization: String,
    pub leaf_cert_cache_capacity: usize,
    pub upstream_tls_insecure_skip_verify: bool,
    pub event_sink: EventSinkConfig,
}

impl Default for PortmuxConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1".to_string(),
            listen_port: 1080,
            max_probe_bytes: 16 * 1024,
            relay_buffer_bytes: 1024 * 1024,
            connect_timeout_ms: 10_000,
            binary_exchange_timeout_ms: 5_000,
            max_concurrent_flows: 2048,
            max_flow_event_backlog: 8 * 1024,
            tls_required_for_http: false,
            socks_credentials: None,
            binary_remote: None,
            ca_cert_pem_path: None,
            ca_key_pem_path: None,
            ca_common_name: "portmux Local CA".to_string(),
            ca_organization: "portmux".to_string(),
            leaf_cert_cache_capacity: 1024,
            upstream_tls_insecure_skip_verify: false,
            event_sink: EventSinkConfig::default(),
        }
    }
}

impl PortmuxConfig {
    pub fn validate(&self) -> Result<(), PortmuxConfigError> {
        if self.listen_addr.trim().is_empty() {
            return Err(PortmuxConfigError::EmptyListenAddr);
        }
        if self.max_probe_bytes == 0 {
            return Err(PortmuxConfigError::ZeroValue("max_probe_bytes"));
        }
        if self.connect_timeout_ms == 0 {
            return Err(PortmuxConfigError::ZeroValue("connect_timeout_ms"));
        }
        if self.binary_exchange_timeout_ms == 0 {
            return Err(PortmuxConfigError::ZeroValue("binary_exchange_timeout_ms"));
        }
        if self.max_concurrent_flows == 0 {
            return Err(PortmuxConfigError::ZeroValue("max_concurrent_flows"));
        }
        if self.max_flow_event_backlog == 0 {
            return Err(PortmuxConfigError::ZeroValue("max_flow_event_backlog"));
        }
        if self.leaf_cert_cache_capacity == 0 {
            return Err(PortmuxConfigError::ZeroValue("leaf_cert_cache_capacity"));
        }
        if self.ca_cert_pem_path.is_some() != self.ca_key_pem_path.is_some() {
            return Err(PortmuxConfigError::InvalidCaPathPair);
        }
        if self.ca_common_name.trim().is_empty() {
            return Err(PortmuxConfigError::EmptyCaCommonName);
        }
        if self.ca_organization.trim().is_empty() {
            return Err(PortmuxConfigError::EmptyCaOrganization);
        }
        if let Some(credentials) = &self.socks_credentials {
            if credentials.username.is_empty() {
                return Err(PortmuxConfigError::EmptySocksUsername);
            }
        }
        if let Some(remote) = &self.binary_remote {
            if remote.host.trim().is_empty() {
                return Err(PortmuxConfigError::EmptyRemoteHost {
                    field: "binary_remote",
                });
            }
            if remote.port == 0 {
                return Err(PortmuxConfigError::ZeroRemotePort {
                    field: "binary_remote",
                });
            }
        }
        self.event_sink.validate()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PortmuxConfigError {
    #[error("listen_addr must not be empty")]
    EmptyListenAddr,
    #[error("{0} must be greater than zero")]
    ZeroValue(&'static str),
    #[error("ca_cert_pem_path and ca_key_pem_path must be provided together")]
    InvalidCaPathPair,
    #[error("ca_common_name must not be empty")]
    EmptyCaCommonName,
    #[error("ca_organization must not be empty")]
    EmptyCaOrganization,
    #[error("socks_credentials.username must not be empty")]
    EmptySocksUsername,
    #[error("{field}.host must not be empty")]
    EmptyRemoteHost { field: &'static str },
    #[error("{field}.port must be greater than zero")]
    ZeroRemotePort { field: &'static str },
    #[error("event_sink.path is required for event_sink kind file")]
    MissingEventSinkPath,
}
