//! TLS contexts for the unified listener: a lazily generated local CA, a
//! per-SNI-host leaf cache for terminating inbound TLS, and client configs
//! for TLS-wrapped outbound legs.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsFailureReason {
    UnknownCa,
    CertValidation,
    HandshakeAlert,
    Timeout,
    EofOrReset,
    Other,
}

impl TlsFailureReason {
    pub fn code(self) -> &'static str {
        match self {
            Self::UnknownCa => "unknown_ca",
            Self::CertValidation => "cert_validation",
            Self::HandshakeAlert => "handshake",
            Self::Timeout => "timeout",
            Self::EofOrReset => "eof_or_reset",
            Self::Other => "other",
        }
    }

    /// Untrusted-CA failures are an expected client-setup condition, not a
    /// server fault; callers log them at a lower severity.
    pub fn is_client_trust_issue(self) -> bool {
        self == Self::UnknownCa
    }
}

pub fn classify_tls_error(error_text: &str) -> TlsFailureReason {
    let lower = error_text.to_ascii_lowercase();

    if contains_any(
        &lower,
        &[
            "unknown ca",
            "unknown_ca",
            "unknown issuer",
            "unknownissuer",
            "self signed",
            "self-signed",
            "unknown authority",
            "unable to get local issuer certificate",
        ],
    ) {
        return TlsFailureReason::UnknownCa;
    }
    if contains_any(
        &lower,
        &["timed out", "timeout", "deadline has elapsed"],
    ) {
        return TlsFailureReason::Timeout;
    }
    if contains_any(
        &lower,
        &[
            "unexpected eof",
            "eof",
            "connection reset",
            "broken pipe",
            "connection aborted",
        ],
    ) {
        return TlsFailureReason::EofOrReset;
    }
    if contains_any(
        &lower,
        &[
            "certificate verify failed",
            "invalid peer certificate",
            "certificate",
            "cert",
            "x509",
            "hostname mismatch",
            "name mismatch",
            "expired",
            "not valid",
        ],
    ) {
        return TlsFailureReason::CertValidation;
    }
    if contains_any(
        &lower,
        &[
            "handshake",
            "alert",
            "protocol version",
            "decrypt error",
            "insufficient security",
        ],
    ) {
        return TlsFailureReason::HandshakeAlert;
    }

    TlsFailureReason::Other
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("certificate generation failed: {0}")]
    CertificateGeneration(#[from] rcgen::Error),
    #[error("TLS config build failed: {0}")]
    ConfigBuild(#[from] rustls::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("certificate store lock poisoned")]
    LockPoisoned,
    #[error("invalid TLS configuration: {0}")]
    InvalidConfiguration(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsContextConfig {
    pub ca_cert_pem_path: Option<String>,
    pub ca_key_pem_path: Option<String>,
    pub ca_common_name: String,
    pub ca_organization: String,
    pub leaf_cert_cache_capacity: usize,
}

impl Default for TlsContextConfig {
    fn default() -> Self {
        Self {
            ca_cert_pem_path: None,
            ca_key_pem_path: None,
            ca_common_name: "portmux Local CA".to_string(),
            ca_organization: "portmux".to_string(),
            leaf_cert_cache_capacity: 1024,
        }
    }
}

impl TlsContextConfig {
    fn validate(&self) -> Result<(), TlsError> {
        if self.ca_cert_pem_path.is_some() != self.ca_key_pem_path.is_some() {
            return Err(TlsError::InvalidConfiguration(
                "ca_cert_pem_path and ca_key_pem_path must either both be set or both be unset"
                    .to_string(),
            ));
        }
        if self.ca_common_name.trim().is_empty() {
            return Err(TlsError::InvalidConfiguration(
                "ca_common_name must not be empty".to_string(),
            ));
        }
        if self.ca_organization.trim().is_empty() {
            return Err(TlsError::InvalidConfiguration(
                "ca_organization must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafCacheStatus {
    Hit,
    Miss,
}

#[derive(Debug, Clone)]
pub struct IssuedServerConfig {
    pub server_config: Arc<ServerConfig>,
    pub cache_status: LeafCacheStatus,
    pub leaf_cert_der: CertificateDer<'static>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContextStoreMetrics {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub leaves_issued: u64,
}

/// Issues and caches per-host server configs, all signed by one process-wide
/// CA. Shared read-mostly across every connection on the listener.
pub struct TlsContextStore {
    config: TlsContextConfig,
    state: Mutex<ContextStoreState>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    leaves_issued: AtomicU64,
}

struct ContextStoreState {
    ca: CaMaterial,
    leaf_cache: HashMap<String, CachedLeaf>,
    cache_lru: VecDeque<String>,
}

struct CachedLeaf {
    server_config: Arc<ServerConfig>,
    leaf_cert_der: CertificateDer<'static>,
}

struct CaMaterial {
    issuer: Issuer<'static, KeyPair>,
    cert_pem: String,
    cert_der: CertificateDer<'static>,
    key_pem: String,
}

impl TlsContextStore {
    pub fn new(config: TlsContextConfig) -> Result<Self, TlsError> {
        config.validate()?;
        let ca = load_or_generate_ca_material(&config)?;
        Ok(Self {
            config,
            state: Mutex::new(ContextStoreState {
                ca,
                leaf_cache: HashMap::new(),
                cache_lru: VecDeque::new(),
            }),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            leaves_issued: AtomicU64::new(0),
        })
    }

    pub fn server_config_for_host(&self, host: &str) -> Result<IssuedServerConfig, TlsError> {
        let normalized_host = normalize_host(host);
        let mut state = self.state.lock().map_err(|_| TlsError::LockPoisoned)?;

        if let Some((server_config, leaf_cert_der)) =
            state.leaf_cache.get(&normalized_host).map(|cached| {
                (
                    Arc::clone(&cached.server_config),
                    cached.leaf_cert_der.clone(),
                )
            })
        {
            touch_lru(&mut state.cache_lru, &normalized_host);
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(IssuedServerConfig {
                server_config,
                cache_status: LeafCacheStatus::Hit,
                leaf_cert_der,
            });
        }

        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        let (server_config, leaf_cert_der) = issue_leaf_server_config(&state.ca, &normalized_host)?;
        self.leaves_issued.fetch_add(1, Ordering::Relaxed);

        if self.config.leaf_cert_cache_capacity > 0 {
            if state.leaf_cache.len() >= self.config.leaf_cert_cache_capacity {
                evict_lru_entry(&mut state);
            }
            state.leaf_cache.insert(
                normalized_host.clone(),
                CachedLeaf {
                    server_config: Arc::clone(&server_config),
                    leaf_cert_der: leaf_cert_der.clone(),
                },
            );
            touch_lru(&mut state.cache_lru, &normalized_host);
        }

        Ok(IssuedServerConfig {
            server_config,
            cache_status: LeafCacheStatus::Miss,
            leaf_cert_der,
        })
    }

    pub fn metrics(&self) -> ContextStoreMetrics {
        ContextStoreMetrics {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            leaves_issued: self.leaves_issued.load(Ordering::Relaxed),
        }
    }

    pub fn ca_certificate_pem(&self) -> Result<String, TlsError> {
        let state = self.state.lock().map_err(|_| TlsError::LockPoisoned)?;
        Ok(state.ca.cert_pem.clone())
    }
}

/// Client config for TLS-wrapped outbound legs. No ALPN is pinned since the
/// protocol inside a tunnel is the client's business.
pub fn build_upstream_client_config(insecure_skip_verify: bool) -> Arc<ClientConfig> {
    let config = if insecure_skip_verify {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureSkipVerifyServerCertVerifier))
            .with_no_client_auth()
    } else {
        let root_store = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth()
    };
    Arc::new(config)
}

fn load_or_generate_ca_material(config: &TlsContextConfig) -> Result<CaMaterial, TlsError> {
    match (&config.ca_cert_pem_path, &config.ca_key_pem_path) {
        (Some(ca_cert_path), Some(ca_key_path)) => {
            let cert_exists = Path::new(ca_cert_path).exists();
            let key_exists = Path::new(ca_key_path).exists();

            match (cert_exists, key_exists) {
                (true, true) => load_ca_material(ca_cert_path, ca_key_path),
                (false, false) => {
                    let generated = generate_ca_material(config)?;
                    persist_ca_material(ca_cert_path, ca_key_path, &generated)?;
                    Ok(generated)
                }
                _ => Err(TlsError::InvalidConfiguration(
                    "CA cert and key files must both exist or both be absent".to_string(),
                )),
            }
        }
        (None, None) => generate_ca_material(config),
        _ => Err(TlsError::InvalidConfiguration(
            "ca_cert_pem_path and ca_key_pem_path must be set together".to_string(),
        )),
    }
}

fn generate_ca_material(config: &TlsContextConfig) -> Result<CaMaterial, TlsError> {
    let ca_key = KeyPair::generate()?;
    let ca_key_pem = ca_key.serialize_pem();

    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.use_authority_key_identifier_extension = true;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
    ];
    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, config.ca_common_name.clone());
    distinguished_name.push(DnType::OrganizationName, config.ca_organization.clone());
    params.distinguished_name = distinguished_name;

    let ca_cert = params.self_signed(&ca_key)?;
    let cert_pem = ca_cert.pem();
    let cert_der = ca_cert.der().clone();
    let issuer = Issuer::new(params, ca_key);

    Ok(CaMaterial {
        issuer,
        cert_pem,
        cert_der,
        key_pem: ca_key_pem,
    })
}

fn load_ca_material(ca_cert_path: &str, ca_key_path: &str) -> Result<CaMaterial, TlsError> {
    let cert_pem = fs::read_to_string(ca_cert_path)?;
    let key_pem = fs::read_to_string(ca_key_path)?;
    let cert_der = CertificateDer::from_pem_slice(cert_pem.as_bytes()).map_err(|error| {
        TlsError::InvalidConfiguration(format!(
            "failed to parse CA certificate PEM from {ca_cert_path}: {error}"
        ))
    })?;
    let ca_key = KeyPair::from_pem(&key_pem)?;
    let issuer = Issuer::from_ca_cert_der(&cert_der, ca_key).map_err(|error| {
        TlsError::InvalidConfiguration(format!(
            "failed to parse issuer metadata from CA certificate {ca_cert_path}: {error}"
        ))
    })?;

    Ok(CaMaterial {
        issuer,
        cert_pem,
        cert_der,
        key_pem,
    })
}

fn persist_ca_material(
    ca_cert_path: &str,
    ca_key_path: &str,
    ca: &CaMaterial,
) -> Result<(), TlsError> {
    ensure_parent_exists(ca_cert_path)?;
    ensure_parent_exists(ca_key_path)?;
    fs::write(ca_cert_path, ca.cert_pem.as_bytes())?;
    fs::write(ca_key_path, ca.key_pem.as_bytes())?;
    Ok(())
}

fn ensure_parent_exists(path: &str) -> Result<(), TlsError> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

fn issue_leaf_server_config(
    ca: &CaMaterial,
    host: &str,
) -> Result<(Arc<ServerConfig>, CertificateDer<'static>), TlsError> {
    let mut params = CertificateParams::new(Vec::<String>::new())?;
    params.use_authority_key_identifier_extension = true;
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, host.to_string());
    params.distinguished_name = distinguished_name;

    if let Ok(ip) = host.parse::<IpAddr>() {
        params.subject_alt_names.push(SanType::IpAddress(ip));
    } else {
        params
            .subject_alt_names
            .push(SanType::DnsName(host.try_into()?));
    }

    let leaf_key = KeyPair::generate()?;
    let leaf_key_der = PrivatePkcs8KeyDer::from(leaf_key.serialize_der());
    let leaf_cert = params.signed_by(&leaf_key, &ca.issuer)?;
    let leaf_cert_der = leaf_cert.der().clone();

    let chain = vec![leaf_cert_der.clone(), ca.cert_der.clone()];
    let server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, PrivateKeyDer::from(leaf_key_der))?;

    Ok((Arc::new(server_config), leaf_cert_der))
}

fn normalize_host(host: &str) -> String {
    match host.parse::<IpAddr>() {
        Ok(_) => host.to_string(),
        Err(_) => host.to_ascii_lowercase(),
    }
}

fn touch_lru(lru: &mut VecDeque<String>, key: &str) {
    if let Some(position) = lru.iter().position(|entry| entry == key) {
        lru.remove(position);
    }
    lru.push_back(key.to_string());
}

fn evict_lru_entry(state: &mut ContextStoreState) {
    if let Some(oldest) = state.cache_lru.pop_front() {
        state.leaf_cache.remove(&oldest);
    }
}

#[derive(Debug)]
struct InsecureSkipVerifyServerCertVerifier;

impl ServerCertVerifier for InsecureSkipVerifyServerCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
        ]
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::time::{SystemTime, UNIX_EPOCH};

    use x509_parser::extensions::GeneralName;
    use x509_parser::parse_x509_certificate;

    use super::{
        build_upstream_client_config, classify_tls_error, ContextStoreMetrics, LeafCacheStatus,
        TlsContextConfig, TlsContextStore, TlsFailureReason,
    };

    #[test]
    fn classifies_common_handshake_failures() {
        assert_eq!(
            classify_tls_error("certificate verify failed: unknown ca"),
            TlsFailureReason::UnknownCa
        );
        assert_eq!(
            classify_tls_error("deadline has elapsed"),
            TlsFailureReason::Timeout
        );
        assert_eq!(
            classify_tls_error("connection reset by peer"),
            TlsFailureReason::EofOrReset
        );
        assert_eq!(
            classify_tls_error("invalid peer certificate: Expired"),
            TlsFailureReason::CertValidation
        );
        assert_eq!(
            classify_tls_error("received fatal alert: decrypt error"),
            TlsFailureReason::HandshakeAlert
        );
        assert_eq!(
            classify_tls_error("some unrelated network error"),
            TlsFailureReason::Other
        );
    }

    #[test]
    fn unknown_ca_is_a_client_trust_issue() {
        assert!(TlsFailureReason::UnknownCa.is_client_trust_issue());
        assert!(!TlsFailureReason::HandshakeAlert.is_client_trust_issue());
    }

    #[test]
    fn context_store_caches_per_host_configs() {
        let store = TlsContextStore::new(TlsContextConfig::default()).expect("context store");

        let first = store
            .server_config_for_host("api.example.com")
            .expect("first leaf");
        assert_eq!(first.cache_status, LeafCacheStatus::Miss);

        let second = store
            .server_config_for_host("API.example.com")
            .expect("second leaf");
        assert_eq!(second.cache_status, LeafCacheStatus::Hit);
        assert!(Arc::ptr_eq(&first.server_config, &second.server_config));

        assert_eq!(
            store.metrics(),
            ContextStoreMetrics {
                cache_hits: 1,
                cache_misses: 1,
                leaves_issued: 1,
            }
        );
    }

    #[test]
    fn context_store_with_zero_capacity_never_hits_cache() {
        let config = TlsContextConfig {
            leaf_cert_cache_capacity: 0,
            ..TlsContextConfig::default()
        };
        let store = TlsContextStore::new(config).expect("context store");

        let first = store
            .server_config_for_host("api.example.com")
            .expect("first leaf");
        let second = store
            .server_config_for_host("api.example.com")
            .expect("second leaf");
        assert_eq!(first.cache_status, LeafCacheStatus::Miss);
        assert_eq!(second.cache_status, LeafCacheStatus::Miss);
    }

    #[test]
    fn leaf_san_covers_dns_names_and_ips() {
        let store = TlsContextStore::new(TlsContextConfig::default()).expect("context store");

        let domain = store
            .server_config_for_host("backend.example.com")
            .expect("domain leaf");
        assert_leaf_dns_name(&domain.leaf_cert_der, "backend.example.com");

        let ip = store.server_config_for_host("127.0.0.1").expect("ip leaf");
        assert_leaf_ip(&ip.leaf_cert_der, [127, 0, 0, 1]);
    }

    #[test]
    fn context_store_loads_existing_ca_from_disk() {
        let temp_dir = unique_temp_dir("portmux-ca-load");
        fs::create_dir_all(&temp_dir).expect("create temp dir");
        let config = TlsContextConfig {
            ca_cert_pem_path: Some(path_to_string(&temp_dir.join("ca-cert.pem"))),
            ca_key_pem_path: Some(path_to_string(&temp_dir.join("ca-key.pem"))),
            ..TlsContextConfig::default()
        };

        let first_store = TlsContextStore::new(config.clone()).expect("first store");
        let first_ca = first_store.ca_certificate_pem().expect("first ca");
        drop(first_store);

        let second_store = TlsContextStore::new(config).expect("second store");
        let second_ca = second_store.ca_certificate_pem().expect("second ca");
        assert_eq!(first_ca, second_ca);

        fs::remove_dir_all(&temp_dir).expect("cleanup temp dir");
    }

    #[test]
    fn context_store_rejects_partial_ca_path_configuration() {
        let config = TlsContextConfig {
            ca_cert_pem_path: Some("/tmp/portmux-only-cert.pem".to_string()),
            ca_key_pem_path: None,
            ..TlsContextConfig::default()
        };
        let error = match TlsContextStore::new(config) {
            Ok(_) => panic!("partial CA path configuration unexpectedly succeeded"),
            Err(error) => error,
        };
        assert!(
            error
                .to_string()
                .contains("must either both be set or both be unset"),
            "{error}"
        );
    }

    #[test]
    fn builds_client_configs_for_secure_and_insecure_modes() {
        let secure = build_upstream_client_config(false);
        let insecure = build_upstream_client_config(true);
        assert!(secure.alpn_protocols.is_empty());
        assert!(insecure.alpn_protocols.is_empty());
    }

    fn assert_leaf_dns_name(cert_der: &rustls::pki_types::CertificateDer<'static>, expected: &str) {
        let (_, cert) = parse_x509_certificate(cert_der.as_ref()).expect("parse x509");
        let san = cert
            .subject_alternative_name()
            .expect("san extension parse")
            .expect("san extension present");
        let found = san
            .value
            .general_names
            .iter()
            .any(|name| matches!(name, GeneralName::DNSName(value) if *value == expected));
        assert!(found, "expected SAN DNSName {expected}");
    }

    fn assert_leaf_ip(cert_der: &rustls::pki_types::CertificateDer<'static>, expected: [u8; 4]) {
        let (_, cert) = parse_x509_certificate(cert_der.as_ref()).expect("parse x509");
        let san = cert
            .subject_alternative_name()
            .expect("san extension parse")
            .expect("san extension present");
        let found = san
            .value
            .general_names
            .iter()
            .any(|name| matches!(name, GeneralName::IPAddress(value) if *value == expected));
        assert!(found, "expected SAN IPAddress {expected:?}");
    }

    fn unique_temp_dir(prefix: &str) -> PathBuf {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).expect("clock");
        std::env::temp_dir().join(format!(
            "{prefix}-{}-{}",
            std::process::id(),
            now.as_nanos()
        ))
    }

    fn path_to_string(path: &Path) -> String {
        path.to_string_lossy().to_string()
    }
}
