//! Unified-port listener.
//!
//! One TCP port accepts SOCKS4/4a, SOCKS5, TLS, HTTP, the internal
//! proxy-connected marker, and opaque binary traffic. Detection sniffs an
//! accumulated prefix without consuming it; a TLS match terminates the
//! session against a locally-issued certificate and re-runs detection on the
//! decrypted bytes. Every other match dispatches to its protocol runner,
//! which either answers directly or hands both sockets to the relay.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::BytesMut;
use dashmap::DashMap;
use portmux_core::{MuxEngine, PortmuxConfig, PortmuxConfigError};
use portmux_detect::{classify, parse_socks4_request, parse_socks5_greeting, ProtocolClass};
use portmux_observe::{Event, EventSink, EventType, FlowContext, WireProtocol};
use portmux_tls::{
    build_upstream_client_config, classify_tls_error, LeafCacheStatus, TlsContextConfig,
    TlsContextStore, TlsError,
};
use rustls::ClientConfig;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::LazyConfigAcceptor;

mod bindings;
mod connect;
mod http;
mod passthrough;
mod proxied;
mod relay;
mod socks;

pub use bindings::PortBindingCache;
pub use connect::{AckFormat, Destination};
pub use http::{HttpResponder, NotFoundResponder};
pub use relay::{
    IdentityInterceptor, Interceptor, RelayAction, RelayBuffer, RelayDirection,
    RelayDirectionStats,
};

use connect::establish_tunnel;
use http::HttpOutcome;

pub trait StreamIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> StreamIo for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedStream = Box<dyn StreamIo>;

#[derive(Debug, Error)]
pub enum ServerInitError {
    #[error("invalid configuration: {0}")]
    Config(#[from] PortmuxConfigError),
    #[error("TLS context initialization failed: {0}")]
    Tls(#[from] TlsError),
}

/// Outcome of one sniffing pass over a stream.
enum Classified {
    Protocol(ProtocolClass),
    /// The probe budget ran out, or the peer closed mid-probe.
    ForcedBinary,
    /// The peer closed before sending anything.
    PeerClosed,
}

pub struct MuxServer<S>
where
    S: EventSink,
{
    engine: Arc<MuxEngine<S>>,
    tls_contexts: Arc<TlsContextStore>,
    upstream_tls_config: Arc<ClientConfig>,
    interceptor: Arc<dyn Interceptor>,
    responder: Arc<dyn HttpResponder>,
    active_flows: Arc<DashMap<u64, String>>,
    bindings: Arc<PortBindingCache>,
}

impl<S> MuxServer<S>
where
    S: EventSink + 'static,
{
    pub fn new(config: PortmuxConfig, sink: S) -> Result<Self, ServerInitError> {
        let tls_config = TlsContextConfig {
            ca_cert_pem_path: config.ca_cert_pem_path.clone(),
            ca_key_pem_path: config.ca_key_pem_path.clone(),
            ca_common_name: config.ca_common_name.clone(),
            ca_organization: config.ca_organization.clone(),
            leaf_cert_cache_capacity: config.leaf_cert_cache_capacity,
        };
        let upstream_tls_config =
            build_upstream_client_config(config.upstream_tls_insecure_skip_verify);
        let engine = Arc::new(MuxEngine::new(config, sink)?);
        Ok(Self {
            engine,
            tls_contexts: Arc::new(TlsContextStore::new(tls_config)?),
            upstream_tls_config,
            interceptor: Arc::new(IdentityInterceptor),
            responder: Arc::new(NotFoundResponder),
            active_flows: Arc::new(DashMap::new()),
            bindings: Arc::new(PortBindingCache::new()),
        })
    }

    pub fn with_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptor = interceptor;
        self
    }

    pub fn with_responder(mut self, responder: Arc<dyn HttpResponder>) -> Self {
        self.responder = responder;
        self
    }

    pub fn engine(&self) -> &MuxEngine<S> {
        &self.engine
    }

    pub fn ca_certificate_pem(&self) -> Result<String, TlsError> {
        self.tls_contexts.ca_certificate_pem()
    }

    pub async fn bind_listener(&self) -> io::Result<TcpListener> {
        let config = &self.engine.config;
        TcpListener::bind((config.listen_addr.as_str(), config.listen_port)).await
    }

    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let listener = self.bind_listener().await?;
        self.run_with_listener(listener).await
    }

    pub async fn run_with_listener(self: Arc<Self>, listener: TcpListener) -> io::Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(error) = server.handle_client(stream, peer).await {
                    eprintln!("portmux: connection from {peer} failed: {error}");
                }
            });
        }
    }

    async fn handle_client(&self, stream: TcpStream, peer: SocketAddr) -> io::Result<()> {
        if self.active_flows.len() >= self.engine.config.max_concurrent_flows {
            eprintln!("portmux: refusing {peer}: flow limit reached");
            return Ok(());
        }

        let local_addr = stream.local_addr()?;
        let flow_id = self.engine.allocate_flow_id();
        self.active_flows.insert(flow_id, peer.to_string());
        let _guard = FlowGuard {
            flows: Arc::clone(&self.active_flows),
            flow_id,
        };

        let mut context = FlowContext {
            flow_id,
            client_addr: peer.to_string(),
            server_host: String::new(),
            server_port: 0,
            protocol: WireProtocol::Undetermined,
        };
        self.engine
            .emit_event(Event::new(EventType::ConnectionAccepted, context.clone()));

        // The close event is owed however the flow ends, including on an
        // I/O error escaping a handshake.
        match self
            .drive_flow(&mut context, Box::new(stream), local_addr)
            .await
        {
            Ok(reason) => {
                self.engine.emit_event(
                    Event::new(EventType::StreamClosed, context.clone())
                        .with_attribute("reason", reason),
                );
                Ok(())
            }
            Err(error) => {
                self.engine.emit_event(
                    Event::new(EventType::StreamClosed, context.clone())
                        .with_attribute("reason", "io_error")
                        .with_attribute("error", error.to_string()),
                );
                Err(error)
            }
        }
    }

    /// Sniff, terminate TLS as many times as warranted, and dispatch to the
    /// classified protocol's runner. Returns the close reason.
    async fn drive_flow(
        &self,
        context: &mut FlowContext,
        mut client: BoxedStream,
        local_addr: SocketAddr,
    ) -> io::Result<&'static str> {
        let mut upstream_tls = false;
        let mut downstream_tls = false;
        let mut tls_passes: u8 = 0;

        loop {
            let mut probe = BytesMut::with_capacity(1024);
            let classified = self.sniff(&mut client, &mut probe).await?;

            let class = match classified {
                Classified::Protocol(class) => class,
                Classified::ForcedBinary => ProtocolClass::Binary,
                Classified::PeerClosed => return Ok("empty_stream"),
            };

            // A TLS record inside an already-terminated session is someone
            // else's TLS; tunnelling it again would loop.
            let class = if class == ProtocolClass::Tls && tls_passes > 0 {
                ProtocolClass::Binary
            } else {
                class
            };

            if class == ProtocolClass::Tls {
                context.protocol = WireProtocol::Tls;
                self.engine.emit_event(
                    Event::new(EventType::ProtocolDetected, context.clone())
                        .with_attribute("protocol", WireProtocol::Tls.as_str()),
                );
                match self.terminate_tls(context, client, probe.to_vec()).await? {
                    Some(tls_stream) => {
                        client = tls_stream;
                        upstream_tls = true;
                        downstream_tls = true;
                        tls_passes += 1;
                        continue;
                    }
                    None => return Ok("tls_handshake_failed"),
                }
            }

            self.dispatch(
                context,
                client,
                probe.to_vec(),
                class,
                upstream_tls,
                downstream_tls,
                local_addr,
            )
            .await?;
            return Ok("completed");
        }
    }

    /// Grow the probe until a classification check matches or the budget is
    /// exhausted. The probe keeps every byte read, so nothing is lost to
    /// detection.
    async fn sniff(
        &self,
        client: &mut BoxedStream,
        probe: &mut BytesMut,
    ) -> io::Result<Classified> {
        let max_probe_bytes = self.engine.config.max_probe_bytes;
        loop {
            if let Some(class) = classify(probe) {
                return Ok(Classified::Protocol(class));
            }
            if probe.len() >= max_probe_bytes {
                return Ok(Classified::ForcedBinary);
            }
            let read = client.read_buf(probe).await?;
            if read == 0 {
                return Ok(if probe.is_empty() {
                    Classified::PeerClosed
                } else {
                    Classified::ForcedBinary
                });
            }
        }
    }

    /// Terminate TLS against a certificate issued for the SNI host. The
    /// already-sniffed bytes are replayed ahead of the socket so the acceptor
    /// sees the complete ClientHello.
    async fn terminate_tls(
        &self,
        context: &mut FlowContext,
        client: BoxedStream,
        replay: Vec<u8>,
    ) -> io::Result<Option<BoxedStream>> {
        self.engine
            .emit_event(Event::new(EventType::TlsHandshakeStarted, context.clone()));

        let handshake_timeout = Duration::from_millis(self.engine.config.connect_timeout_ms);
        let acceptor = LazyConfigAcceptor::new(
            rustls::server::Acceptor::default(),
            ReplayStream::new(replay, client),
        );

        let start = match tokio::time::timeout(handshake_timeout, acceptor).await {
            Ok(Ok(start)) => start,
            Ok(Err(error)) => {
                self.report_tls_failure(context, &error.to_string());
                return Ok(None);
            }
            Err(_) => {
                self.report_tls_failure(context, "handshake timed out");
                return Ok(None);
            }
        };

        let sni_host = start
            .client_hello()
            .server_name()
            .map(str::to_string)
            .unwrap_or_else(|| self.engine.config.listen_addr.clone());
        let issued = match self.tls_contexts.server_config_for_host(&sni_host) {
            Ok(issued) => issued,
            Err(error) => {
                self.report_tls_failure(context, &error.to_string());
                return Ok(None);
            }
        };

        let accepted = tokio::time::timeout(handshake_timeout, start.into_stream(issued.server_config)).await;
        let tls_stream = match accepted {
            Ok(Ok(stream)) => stream,
            Ok(Err(error)) => {
                self.report_tls_failure(context, &error.to_string());
                return Ok(None);
            }
            Err(_) => {
                self.report_tls_failure(context, "handshake timed out");
                return Ok(None);
            }
        };

        context.server_host = sni_host.clone();
        self.engine.emit_event(
            Event::new(EventType::TlsHandshakeSucceeded, context.clone())
                .with_attribute("sni", sni_host)
                .with_attribute(
                    "leaf_cache",
                    match issued.cache_status {
                        LeafCacheStatus::Hit => "hit",
                        LeafCacheStatus::Miss => "miss",
                    },
                ),
        );
        Ok(Some(Box::new(tls_stream)))
    }

    fn report_tls_failure(&self, context: &FlowContext, error_text: &str) {
        let reason = classify_tls_error(error_text);
        if !reason.is_client_trust_issue() {
            eprintln!(
                "portmux: flow {} TLS handshake failed ({}): {error_text}",
                context.flow_id,
                reason.code()
            );
        }
        self.engine.emit_event(
            Event::new(EventType::TlsHandshakeFailed, context.clone())
                .with_attribute("reason", reason.code())
                .with_attribute("error", error_text),
        );
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch(
        &self,
        context: &mut FlowContext,
        mut client: BoxedStream,
        probe: Vec<u8>,
        class: ProtocolClass,
        upstream_tls: bool,
        downstream_tls: bool,
        local_addr: SocketAddr,
    ) -> io::Result<()> {
        match class {
            ProtocolClass::Socks4 => {
                let Some(request) = parse_socks4_request(&probe) else {
                    return self.dispatch_binary(context, &mut client, probe).await;
                };
                context.protocol = WireProtocol::Socks4;
                self.emit_detected(context);
                let handshake = socks::run_socks4(&self.engine, context, &mut client, &request).await?;
                if let Some((destination, ack)) = handshake {
                    self.tunnel(context, client, Vec::new(), destination, ack, upstream_tls)
                        .await?;
                }
                Ok(())
            }
            ProtocolClass::Socks5 => {
                let Some(greeting) = parse_socks5_greeting(&probe) else {
                    return self.dispatch_binary(context, &mut client, probe).await;
                };
                context.protocol = WireProtocol::Socks5;
                self.emit_detected(context);
                let handshake = socks::run_socks5(
                    &self.engine,
                    context,
                    &mut client,
                    &greeting,
                    self.engine.config.socks_credentials.as_ref(),
                )
                .await?;
                if let Some((destination, ack)) = handshake {
                    self.tunnel(context, client, Vec::new(), destination, ack, upstream_tls)
                        .await?;
                }
                Ok(())
            }
            ProtocolClass::ProxyConnected => {
                context.protocol = WireProtocol::ProxyConnected;
                self.emit_detected(context);
                let handoff = proxied::run_proxied(&self.engine, context, &mut client, probe).await?;
                if let Some((destination, ack, leftover)) = handoff {
                    self.tunnel(context, client, leftover, destination, ack, upstream_tls)
                        .await?;
                }
                Ok(())
            }
            ProtocolClass::Http => {
                context.protocol = WireProtocol::Http;
                self.emit_detected(context);
                let outcome = http::run_http(
                    &self.engine,
                    context,
                    &mut client,
                    probe,
                    downstream_tls,
                    self.responder.as_ref(),
                    &self.bindings,
                    local_addr,
                )
                .await?;
                if let HttpOutcome::Tunnel {
                    destination,
                    ack,
                    leftover,
                } = outcome
                {
                    self.tunnel(context, client, leftover, destination, ack, upstream_tls)
                        .await?;
                }
                Ok(())
            }
            ProtocolClass::Binary => self.dispatch_binary(context, &mut client, probe).await,
            // classify never yields Tls here; handle_client terminates it
            // before dispatch.
            ProtocolClass::Tls => self.dispatch_binary(context, &mut client, probe).await,
        }
    }

    async fn dispatch_binary(
        &self,
        context: &mut FlowContext,
        client: &mut BoxedStream,
        probe: Vec<u8>,
    ) -> io::Result<()> {
        context.protocol = WireProtocol::Binary;
        self.emit_detected(context);
        passthrough::run_binary(&self.engine, context, client, probe).await
    }

    async fn tunnel(
        &self,
        context: &mut FlowContext,
        client: BoxedStream,
        client_leftover: Vec<u8>,
        destination: Destination,
        ack: AckFormat,
        upstream_tls: bool,
    ) -> io::Result<()> {
        context.server_host = destination.addr.host_string();
        context.server_port = destination.port;
        establish_tunnel(
            &self.engine,
            context,
            client,
            client_leftover,
            &destination,
            ack,
            upstream_tls,
            Arc::clone(&self.upstream_tls_config),
            Arc::clone(&self.interceptor),
        )
        .await
    }

    fn emit_detected(&self, context: &FlowContext) {
        self.engine.emit_event(
            Event::new(EventType::ProtocolDetected, context.clone())
                .with_attribute("protocol", context.protocol.as_str()),
        );
    }
}

struct FlowGuard {
    flows: Arc<DashMap<u64, String>>,
    flow_id: u64,
}

impl Drop for FlowGuard {
    fn drop(&mut self) {
        self.flows.remove(&self.flow_id);
    }
}

/// Serves an already-read prefix ahead of the wrapped stream. Writes pass
/// straight through.
pub(crate) struct ReplayStream<S> {
    prefix: Vec<u8>,
    position: usize,
    inner: S,
}

impl<S> ReplayStream<S> {
    pub(crate) fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            position: 0,
            inner,
        }
    }
}

impl<S> AsyncRead for ReplayStream<S>
where
    S: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.position < this.prefix.len() {
            let available = &this.prefix[this.position..];
            let take = available.len().min(buf.remaining());
            buf.put_slice(&available[..take]);
            this.position += take;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S> AsyncWrite for ReplayStream<S>
where
    S: AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn replay_stream_serves_prefix_before_socket_bytes() {
        let (near, mut far) = tokio::io::duplex(256);
        far.write_all(b" world").await.expect("socket bytes");
        far.shutdown().await.expect("close");

        let mut replay = ReplayStream::new(b"hello".to_vec(), near);
        let mut out = Vec::new();
        replay.read_to_end(&mut out).await.expect("read all");
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn replay_stream_writes_reach_the_inner_stream() {
        let (near, mut far) = tokio::io::duplex(256);
        let mut replay = ReplayStream::new(Vec::new(), near);
        replay.write_all(b"ping").await.expect("write");
        replay.shutdown().await.expect("shutdown");

        let mut out = Vec::new();
        far.read_to_end(&mut out).await.expect("read");
        assert_eq!(out, b"ping");
    }
}
