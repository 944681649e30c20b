//! CONNECT interception
//!
//! A tunnel moves through these states:
//!
//! ```text
//! Hijacking → TunnelAck → ClientHandshake → RequestDecode → OriginDial
//!           → RequestReplay → Relay → Closed
//! ```
//!
//! Only `Hijacking` can still answer through HTTP framing. From
//! `ClientHandshake` onwards the interceptor owns the raw connection and any
//! failure simply closes it; the error is logged with the state it occurred in.

use super::hijack::{supports_hijack, take_upgrade};
use super::http1::{self, DecodedRequest};
use super::relay::{relay, RelayEnd};
use super::{empty, error_response, ProxyBody};
use crate::capture::{CaptureSink, CapturedExchange};
use crate::config::{ServerConfig, UpstreamConfig};
use crate::error::{HandshakeSide, ProxyError, Result};
use crate::tls::{origin_client_config, strip_port, CertificateForge};
use http::{Request, Response, StatusCode};
use hyper::ext::ReasonPhrase;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use socket2::{SockRef, TcpKeepalive};
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream as OriginStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

const DEFAULT_TLS_PORT: u16 = 443;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Hijacking,
    TunnelAck,
    ClientHandshake,
    RequestDecode,
    OriginDial,
    RequestReplay,
    Relay,
    Closed,
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TunnelState::Hijacking => "hijacking",
            TunnelState::TunnelAck => "tunnel_ack",
            TunnelState::ClientHandshake => "client_handshake",
            TunnelState::RequestDecode => "request_decode",
            TunnelState::OriginDial => "origin_dial",
            TunnelState::RequestReplay => "request_replay",
            TunnelState::Relay => "relay",
            TunnelState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Time and size bounds applied to each tunnel.
#[derive(Debug, Clone, Copy)]
pub struct TunnelLimits {
    pub dial: Duration,
    pub keep_alive: Duration,
    pub tls_handshake: Duration,
    /// How long to wait for the initial request once TLS is up.
    pub request_read: Duration,
    /// Upper bound on the lifetime of the relay.
    pub max_lifetime: Duration,
    /// Largest initial request body that will be buffered.
    pub max_request_body: usize,
}

impl TunnelLimits {
    pub fn from_config(upstream: &UpstreamConfig, server: &ServerConfig) -> Self {
        Self {
            dial: upstream.dial_timeout(),
            keep_alive: upstream.keep_alive(),
            tls_handshake: upstream.tls_handshake_timeout(),
            request_read: server.read_timeout(),
            max_lifetime: server.write_timeout(),
            max_request_body: server.max_initial_body_bytes,
        }
    }
}

/// Terminates CONNECT tunnels with forged certificates and relays them to
/// the true origin.
#[derive(Clone)]
pub struct TunnelInterceptor {
    forge: Arc<CertificateForge>,
    connector: TlsConnector,
    capture: Arc<dyn CaptureSink>,
    limits: TunnelLimits,
    tunnels: TaskTracker,
    cancel: CancellationToken,
}

impl TunnelInterceptor {
    pub fn new(
        forge: Arc<CertificateForge>,
        capture: Arc<dyn CaptureSink>,
        limits: TunnelLimits,
    ) -> Result<Self> {
        Ok(Self {
            forge,
            connector: TlsConnector::from(origin_client_config()?),
            capture,
            limits,
            tunnels: TaskTracker::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Number of hijacked tunnels still running.
    pub fn active_tunnels(&self) -> usize {
        self.tunnels.len()
    }

    /// Handle a CONNECT request.
    ///
    /// The returned response is the tunnel acknowledgement; hyper writes it
    /// and then releases the connection to the spawned tunnel task. If the
    /// connection cannot be hijacked, a 500 is returned instead and the
    /// connection stays with the HTTP server.
    pub fn intercept<B>(&self, mut req: Request<B>, client_addr: Option<SocketAddr>) -> Response<ProxyBody> {
        let Some(target) = req.uri().authority().map(|a| a.to_string()) else {
            tracing::warn!(uri = %req.uri(), "CONNECT without an authority target");
            return error_response(StatusCode::BAD_REQUEST, "CONNECT target must be host:port");
        };

        if !supports_hijack(&req) {
            tracing::warn!(
                host = %target,
                state = %TunnelState::Hijacking,
                "Connection cannot be hijacked"
            );
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                ProxyError::HijackUnsupported.to_string(),
            );
        }

        let on_upgrade = match take_upgrade(&mut req) {
            Ok(on_upgrade) => on_upgrade,
            Err(e) => {
                tracing::warn!(host = %target, state = %TunnelState::Hijacking, "{}", e);
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
            }
        };

        tracing::debug!(host = %target, state = %TunnelState::TunnelAck, "Acknowledging tunnel");
        let tunnel = Tunnel {
            interceptor: self.clone(),
            target,
            client_addr,
            state: TunnelState::TunnelAck,
        };
        self.tunnels.spawn(tunnel.run(on_upgrade));

        let mut response = Response::new(empty());
        response
            .extensions_mut()
            .insert(ReasonPhrase::from_static(b"Connection Established"));
        response
    }

    /// Stop accepting tunnels and wait up to `grace` for running ones to
    /// finish, then close whatever is left.
    pub async fn shutdown(&self, grace: Duration) {
        self.tunnels.close();
        if tokio::time::timeout(grace, self.tunnels.wait()).await.is_err() {
            tracing::warn!(
                remaining = self.tunnels.len(),
                "Grace period elapsed, closing remaining tunnels"
            );
            self.cancel.cancel();
            self.tunnels.wait().await;
        }
    }
}

/// One hijacked connection.
struct Tunnel {
    interceptor: TunnelInterceptor,
    target: String,
    client_addr: Option<SocketAddr>,
    state: TunnelState,
}

impl Tunnel {
    async fn run(mut self, on_upgrade: OnUpgrade) {
        let cancel = self.interceptor.cancel.clone();
        let result = tokio::select! {
            result = self.establish(on_upgrade) => result,
            _ = cancel.cancelled() => Ok(()),
        };

        match result {
            Ok(()) => tracing::debug!(host = %self.target, "Tunnel closed"),
            Err(e) => tracing::warn!(
                host = %self.target,
                peer = ?self.client_addr,
                state = %self.state,
                error = %e,
                "Tunnel aborted"
            ),
        }
        self.enter(TunnelState::Closed);
    }

    fn enter(&mut self, state: TunnelState) {
        tracing::trace!(host = %self.target, state = %state, "Tunnel state");
        self.state = state;
    }

    async fn establish(&mut self, on_upgrade: OnUpgrade) -> Result<()> {
        let limits = self.interceptor.limits;

        // Resolves once hyper has flushed the acknowledgement
        let upgraded = on_upgrade
            .await
            .map_err(|e| ProxyError::Io(io::Error::new(io::ErrorKind::ConnectionAborted, e)))?;

        self.enter(TunnelState::ClientHandshake);
        let server_config = self.interceptor.forge.server_config(&self.target)?;
        let client_tls = bounded(
            limits.tls_handshake,
            TlsAcceptor::from(server_config).accept(TokioIo::new(upgraded)),
        )
        .await
        .map_err(|source| ProxyError::Handshake {
            side: HandshakeSide::Client,
            source,
        })?;

        self.enter(TunnelState::RequestDecode);
        let mut reader = BufReader::new(client_tls);
        let request = tokio::time::timeout(
            limits.request_read,
            http1::read_request(&mut reader, limits.max_request_body),
        )
        .await
        .map_err(|_| ProxyError::RequestDecode("timed out waiting for request".to_string()))??;
        let pipelined = reader.buffer().to_vec();
        let client_tls = reader.into_inner();
        tracing::debug!(
            host = %self.target,
            method = %request.head.method,
            path = %request.head.target,
            body_len = request.body.len(),
            "Decoded tunneled request"
        );
        self.capture(&request);

        self.enter(TunnelState::OriginDial);
        let mut origin = self.dial_origin().await?;

        self.enter(TunnelState::RequestReplay);
        let replay = http1::encode_replay(&request, replay_host(&self.target));
        origin.write_all(&replay).await.map_err(ProxyError::RelayIo)?;
        if !pipelined.is_empty() {
            origin.write_all(&pipelined).await.map_err(ProxyError::RelayIo)?;
        }
        origin.flush().await.map_err(ProxyError::RelayIo)?;

        self.enter(TunnelState::Relay);
        match relay(
            client_tls,
            origin,
            limits.max_lifetime,
            self.interceptor.cancel.child_token(),
        )
        .await
        {
            RelayEnd::Failed(e) => {
                tracing::debug!(host = %self.target, error = %e, "Relay leg failed");
            }
            RelayEnd::TimedOut => {
                tracing::info!(host = %self.target, "Tunnel reached its maximum lifetime");
            }
            end => {
                tracing::debug!(host = %self.target, end = ?end, "Relay finished");
            }
        }
        Ok(())
    }

    fn capture(&self, request: &DecodedRequest) {
        let head = &request.head;
        let exchange = CapturedExchange::new(
            head.method.as_str(),
            "https",
            self.target.as_str(),
            head.path(),
            head.query(),
        )
        .with_client_addr(self.client_addr)
        .with_headers(head.headers.iter().map(|(n, v)| (n.as_str(), v.as_str())))
        .with_body(&request.body);
        self.interceptor.capture.record(exchange);
    }

    async fn dial_origin(&self) -> Result<OriginStream<TcpStream>> {
        let limits = self.interceptor.limits;
        let address = dial_address(&self.target);
        let dial_error = |reason: String| ProxyError::OriginDial {
            target: self.target.clone(),
            reason,
        };

        let tcp = tokio::time::timeout(limits.dial, TcpStream::connect(address.as_str()))
            .await
            .map_err(|_| dial_error("connect timed out".to_string()))?
            .map_err(|e| dial_error(e.to_string()))?;

        let keepalive = TcpKeepalive::new().with_time(limits.keep_alive);
        if let Err(e) = SockRef::from(&tcp).set_tcp_keepalive(&keepalive) {
            tracing::debug!(host = %self.target, error = %e, "Failed to enable TCP keep-alive");
        }
        tcp.set_nodelay(true).ok();

        let server_name = ServerName::try_from(strip_port(&self.target).to_string())
            .map_err(|e| dial_error(e.to_string()))?;

        bounded(
            limits.tls_handshake,
            self.interceptor.connector.connect(server_name, tcp),
        )
        .await
        .map_err(|source| ProxyError::Handshake {
            side: HandshakeSide::Origin,
            source,
        })
    }
}

async fn bounded<T>(limit: Duration, fut: impl Future<Output = io::Result<T>>) -> io::Result<T> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "TLS handshake timed out"))?
}

/// Address to dial for a CONNECT target, defaulting the port to 443.
fn dial_address(target: &str) -> String {
    let has_port = if target.starts_with('[') {
        target.contains("]:")
    } else {
        strip_port(target) != target
    };
    if has_port {
        target.to_string()
    } else {
        format!("{}:{}", target, DEFAULT_TLS_PORT)
    }
}

/// Value of the `Host` header replayed to the origin: the tunnel target,
/// without the port when it is the default for TLS.
fn replay_host(target: &str) -> &str {
    target.strip_suffix(":443").unwrap_or(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::TracingCaptureSink;
    use crate::tls::authority::tests::generate_root_pem;
    use crate::tls::RootAuthority;
    use http_body_util::{BodyExt, Empty};

    fn interceptor() -> TunnelInterceptor {
        let (cert, key) = generate_root_pem();
        let authority = Arc::new(RootAuthority::from_pem(&cert, &key).unwrap());
        TunnelInterceptor::new(
            Arc::new(CertificateForge::new(authority)),
            Arc::new(TracingCaptureSink),
            TunnelLimits::from_config(&UpstreamConfig::default(), &ServerConfig::default()),
        )
        .unwrap()
    }

    #[test]
    fn test_target_helpers() {
        assert_eq!(dial_address("example.com:8443"), "example.com:8443");
        assert_eq!(dial_address("example.com"), "example.com:443");
        assert_eq!(dial_address("[::1]:443"), "[::1]:443");
        assert_eq!(dial_address("[::1]"), "[::1]:443");

        assert_eq!(replay_host("example.com:443"), "example.com");
        assert_eq!(replay_host("example.com:8443"), "example.com:8443");
        assert_eq!(replay_host("[::1]:443"), "[::1]");
    }

    #[tokio::test]
    async fn test_unhijackable_connection_gets_internal_error() {
        let interceptor = interceptor();
        let req = Request::builder()
            .method("CONNECT")
            .uri("example.com:443")
            .body(Empty::<bytes::Bytes>::new())
            .unwrap();

        let response = interceptor.intercept(req, None);

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(interceptor.active_tunnels(), 0);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"Hijacking not supported");
    }

    #[tokio::test]
    async fn test_shutdown_with_no_tunnels_returns_immediately() {
        let interceptor = interceptor();
        tokio::time::timeout(Duration::from_secs(1), interceptor.shutdown(Duration::from_secs(30)))
            .await
            .expect("shutdown should not wait without tunnels");
    }
}
