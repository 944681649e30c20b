#![allow(dead_code)]

use bytes::Bytes;
use dev_proxy::capture::{CaptureSink, CapturedExchange};
use dev_proxy::config::{ServerConfig, UpstreamConfig};
use dev_proxy::proxy::http1::{read_request, DecodedRequest};
use dev_proxy::proxy::{
    PlainForwarder, ProxyServer, RequestRouter, TunnelInterceptor, TunnelLimits,
};
use dev_proxy::tls::verifier::leaf_server_config;
use dev_proxy::tls::{CertificateForge, RootAuthority};
use http::{HeaderMap, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use rcgen::{BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair, KeyUsagePurpose};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_rustls::{TlsAcceptor, TlsConnector};

pub const WAIT: Duration = Duration::from_secs(5);

/// Throwaway root authority as (cert PEM, key PEM).
pub fn generate_root() -> (String, String) {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "Dev Proxy Integration Root");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

    let key = KeyPair::generate().expect("generate root key");
    let cert = params.self_signed(&key).expect("self-sign root");
    (cert.pem(), key.serialize_pem())
}

#[derive(Default)]
pub struct RecordingSink {
    exchanges: Mutex<Vec<CapturedExchange>>,
}

impl RecordingSink {
    pub fn exchanges(&self) -> Vec<CapturedExchange> {
        self.exchanges.lock().unwrap().clone()
    }
}

impl CaptureSink for RecordingSink {
    fn record(&self, exchange: CapturedExchange) {
        self.exchanges.lock().unwrap().push(exchange);
    }
}

pub struct TestProxy {
    pub addr: SocketAddr,
    pub root_der: CertificateDer<'static>,
    pub interceptor: TunnelInterceptor,
    pub capture: Arc<RecordingSink>,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<dev_proxy::error::Result<()>>,
}

impl TestProxy {
    pub async fn start() -> Self {
        Self::start_with_sink(None).await
    }

    /// Start a proxy on an ephemeral port. When `sink` is given it receives
    /// captures instead of the recording sink.
    pub async fn start_with_sink(sink: Option<Arc<dyn CaptureSink>>) -> Self {
        let (cert_pem, key_pem) = generate_root();
        let authority = Arc::new(RootAuthority::from_pem(&cert_pem, &key_pem).unwrap());
        let root_der = authority.certificate_der().clone();

        let recording = Arc::new(RecordingSink::default());
        let capture: Arc<dyn CaptureSink> = match sink {
            Some(sink) => sink,
            None => recording.clone(),
        };

        let upstream = UpstreamConfig::default();
        let server = ServerConfig {
            shutdown_grace_secs: 1,
            ..ServerConfig::default()
        };

        let forwarder = PlainForwarder::new(
            PlainForwarder::build_client(&upstream).unwrap(),
            capture.clone(),
        );
        let interceptor = TunnelInterceptor::new(
            Arc::new(CertificateForge::new(authority)),
            capture,
            TunnelLimits::from_config(&upstream, &server),
        )
        .unwrap();
        let router = RequestRouter::new(forwarder, interceptor.clone());

        let proxy = ProxyServer::bind("127.0.0.1:0".parse().unwrap(), router, &server)
            .await
            .unwrap();
        let addr = proxy.local_addr().unwrap();

        let (shutdown, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(proxy.run(async move {
            let _ = rx.await;
        }));

        Self {
            addr,
            root_der,
            interceptor,
            capture: recording,
            shutdown,
            task,
        }
    }

    /// Trigger shutdown and wait for the server loop to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        tokio::time::timeout(Duration::from_secs(10), self.task)
            .await
            .expect("proxy did not stop in time")
            .unwrap()
            .unwrap();
    }
}

/// Send one request through the proxy over a fresh connection.
pub async fn send_via_proxy(proxy: SocketAddr, req: Request<Full<Bytes>>) -> (StatusCode, HeaderMap, Bytes) {
    let stream = TcpStream::connect(proxy).await.unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(conn);

    let response = sender.send_request(req).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, headers, body)
}

async fn echo(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    if req.uri().path() == "/teapot" {
        let response = Response::builder()
            .status(StatusCode::IM_A_TEAPOT)
            .header("content-type", "text/plain")
            .header("x-origin", "teapot")
            .body(Full::new(Bytes::from_static(b"short and stout")))
            .unwrap();
        return Ok(response);
    }

    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let headers: BTreeMap<String, String> = req
        .headers()
        .iter()
        .map(|(n, v)| (n.to_string(), v.to_str().unwrap_or_default().to_string()))
        .collect();
    let body = req
        .into_body()
        .collect()
        .await
        .map(|b| b.to_bytes())
        .unwrap_or_default();

    let json = serde_json::json!({
        "method": method,
        "path": path,
        "headers": headers,
        "body": String::from_utf8_lossy(&body),
    });
    let response = Response::builder()
        .header("content-type", "application/json")
        .header("x-origin", "echo")
        .body(Full::new(Bytes::from(json.to_string())))
        .unwrap();
    Ok(response)
}

/// Plain HTTP origin that echoes the request back as JSON.
pub async fn start_echo_origin() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service_fn(echo))
                    .await;
            });
        }
    });
    addr
}

/// An address nothing listens on.
pub async fn unreachable_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OriginBehavior {
    /// Answer every request on the connection.
    KeepOpen,
    /// Answer the first request, then drop the connection.
    CloseAfterFirst,
}

/// TLS origin with a self-signed certificate for `localhost`. Every request
/// it decodes is sent on the returned channel and answered with `ok`.
pub async fn start_tls_origin(behavior: OriginBehavior) -> (SocketAddr, mpsc::UnboundedReceiver<DecodedRequest>) {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));
    let acceptor = TlsAcceptor::from(leaf_server_config(certified.cert.der().clone(), key).unwrap());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let Ok(tls) = acceptor.accept(stream).await else {
                    return;
                };
                let mut reader = BufReader::new(tls);
                while let Ok(request) = read_request(&mut reader, 1 << 20).await {
                    let _ = tx.send(request);
                    let response = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";
                    if reader.get_mut().write_all(response).await.is_err() {
                        return;
                    }
                    let _ = reader.get_mut().flush().await;
                    if behavior == OriginBehavior::CloseAfterFirst {
                        // Abrupt close, no TLS close_notify
                        return;
                    }
                }
            });
        }
    });

    (addr, rx)
}

pub type ClientTls = tokio_rustls::client::TlsStream<TcpStream>;

/// Open a CONNECT tunnel through the proxy and complete TLS as a client that
/// trusts only `root`.
pub async fn open_tunnel(proxy: SocketAddr, target: &str, root: CertificateDer<'static>) -> ClientTls {
    let mut tcp = TcpStream::connect(proxy).await.unwrap();
    tcp.write_all(format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n").as_bytes())
        .await
        .unwrap();

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        tcp.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
    }
    let head = String::from_utf8(head).unwrap();
    assert!(
        head.starts_with("HTTP/1.1 200 Connection Established\r\n"),
        "unexpected tunnel ack: {head:?}"
    );

    let mut roots = RootCertStore::empty();
    roots.add(root).unwrap();
    let config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::aws_lc_rs::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();

    let host = target.rsplit_once(':').map_or(target, |(h, _)| h).to_string();
    TlsConnector::from(Arc::new(config))
        .connect(ServerName::try_from(host).unwrap(), tcp)
        .await
        .expect("client TLS handshake through the proxy")
}

/// Read one `Content-Length` framed response, returning (status line, body).
pub async fn read_response<R: AsyncBufRead + Unpin>(reader: &mut R) -> (String, Vec<u8>) {
    let mut status = String::new();
    reader.read_line(&mut status).await.unwrap();

    let mut content_length = 0;
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().unwrap();
            }
        }
    }

    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body).await.unwrap();
    (status.trim_end().to_string(), body)
}

/// Poll `check` until it holds or `WAIT` elapses.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

pub fn empty_body() -> Full<Bytes> {
    Full::new(Bytes::new())
}
