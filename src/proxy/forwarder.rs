//! Plain (non-tunneled) HTTP forwarding
//!
//! Requests arrive in absolute form (`GET http://host/path`), are normalized
//! and sent through a shared pooled client. The response status, headers and
//! body are passed back unmodified. Upstream certificate verification is
//! disabled on the pooled client, matching the tunnel's origin dial.

use super::hop_by_hop::strip_hop_by_hop;
use super::{error_response, BoxError, ProxyBody};
use crate::capture::{CaptureSink, CapturedExchange};
use crate::config::UpstreamConfig;
use crate::error::{ProxyError, Result};
use bytes::Bytes;
use futures::TryStreamExt;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Request, Response, StatusCode, Uri};
use http_body_util::{BodyDataStream, BodyExt, StreamBody};
use hyper::body::{Body, Frame};
use std::net::SocketAddr;
use std::sync::Arc;

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Forwards non-CONNECT requests to their origin.
#[derive(Clone)]
pub struct PlainForwarder {
    client: reqwest::Client,
    capture: Arc<dyn CaptureSink>,
}

impl PlainForwarder {
    /// Wrap a shared outbound client. The client owns the connection pool and
    /// is cheap to clone; build it once with [`PlainForwarder::build_client`].
    pub fn new(client: reqwest::Client, capture: Arc<dyn CaptureSink>) -> Self {
        Self { client, capture }
    }

    /// Build the pooled outbound client.
    pub fn build_client(config: &UpstreamConfig) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .pool_max_idle_per_host(config.max_idle_connections)
            .pool_idle_timeout(config.idle_timeout())
            .connect_timeout(config.tls_handshake_timeout())
            .tcp_keepalive(config.keep_alive())
            .build()
            .map_err(|e| ProxyError::TlsConfig(format!("Failed to build upstream client: {}", e)))
    }

    /// Forward one request. Transport failures become `502 Bad Gateway`
    /// with the error text as the body.
    pub async fn forward<B>(&self, req: Request<B>, client_addr: Option<SocketAddr>) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let method = req.method().clone();
        let uri = req.uri().clone();

        match self.round_trip(req, client_addr).await {
            Ok(response) => {
                tracing::debug!(
                    method = %method,
                    uri = %uri,
                    status = response.status().as_u16(),
                    "Forwarded request"
                );
                response
            }
            Err(e) => {
                tracing::warn!(method = %method, uri = %uri, error = %e, "Upstream round trip failed");
                error_response(StatusCode::BAD_GATEWAY, e.to_string())
            }
        }
    }

    async fn round_trip<B>(&self, req: Request<B>, client_addr: Option<SocketAddr>) -> Result<Response<ProxyBody>>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let (mut parts, body) = req.into_parts();
        let url = absolute_url(&parts.uri)?;

        self.capture.record(
            CapturedExchange::new(
                parts.method.as_str(),
                "http",
                parts.uri.authority().map(|a| a.as_str()).unwrap_or_default(),
                parts.uri.path(),
                parts.uri.query(),
            )
            .with_client_addr(client_addr)
            .with_headers(
                parts
                    .headers
                    .iter()
                    .filter_map(|(name, value)| Some((name.as_str(), value.to_str().ok()?))),
            ),
        );

        prepare_outbound_headers(&mut parts.headers, client_addr);

        let mut outbound = self
            .client
            .request(parts.method, url)
            .headers(parts.headers);
        if !body.is_end_stream() {
            let stream = BodyDataStream::new(body).map_err(Into::<BoxError>::into);
            outbound = outbound.body(reqwest::Body::wrap_stream(stream));
        }

        let upstream = outbound
            .send()
            .await
            .map_err(|e| ProxyError::UpstreamRoundTrip(e.to_string()))?;

        let status = upstream.status();
        let headers = upstream.headers().clone();
        let body = StreamBody::new(
            upstream
                .bytes_stream()
                .map_ok(Frame::data)
                .map_err(|e| Box::new(e) as BoxError),
        );

        let mut response = Response::new(body.boxed_unsync());
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

fn absolute_url(uri: &Uri) -> Result<String> {
    match (uri.scheme(), uri.authority()) {
        (Some(_), Some(_)) => Ok(uri.to_string()),
        _ => Err(ProxyError::UpstreamRoundTrip(format!(
            "request target {} is not an absolute URI",
            uri
        ))),
    }
}

/// Normalize request headers for the next hop.
pub fn prepare_outbound_headers(headers: &mut HeaderMap, client_addr: Option<SocketAddr>) {
    strip_hop_by_hop(headers);
    if let Some(addr) = client_addr {
        if let Ok(value) = HeaderValue::from_str(&addr.ip().to_string()) {
            headers.insert(X_FORWARDED_FOR, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{CONNECTION, HOST, UPGRADE};

    #[test]
    fn test_outbound_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("example.com"));
        headers.insert(CONNECTION, HeaderValue::from_static("x-session"));
        headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert("x-session", HeaderValue::from_static("abc"));
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("10.0.0.1"));

        prepare_outbound_headers(&mut headers, Some("192.168.1.7:51234".parse().unwrap()));

        assert_eq!(headers.get(HOST).unwrap(), "example.com");
        assert_eq!(headers.get(X_FORWARDED_FOR).unwrap(), "192.168.1.7");
        assert!(!headers.contains_key(CONNECTION));
        assert!(!headers.contains_key(UPGRADE));
        assert!(!headers.contains_key("x-session"));
    }

    #[test]
    fn test_outbound_headers_without_client_addr() {
        let mut headers = HeaderMap::new();
        prepare_outbound_headers(&mut headers, None);
        assert!(!headers.contains_key(X_FORWARDED_FOR));
    }

    #[test]
    fn test_origin_form_target_is_rejected() {
        assert!(absolute_url(&"http://example.com/a?b=1".parse().unwrap()).is_ok());
        let err = absolute_url(&"/relative".parse().unwrap()).unwrap_err();
        assert!(err.to_string().contains("not an absolute URI"));
    }

    #[test]
    fn test_client_builds_from_defaults() {
        assert!(PlainForwarder::build_client(&UpstreamConfig::default()).is_ok());
    }
}
