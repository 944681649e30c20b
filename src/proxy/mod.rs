//! The proxy core: routing, plain forwarding and CONNECT interception.

pub mod forwarder;
pub mod hijack;
pub mod hop_by_hop;
pub mod http1;
pub mod relay;
pub mod router;
pub mod server;
pub mod tunnel;

pub use forwarder::PlainForwarder;
pub use router::RequestRouter;
pub use server::ProxyServer;
pub use tunnel::{TunnelInterceptor, TunnelLimits, TunnelState};

use bytes::Bytes;
use http::{header, HeaderValue, Response, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Response body type produced by every handler.
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

pub(crate) fn full(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub(crate) fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Plain-text error response carrying `message` as the body.
pub(crate) fn error_response(status: StatusCode, message: impl Into<String>) -> Response<ProxyBody> {
    let mut response = Response::new(full(message.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
