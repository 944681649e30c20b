use super::{BoxError, PlainForwarder, ProxyBody, TunnelInterceptor};
use bytes::Bytes;
use http::{Method, Request, Response};
use hyper::body::Body;
use std::net::SocketAddr;

/// Single entry point for inbound requests: `CONNECT` goes to the tunnel
/// interceptor, everything else to the plain forwarder. The request is
/// passed through untouched.
#[derive(Clone)]
pub struct RequestRouter {
    forwarder: PlainForwarder,
    interceptor: TunnelInterceptor,
}

impl RequestRouter {
    pub fn new(forwarder: PlainForwarder, interceptor: TunnelInterceptor) -> Self {
        Self {
            forwarder,
            interceptor,
        }
    }

    pub fn interceptor(&self) -> &TunnelInterceptor {
        &self.interceptor
    }

    pub async fn route<B>(&self, req: Request<B>, client_addr: Option<SocketAddr>) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        tracing::debug!(
            method = %req.method(),
            uri = %req.uri(),
            peer = ?client_addr,
            "Routing request"
        );

        if req.method() == Method::CONNECT {
            self.interceptor.intercept(req, client_addr)
        } else {
            self.forwarder.forward(req, client_addr).await
        }
    }
}
