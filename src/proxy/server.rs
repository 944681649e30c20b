//! Listener loop
//!
//! One task per accepted connection, served by hyper's HTTP/1 server with
//! upgrades enabled so CONNECT requests can be hijacked. Shutdown stops the
//! accept loop, lets in-flight connections and tunnels drain for a bounded
//! grace period and then closes whatever remains.

use super::RequestRouter;
use crate::config::ServerConfig;
use crate::error::Result;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioIo, TokioTimer};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub struct ProxyServer {
    listener: TcpListener,
    router: RequestRouter,
    header_read_timeout: Duration,
    shutdown_grace: Duration,
}

impl ProxyServer {
    pub async fn bind(addr: SocketAddr, router: RequestRouter, config: &ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            router,
            header_read_timeout: config.read_timeout(),
            shutdown_grace: config.shutdown_grace(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `shutdown` resolves, then drain.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let mut builder = http1::Builder::new();
        builder
            .timer(TokioTimer::new())
            .header_read_timeout(self.header_read_timeout)
            .keep_alive(true);

        let connections = TaskTracker::new();
        let draining = CancellationToken::new();
        let force_close = CancellationToken::new();
        tokio::pin!(shutdown);

        tracing::info!(addr = %self.local_addr()?, "Proxy listening");

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };

                    let router = self.router.clone();
                    let service = service_fn(move |req: Request<Incoming>| {
                        let router = router.clone();
                        async move { Ok::<_, Infallible>(router.route(req, Some(peer)).await) }
                    });

                    let conn = builder
                        .serve_connection(TokioIo::new(stream), service)
                        .with_upgrades();
                    let draining = draining.clone();
                    let force_close = force_close.clone();
                    connections.spawn(async move {
                        tokio::pin!(conn);
                        let result = tokio::select! {
                            result = conn.as_mut() => result,
                            _ = draining.cancelled() => {
                                // Finish the in-flight exchange, then close
                                conn.as_mut().graceful_shutdown();
                                tokio::select! {
                                    result = conn.as_mut() => result,
                                    _ = force_close.cancelled() => {
                                        tracing::debug!(peer = %peer, "Connection force closed");
                                        return;
                                    }
                                }
                            }
                        };
                        if let Err(e) = result {
                            tracing::debug!(peer = %peer, error = %e, "Connection ended with error");
                        }
                    });
                }
                _ = &mut shutdown => {
                    tracing::info!("Shutdown requested, no longer accepting connections");
                    break;
                }
            }
        }

        drop(self.listener);
        let interceptor = self.router.interceptor().clone();
        let grace = self.shutdown_grace;

        // Tunnels get whatever is left of the grace period once plain
        // connections have drained.
        let started = tokio::time::Instant::now();
        connections.close();
        draining.cancel();
        if tokio::time::timeout(grace, connections.wait()).await.is_err() {
            tracing::warn!(
                remaining = connections.len(),
                "Grace period elapsed, closing remaining connections"
            );
            force_close.cancel();
            connections.wait().await;
        }
        interceptor
            .shutdown(grace.saturating_sub(started.elapsed()))
            .await;

        tracing::info!("Proxy stopped");
        Ok(())
    }
}
