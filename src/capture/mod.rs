//! Observed-exchange capture
//!
//! The proxy describes every exchange it observes as a [`CapturedExchange`]
//! and hands it to a [`CaptureSink`]. Sinks are best-effort: `record` must
//! return immediately and never fail the request that produced the exchange.

mod exchange;
mod store;

pub use exchange::{parse_body, parse_query, CapturedExchange};
pub use store::{SqliteCaptureStore, StoredCapture};

/// Receives a description of each observed exchange.
pub trait CaptureSink: Send + Sync {
    /// Record an exchange without blocking the caller.
    fn record(&self, exchange: CapturedExchange);
}

/// Sink that only logs exchanges. Used when durable capture is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingCaptureSink;

impl CaptureSink for TracingCaptureSink {
    fn record(&self, exchange: CapturedExchange) {
        tracing::debug!(
            method = %exchange.method,
            scheme = %exchange.scheme,
            host = %exchange.host,
            path = %exchange.path,
            client = exchange.client_addr.as_deref().unwrap_or("-"),
            "Observed exchange"
        );
    }
}
