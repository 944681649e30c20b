use std::fmt;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Root authority error: {0}")]
    RootAuthority(String),

    #[error("Hijacking not supported")]
    HijackUnsupported,

    #[error("TLS handshake with {side} failed: {source}")]
    Handshake {
        side: HandshakeSide,
        #[source]
        source: io::Error,
    },

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("Certificate forge error: {0}")]
    CertificateForge(String),

    #[error("Failed to decode tunneled request: {0}")]
    RequestDecode(String),

    #[error("Failed to dial origin {target}: {reason}")]
    OriginDial { target: String, reason: String },

    #[error("{0}")]
    UpstreamRoundTrip(String),

    #[error("Relay IO error: {0}")]
    RelayIo(#[source] io::Error),

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Which leg of an intercepted tunnel a TLS handshake belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeSide {
    Client,
    Origin,
}

impl fmt::Display for HandshakeSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeSide::Client => f.write_str("client"),
            HandshakeSide::Origin => f.write_str("origin"),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<rusqlite::Error> for CaptureError {
    fn from(err: rusqlite::Error) -> Self {
        CaptureError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for CaptureError {
    fn from(err: serde_json::Error) -> Self {
        CaptureError::Serialization(err.to_string())
    }
}

impl From<rcgen::Error> for ProxyError {
    fn from(err: rcgen::Error) -> Self {
        ProxyError::CertificateForge(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
