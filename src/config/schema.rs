use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    #[serde(default = "default_ca_cert_path")]
    pub ca_cert_path: PathBuf,
    #[serde(default = "default_ca_key_path")]
    pub ca_key_path: PathBuf,
    /// Reuse forged leaf certificates per host until they expire.
    #[serde(default)]
    pub cert_cache: bool,
    /// Most hosts kept in the leaf certificate cache.
    #[serde(default = "default_cert_cache_capacity")]
    pub cert_cache_capacity: usize,
}

/// Outbound connection settings shared by the plain forwarder and the
/// tunnel's origin dial.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_max_idle_connections")]
    pub max_idle_connections: usize,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_tls_handshake_timeout")]
    pub tls_handshake_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
    /// Largest body buffered for the initial request of a tunnel.
    #[serde(default = "default_max_initial_body_bytes")]
    pub max_initial_body_bytes: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CaptureConfig {
    #[serde(default = "default_capture_enabled")]
    pub enabled: bool,
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub json: bool,
}

impl UpstreamConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn tls_handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.tls_handshake_timeout_secs)
    }
}

impl ServerConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

// Default value functions
fn default_listen() -> String {
    "127.0.0.1:7777".to_string()
}

fn default_ca_cert_path() -> PathBuf {
    PathBuf::from("./keys/ca.crt")
}

fn default_ca_key_path() -> PathBuf {
    PathBuf::from("./keys/ca.key")
}

fn default_cert_cache_capacity() -> usize {
    1024
}

fn default_dial_timeout() -> u64 {
    30
}

fn default_keep_alive() -> u64 {
    30
}

fn default_max_idle_connections() -> usize {
    100
}

fn default_idle_timeout() -> u64 {
    90
}

fn default_tls_handshake_timeout() -> u64 {
    10
}

fn default_read_timeout() -> u64 {
    15 * 60
}

fn default_write_timeout() -> u64 {
    15 * 60
}

fn default_shutdown_grace() -> u64 {
    10
}

fn default_max_initial_body_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_capture_enabled() -> bool {
    true
}

fn default_database_path() -> PathBuf {
    PathBuf::from("proxy.db")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            tls: TlsConfig::default(),
            upstream: UpstreamConfig::default(),
            server: ServerConfig::default(),
            capture: CaptureConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            ca_cert_path: default_ca_cert_path(),
            ca_key_path: default_ca_key_path(),
            cert_cache: false,
            cert_cache_capacity: default_cert_cache_capacity(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            dial_timeout_secs: default_dial_timeout(),
            keep_alive_secs: default_keep_alive(),
            max_idle_connections: default_max_idle_connections(),
            idle_timeout_secs: default_idle_timeout(),
            tls_handshake_timeout_secs: default_tls_handshake_timeout(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            read_timeout_secs: default_read_timeout(),
            write_timeout_secs: default_write_timeout(),
            shutdown_grace_secs: default_shutdown_grace(),
            max_initial_body_bytes: default_max_initial_body_bytes(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            enabled: default_capture_enabled(),
            database_path: default_database_path(),
        }
    }
}
