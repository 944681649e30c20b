use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

use dev_proxy::capture::{CaptureSink, SqliteCaptureStore, TracingCaptureSink};
use dev_proxy::config::{self, Config};
use dev_proxy::proxy::{PlainForwarder, ProxyServer, RequestRouter, TunnelInterceptor, TunnelLimits};
use dev_proxy::tls::{CertificateForge, RootAuthority};

#[derive(Parser, Debug)]
#[command(name = "dev-proxy")]
#[command(about = "A local forward proxy that relays HTTP and intercepts HTTPS for inspection", long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(short, long, value_name = "ADDR")]
    listen: Option<String>,

    /// Root authority certificate (PEM)
    #[arg(long, value_name = "FILE")]
    ca_cert: Option<PathBuf>,

    /// Root authority private key (PKCS#8 PEM)
    #[arg(long, value_name = "FILE")]
    ca_key: Option<PathBuf>,

    /// SQLite database for captured exchanges
    #[arg(long, value_name = "FILE")]
    capture_db: Option<PathBuf>,

    /// Log exchanges instead of persisting them
    #[arg(long)]
    no_capture: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(listen) = &self.listen {
            config.listen = listen.clone();
        }
        if let Some(path) = &self.ca_cert {
            config.tls.ca_cert_path = path.clone();
        }
        if let Some(path) = &self.ca_key {
            config.tls.ca_key_path = path.clone();
        }
        if let Some(path) = &self.capture_db {
            config.capture.database_path = path.clone();
        }
        if self.no_capture {
            config.capture.enabled = false;
        }
        if self.json_logs {
            config.logging.json = true;
        }
    }
}

fn init_tracing(debug: bool, json: bool) -> anyhow::Result<()> {
    let log_level = if debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(format!("dev_proxy={log_level}").parse()?);

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => config::load_from_path(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => config::load_from_env_or_file().context("Failed to load configuration")?,
    };
    args.apply(&mut config);
    config::validate(&config)?;

    init_tracing(args.debug, config.logging.json)?;

    let listen: SocketAddr = config
        .listen
        .parse()
        .with_context(|| format!("Invalid listen address {}", config.listen))?;

    let authority = RootAuthority::from_pem_files(&config.tls.ca_cert_path, &config.tls.ca_key_path)
        .context("Failed to load root authority")?;
    info!(
        subject = authority.common_name().unwrap_or("<unnamed>"),
        fingerprint = %authority.fingerprint(),
        "Loaded root authority"
    );
    let authority = Arc::new(authority);

    let forge = if config.tls.cert_cache {
        info!(
            capacity = config.tls.cert_cache_capacity,
            "Leaf certificate cache enabled"
        );
        CertificateForge::with_cache(authority, config.tls.cert_cache_capacity)
    } else {
        CertificateForge::new(authority)
    };

    let capture: Arc<dyn CaptureSink> = if config.capture.enabled {
        match SqliteCaptureStore::open(&config.capture.database_path) {
            Ok(store) => {
                info!(path = %store.path().display(), "Capturing exchanges to SQLite");
                Arc::new(store)
            }
            Err(e) => {
                warn!(error = %e, "Failed to open capture store, logging exchanges only");
                Arc::new(TracingCaptureSink)
            }
        }
    } else {
        Arc::new(TracingCaptureSink)
    };

    let forwarder = PlainForwarder::new(PlainForwarder::build_client(&config.upstream)?, capture.clone());
    let interceptor = TunnelInterceptor::new(
        Arc::new(forge),
        capture,
        TunnelLimits::from_config(&config.upstream, &config.server),
    )?;
    let router = RequestRouter::new(forwarder, interceptor);

    let server = ProxyServer::bind(listen, router, &config.server)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;

    if let Err(e) = server.run(shutdown_signal()).await {
        error!(error = %e, "Proxy server failed");
        return Err(e.into());
    }

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
