use super::schema::Config;
use crate::error::{ConfigError, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use std::net::SocketAddr;
use std::path::Path;

const DEFAULT_CONFIG_FILE: &str = "dev-proxy.toml";
const ENV_PREFIX: &str = "DEV_PROXY_";

/// Load configuration from `dev-proxy.toml` in the working directory, if
/// present, overridden by `DEV_PROXY_*` environment variables.
pub fn load_from_env_or_file() -> Result<Config> {
    extract(base().merge(Toml::file(DEFAULT_CONFIG_FILE)))
}

/// Load configuration from an explicit TOML file, overridden by
/// `DEV_PROXY_*` environment variables.
pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(ConfigError::Parse(format!(
            "Configuration file not found: {}",
            path.display()
        ))
        .into());
    }
    extract(base().merge(Toml::file(path)))
}

fn base() -> Figment {
    Figment::from(Serialized::defaults(Config::default()))
}

fn extract(figment: Figment) -> Result<Config> {
    let config: Config = figment
        // Nested keys use a double underscore, e.g. DEV_PROXY_TLS__CA_CERT_PATH
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    config.listen.parse::<SocketAddr>().map_err(|e| {
        ConfigError::Validation(format!("Invalid listen address '{}': {}", config.listen, e))
    })?;

    let timeouts = [
        ("upstream.dial_timeout_secs", config.upstream.dial_timeout_secs),
        ("upstream.keep_alive_secs", config.upstream.keep_alive_secs),
        ("upstream.idle_timeout_secs", config.upstream.idle_timeout_secs),
        (
            "upstream.tls_handshake_timeout_secs",
            config.upstream.tls_handshake_timeout_secs,
        ),
        ("server.read_timeout_secs", config.server.read_timeout_secs),
        ("server.write_timeout_secs", config.server.write_timeout_secs),
    ];
    for (name, value) in timeouts {
        if value == 0 {
            return Err(
                ConfigError::Validation(format!("{name} must be greater than 0")).into(),
            );
        }
    }

    if config.tls.cert_cache && config.tls.cert_cache_capacity == 0 {
        return Err(ConfigError::Validation(
            "tls.cert_cache_capacity must be greater than 0".into(),
        )
        .into());
    }

    if config.upstream.max_idle_connections == 0 {
        return Err(ConfigError::Validation(
            "upstream.max_idle_connections must be greater than 0".into(),
        )
        .into());
    }

    Ok(())
}
