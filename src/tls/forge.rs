//! Leaf certificate forging
//!
//! Every intercepted CONNECT target gets a freshly generated key pair and a
//! leaf certificate signed by the root authority. Leaves are never written
//! to disk. An optional per-host cache reuses a forged leaf until it expires,
//! holding at most a fixed number of hosts.

use crate::error::Result;
use crate::tls::authority::RootAuthority;
use crate::tls::verifier::leaf_server_config;
use dashmap::DashMap;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose, SanType, SerialNumber,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use std::net::IpAddr;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};

/// Leaves are back-dated to tolerate clock skew between proxy and client.
const CLOCK_SKEW: Duration = Duration::hours(1);
const LEAF_VALIDITY: Duration = Duration::days(365);

/// An ephemeral leaf certificate and its private key.
pub struct LeafCertificate {
    pub certificate: CertificateDer<'static>,
    pub key: PrivateKeyDer<'static>,
    pub not_after: OffsetDateTime,
}

impl LeafCertificate {
    /// Build a rustls server configuration presenting this leaf.
    pub fn into_server_config(self) -> Result<Arc<ServerConfig>> {
        leaf_server_config(self.certificate, self.key)
    }
}

/// Strip a trailing `:port` from a CONNECT target, handling bracketed IPv6.
pub fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split_once(']').map(|(addr, _)| addr).unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) => {
            name
        }
        _ => host,
    }
}

/// Forge a leaf certificate for `host` signed by `authority`.
///
/// The subject common name is `host` exactly as given (port included, as a
/// CONNECT target carries it) while the DNS SAN is the bare hostname.
pub fn forge(host: &str, authority: &RootAuthority) -> Result<LeafCertificate> {
    let name = strip_port(host);

    let mut params = CertificateParams::default();
    params.serial_number = Some(SerialNumber::from_slice(&rand::random::<[u8; 16]>()));

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host);
    params.distinguished_name = dn;

    params.subject_alt_names = vec![SanType::DnsName(name.try_into()?)];
    if let Ok(ip) = name.parse::<IpAddr>() {
        params.subject_alt_names.push(SanType::IpAddress(ip));
    }

    let now = OffsetDateTime::now_utc();
    params.not_before = now - CLOCK_SKEW;
    params.not_after = now + LEAF_VALIDITY;

    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.use_authority_key_identifier_extension = true;

    let key_pair = KeyPair::generate()?;
    let not_after = params.not_after;
    let cert = params.signed_by(&key_pair, authority.issuer(), authority.key())?;

    Ok(LeafCertificate {
        certificate: cert.der().clone(),
        key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der())),
        not_after,
    })
}

struct CachedLeaf {
    config: Arc<ServerConfig>,
    expires_at: OffsetDateTime,
}

/// Produces TLS server configurations for intercepted hosts.
pub struct CertificateForge {
    authority: Arc<RootAuthority>,
    cache: Option<DashMap<String, CachedLeaf>>,
    capacity: usize,
}

impl CertificateForge {
    /// A forge that signs a new leaf for every tunnel.
    pub fn new(authority: Arc<RootAuthority>) -> Self {
        Self {
            authority,
            cache: None,
            capacity: 0,
        }
    }

    /// A forge that reuses leaves per host until they expire, keeping at
    /// most `capacity` hosts.
    pub fn with_cache(authority: Arc<RootAuthority>, capacity: usize) -> Self {
        Self {
            authority,
            cache: Some(DashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn authority(&self) -> &RootAuthority {
        &self.authority
    }

    pub fn forge(&self, host: &str) -> Result<LeafCertificate> {
        forge(host, &self.authority)
    }

    /// Get a server configuration presenting a leaf for `host`.
    pub fn server_config(&self, host: &str) -> Result<Arc<ServerConfig>> {
        let Some(cache) = &self.cache else {
            tracing::debug!(host = host, "Forging leaf certificate");
            return self.forge(host)?.into_server_config();
        };

        let now = OffsetDateTime::now_utc();
        if let Some(entry) = cache.get(host) {
            if entry.expires_at > now {
                tracing::debug!(host = host, "Using cached leaf certificate");
                return Ok(entry.config.clone());
            }
        }

        // Evict anything past its validity before adding the new entry
        cache.retain(|_, entry| entry.expires_at > now);
        while cache.len() >= self.capacity {
            // Soonest to expire is the oldest forged
            let oldest = cache
                .iter()
                .min_by_key(|entry| entry.value().expires_at)
                .map(|entry| entry.key().clone());
            match oldest {
                Some(host) => {
                    cache.remove(&host);
                }
                None => break,
            }
        }

        tracing::debug!(host = host, "Forging and caching leaf certificate");
        let leaf = self.forge(host)?;
        let expires_at = leaf.not_after;
        let config = leaf.into_server_config()?;
        cache.insert(
            host.to_string(),
            CachedLeaf {
                config: config.clone(),
                expires_at,
            },
        );

        Ok(config)
    }
}
