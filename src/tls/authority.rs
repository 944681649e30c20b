//! Root authority loading
//!
//! The root authority is the locally trusted CA used to sign forged leaf
//! certificates. It is loaded once at startup from a PEM certificate and a
//! PEM private key (PKCS#8, PKCS#1 RSA or SEC1 EC) and is read-only
//! afterwards.

use crate::error::{ProxyError, Result};
use rcgen::{Certificate, CertificateParams, KeyPair};
use rustls::pki_types::CertificateDer;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;

/// Root certificate authority used only as a signer for leaf certificates.
pub struct RootAuthority {
    /// Issuer certificate rebuilt from the loaded parameters, used by rcgen
    /// to populate the issuer name of signed leaves.
    issuer: Certificate,
    key: KeyPair,
    /// The certificate exactly as loaded from disk.
    certificate_der: CertificateDer<'static>,
    common_name: Option<String>,
}

impl RootAuthority {
    /// Load the root authority from PEM files on disk.
    pub fn from_pem_files(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();

        let cert_pem = fs::read_to_string(cert_path).map_err(|e| {
            ProxyError::RootAuthority(format!(
                "Failed to read CA certificate {}: {}",
                cert_path.display(),
                e
            ))
        })?;
        let key_pem = fs::read_to_string(key_path).map_err(|e| {
            ProxyError::RootAuthority(format!(
                "Failed to read CA key {}: {}",
                key_path.display(),
                e
            ))
        })?;

        Self::from_pem(&cert_pem, &key_pem)
    }

    /// Build the root authority from PEM-encoded strings.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let certificate_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .ok_or_else(|| ProxyError::RootAuthority("No certificate found in PEM".to_string()))?
            .map_err(|e| ProxyError::RootAuthority(format!("Failed to parse PEM: {}", e)))?;

        let key_der = rustls_pemfile::private_key(&mut key_pem.as_bytes())
            .map_err(|e| ProxyError::RootAuthority(format!("Failed to parse CA key PEM: {}", e)))?
            .ok_or_else(|| ProxyError::RootAuthority("No private key found in PEM".to_string()))?;
        let key = KeyPair::try_from(&key_der)
            .map_err(|e| ProxyError::RootAuthority(format!("Failed to parse CA key: {}", e)))?;

        let (_, parsed) = x509_parser::parse_x509_certificate(certificate_der.as_ref())
            .map_err(|e| ProxyError::RootAuthority(format!("Invalid CA certificate: {}", e)))?;

        let is_ca = parsed
            .basic_constraints()
            .ok()
            .flatten()
            .map(|ext| ext.value.ca)
            .unwrap_or(false);
        if !is_ca {
            return Err(ProxyError::RootAuthority(
                "Certificate is not a certificate authority".to_string(),
            ));
        }

        if parsed.public_key().subject_public_key.data.as_ref() != key.public_key_raw() {
            return Err(ProxyError::RootAuthority(
                "CA private key does not match the CA certificate".to_string(),
            ));
        }

        let common_name = parsed
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(str::to_string);

        let params = CertificateParams::from_ca_cert_der(&certificate_der)
            .map_err(|e| ProxyError::RootAuthority(format!("Invalid CA certificate: {}", e)))?;
        let issuer = params
            .self_signed(&key)
            .map_err(|e| ProxyError::RootAuthority(format!("Failed to rebuild issuer: {}", e)))?;

        Ok(Self {
            issuer,
            key,
            certificate_der,
            common_name,
        })
    }

    /// The root certificate in DER form, as loaded.
    pub fn certificate_der(&self) -> &CertificateDer<'static> {
        &self.certificate_der
    }

    pub fn common_name(&self) -> Option<&str> {
        self.common_name.as_deref()
    }

    /// SHA-256 fingerprint of the root certificate, colon separated.
    pub fn fingerprint(&self) -> String {
        Sha256::digest(self.certificate_der.as_ref())
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(":")
    }

    pub(crate) fn issuer(&self) -> &Certificate {
        &self.issuer
    }

    pub(crate) fn key(&self) -> &KeyPair {
        &self.key
    }
}
