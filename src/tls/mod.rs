//! TLS material for intercepted tunnels: the root authority, leaf forging
//! and the rustls configurations for both legs.

pub mod authority;
pub mod forge;
pub mod verifier;

pub use authority::RootAuthority;
pub use forge::{forge, strip_port, CertificateForge, LeafCertificate};
pub use verifier::{origin_client_config, AcceptAnyServerCert};
