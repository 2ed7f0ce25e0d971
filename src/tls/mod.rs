//! Transport security: certificate material and rustls configuration.
//!
//! Both listeners terminate TLS with ALPN restricted to `h2`; there is no
//! protocol downgrade. Outbound connections (proxy to upstream, scenario
//! clients) verify certificates per the configured validation policy.

mod cert;
mod verify;

pub use cert::{CertificateMaterial, load_certs, load_private_key, obtain_certificate};

use crate::config::{TlsConfig, ValidationPolicy};
use std::sync::Arc;
use thiserror::Error;

/// TLS setup error. Fatal at startup.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("certificate generation failed: {0}")]
    Generation(String),

    #[error("failed to read {0}: {1}")]
    ReadError(String, std::io::Error),

    #[error("no certificates found in {0}")]
    EmptyCertFile(String),

    #[error("no private key found in {0}")]
    MissingKey(String),

    #[error("strict validation requires a root CA bundle")]
    MissingRootCa,

    #[error("rustls rejected the configuration: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Build the server-side TLS configuration (ALPN: h2 only).
pub fn server_config(material: &CertificateMaterial) -> Result<Arc<rustls::ServerConfig>, TlsError> {
    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(material.certs.clone(), material.key.clone_key())?;
    config.alpn_protocols = vec![b"h2".to_vec()];
    Ok(Arc::new(config))
}

/// Build the client-side TLS configuration for the given validation policy
/// (ALPN: h2 only).
pub fn client_config(tls: &TlsConfig) -> Result<Arc<rustls::ClientConfig>, TlsError> {
    let mut config = match tls.validation {
        ValidationPolicy::AcceptAny => rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verify::AcceptAnyServerCert))
            .with_no_client_auth(),
        ValidationPolicy::Strict => {
            let ca = tls.ca.as_ref().ok_or(TlsError::MissingRootCa)?;
            let mut roots = rustls::RootCertStore::empty();
            for cert in load_certs(ca)? {
                roots.add(cert)?;
            }
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        }
    };
    config.alpn_protocols = vec![b"h2".to_vec()];
    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_server_config_from_generated_material() {
        let material =
            obtain_certificate("grelay-test", Duration::from_secs(24 * 60 * 60)).unwrap();
        let config = server_config(&material).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"h2".to_vec()]);
    }

    #[test]
    fn test_accept_any_client_config() {
        let config = client_config(&TlsConfig::default()).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"h2".to_vec()]);
    }

    #[test]
    fn test_strict_without_ca_is_rejected() {
        let tls = TlsConfig {
            validation: ValidationPolicy::Strict,
            ..TlsConfig::default()
        };
        assert!(matches!(client_config(&tls), Err(TlsError::MissingRootCa)));
    }
}
