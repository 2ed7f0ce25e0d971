//! Certificate material: self-signed generation and PEM loading.

use crate::config::TlsConfig;
use crate::tls::TlsError;
use rcgen::{CertificateParams, DnType, KeyPair, SanType};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

/// A certificate chain with its private key.
pub struct CertificateMaterial {
    pub certs: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
    /// PEM rendering of the leaf certificate, kept for generated material so
    /// it can be pinned as a root by strict-validation clients.
    pub cert_pem: Option<String>,
}

impl CertificateMaterial {
    /// Resolve certificate material from configuration: load the configured
    /// PEM files when present, otherwise generate a self-signed certificate.
    pub fn from_config(tls: &TlsConfig) -> Result<Self, TlsError> {
        match (&tls.cert, &tls.key) {
            (Some(cert), Some(key)) => Ok(Self {
                certs: load_certs(cert)?,
                key: load_private_key(key)?,
                cert_pem: None,
            }),
            _ => obtain_certificate(&tls.common_name, tls.validity),
        }
    }
}

/// Generate a self-signed certificate for the given common name, valid for
/// `validity` from now. SANs cover the common name, `localhost` and
/// `127.0.0.1` so loopback demo endpoints verify under a pinned root.
pub fn obtain_certificate(
    common_name: &str,
    validity: Duration,
) -> Result<CertificateMaterial, TlsError> {
    let key_pair = KeyPair::generate().map_err(|e| TlsError::Generation(e.to_string()))?;

    let mut params =
        CertificateParams::new(vec![common_name.to_string(), "localhost".to_string()])
            .map_err(|e| TlsError::Generation(e.to_string()))?;
    params
        .subject_alt_names
        .push(SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)));
    params
        .distinguished_name
        .push(DnType::CommonName, common_name);

    let now = time::OffsetDateTime::now_utc();
    let validity = time::Duration::try_from(validity)
        .map_err(|e| TlsError::Generation(format!("validity out of range: {e}")))?;
    // Backdated a day so clock skew between peers cannot reject a fresh cert.
    params.not_before = now - time::Duration::days(1);
    params.not_after = now + validity;

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| TlsError::Generation(e.to_string()))?;

    Ok(CertificateMaterial {
        certs: vec![cert.der().clone()],
        key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der())),
        cert_pem: Some(cert.pem()),
    })
}

/// Load a TLS certificate chain from a PEM file.
pub fn load_certs<P: AsRef<Path>>(path: P) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let path = path.as_ref();
    let display = path.display().to_string();

    let file = std::fs::File::open(path).map_err(|e| TlsError::ReadError(display.clone(), e))?;
    let mut reader = std::io::BufReader::new(file);

    let certs: Vec<_> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::ReadError(display.clone(), e))?;

    if certs.is_empty() {
        return Err(TlsError::EmptyCertFile(display));
    }
    Ok(certs)
}

/// Load a TLS private key from a PEM file.
pub fn load_private_key<P: AsRef<Path>>(path: P) -> Result<PrivateKeyDer<'static>, TlsError> {
    let path = path.as_ref();
    let display = path.display().to_string();

    let file = std::fs::File::open(path).map_err(|e| TlsError::ReadError(display.clone(), e))?;
    let mut reader = std::io::BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TlsError::ReadError(display.clone(), e))?
        .ok_or(TlsError::MissingKey(display))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_obtain_certificate() {
        let material = obtain_certificate("grelay-test", Duration::from_secs(3600)).unwrap();
        assert_eq!(material.certs.len(), 1);
        assert!(!material.certs[0].as_ref().is_empty());
        assert!(matches!(material.key, PrivateKeyDer::Pkcs8(_)));
    }

    #[test]
    fn test_load_certs_missing_file() {
        let result = load_certs("/nonexistent/cert.pem");
        assert!(matches!(result, Err(TlsError::ReadError(_, _))));
    }

    #[test]
    fn test_load_private_key_missing_file() {
        let result = load_private_key("/nonexistent/key.pem");
        assert!(matches!(result, Err(TlsError::ReadError(_, _))));
    }

    #[test]
    fn test_from_config_generates_when_no_paths() {
        let material = CertificateMaterial::from_config(&TlsConfig::default()).unwrap();
        assert_eq!(material.certs.len(), 1);
    }
}
