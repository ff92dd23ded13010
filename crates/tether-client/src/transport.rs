//! Client-side TCP connect and TLS connector construction.

use std::sync::Arc;

use tokio::net::{TcpStream, lookup_host};
use tokio_rustls::TlsConnector;

use crate::error::ClientError;

/// TLS settings for the client side.
#[derive(Debug, Clone, Default)]
pub struct TlsClientConfig {
    /// Server name for SNI and certificate validation; defaults to the
    /// host passed to `connect`.
    pub server_name: Option<String>,
    /// PEM file with the root certificate(s) to trust.
    pub ca_path: Option<String>,
    /// Skip certificate validation entirely.
    ///
    /// Development and testing only: this accepts ANY certificate,
    /// including an active man-in-the-middle's.
    pub accept_invalid_certificates: bool,
}

/// Resolve `host:port` and open a TCP connection to the first address.
pub async fn connect_tcp(host: &str, port: u16) -> Result<TcpStream, ClientError> {
    let mut addrs = lookup_host((host, port)).await?;
    let addr = addrs.next().ok_or_else(|| ClientError::Unresolvable(format!("{host}:{port}")))?;
    Ok(TcpStream::connect(addr).await?)
}

/// Build a TLS connector from the configuration.
pub fn build_connector(config: &TlsClientConfig) -> Result<TlsConnector, ClientError> {
    let tls_config = if config.accept_invalid_certificates {
        tracing::warn!("certificate validation disabled - development use only");
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureCertVerifier))
            .with_no_client_auth()
    } else {
        let mut roots = rustls::RootCertStore::empty();
        if let Some(ca_path) = &config.ca_path {
            let ca_pem = std::fs::read(ca_path)
                .map_err(|e| ClientError::Tls(format!("failed to read CA '{ca_path}': {e}")))?;
            for cert in rustls_pemfile::certs(&mut &ca_pem[..]) {
                let cert =
                    cert.map_err(|e| ClientError::Tls(format!("failed to parse CA: {e}")))?;
                roots
                    .add(cert)
                    .map_err(|e| ClientError::Tls(format!("rejected CA certificate: {e}")))?;
            }
        }
        rustls::ClientConfig::builder().with_root_certificates(roots).with_no_client_auth()
    };

    Ok(TlsConnector::from(Arc::new(tls_config)))
}

/// Certificate verifier that accepts anything (insecure, development
/// only).
#[derive(Debug)]
struct InsecureCertVerifier;

impl rustls::client::danger::ServerCertVerifier for InsecureCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insecure_connector_builds() {
        let config = TlsClientConfig { accept_invalid_certificates: true, ..Default::default() };
        assert!(build_connector(&config).is_ok());
    }

    #[test]
    fn missing_ca_file_is_a_tls_error() {
        let config = TlsClientConfig {
            ca_path: Some("/nonexistent/ca.pem".into()),
            ..Default::default()
        };
        assert!(matches!(build_connector(&config), Err(ClientError::Tls(_))));
    }

    #[tokio::test]
    async fn unresolvable_host_is_reported() {
        let result = connect_tcp("host.invalid.tether.test", 1).await;
        assert!(result.is_err());
    }
}
