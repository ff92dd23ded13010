//! TCP listener and TLS acceptor construction.
//!
//! The listener binds to a textual IP (`""` or `"*"` mean "any") and a
//! port. TLS is optional: certificate and key come from PEM files, or a
//! self-signed certificate is generated for testing. Client certificates
//! can be required and verified against a provided root store.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
};

use tether_core::ConfigError;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

use crate::error::ServerError;

/// TLS settings for the server side.
#[derive(Debug, Clone, Default)]
pub struct TlsServerConfig {
    /// Path to the certificate chain (PEM). `None` generates a
    /// self-signed certificate - testing only.
    pub cert_path: Option<String>,
    /// Path to the private key (PEM).
    pub key_path: Option<String>,
    /// Require and verify client certificates (mutual TLS).
    pub client_ca_path: Option<String>,
}

/// Bound TCP listener.
pub struct Listener {
    inner: TcpListener,
}

impl Listener {
    /// Bind to `ip:port` with the given accept backlog. An empty or `"*"`
    /// ip resolves to the unspecified address.
    pub fn bind(ip: &str, port: u16, backlog: usize) -> Result<Self, ServerError> {
        let ip: IpAddr = match ip {
            "" | "*" => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            other => other
                .parse()
                .map_err(|_| ConfigError::InvalidAddress(format!("invalid listen ip '{other}'")))?,
        };
        let addr = SocketAddr::new(ip, port);

        // socket2 instead of TcpListener::bind so the backlog can follow
        // the configured connection limit.
        let socket = socket2::Socket::new(
            socket2::Domain::for_address(addr),
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(backlog.min(i32::MAX as usize) as i32)?;

        let inner = TcpListener::from_std(socket.into())?;
        tracing::info!(addr = %inner.local_addr()?, backlog, "listener bound");
        Ok(Self { inner })
    }

    /// Accept the next connection.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), ServerError> {
        Ok(self.inner.accept().await?)
    }

    /// Local address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.inner.local_addr()?)
    }
}

/// Build a TLS acceptor from the configuration.
pub fn build_acceptor(config: &TlsServerConfig) -> Result<TlsAcceptor, ServerError> {
    let (certs, key) = match (&config.cert_path, &config.key_path) {
        (Some(cert), Some(key)) => load_cert_and_key(cert, key)?,
        _ => generate_self_signed()?,
    };

    let builder = match &config.client_ca_path {
        Some(ca_path) => {
            let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(
                load_root_store(ca_path)?,
            ))
            .build()
            .map_err(|e| ServerError::Tls(format!("client verifier: {e}")))?;
            rustls::ServerConfig::builder().with_client_cert_verifier(verifier)
        },
        None => rustls::ServerConfig::builder().with_no_client_auth(),
    };

    let tls_config = builder
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::Tls(format!("invalid certificate/key pair: {e}")))?;

    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

fn load_cert_and_key(
    cert_path: &str,
    key_path: &str,
) -> Result<
    (Vec<rustls::pki_types::CertificateDer<'static>>, rustls::pki_types::PrivateKeyDer<'static>),
    ServerError,
> {
    let cert_pem = std::fs::read(cert_path)
        .map_err(|e| ServerError::Tls(format!("failed to read cert '{cert_path}': {e}")))?;
    let key_pem = std::fs::read(key_path)
        .map_err(|e| ServerError::Tls(format!("failed to read key '{key_path}': {e}")))?;

    let certs = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ServerError::Tls(format!("failed to parse certificates: {e}")))?;

    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| ServerError::Tls(format!("failed to parse private key: {e}")))?
        .ok_or_else(|| ServerError::Tls(format!("no private key found in '{key_path}'")))?;

    Ok((certs, key))
}

fn generate_self_signed() -> Result<
    (Vec<rustls::pki_types::CertificateDer<'static>>, rustls::pki_types::PrivateKeyDer<'static>),
    ServerError,
> {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .map_err(|e| ServerError::Tls(format!("failed to generate self-signed cert: {e}")))?;

    let cert_der = cert.cert.der().clone();
    let key_der = rustls::pki_types::PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());

    tracing::warn!("using a self-signed certificate - not for production use");
    Ok((vec![cert_der], key_der.into()))
}

fn load_root_store(ca_path: &str) -> Result<rustls::RootCertStore, ServerError> {
    let ca_pem = std::fs::read(ca_path)
        .map_err(|e| ServerError::Tls(format!("failed to read client CA '{ca_path}': {e}")))?;

    let mut store = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut &ca_pem[..]) {
        let cert = cert.map_err(|e| ServerError::Tls(format!("failed to parse client CA: {e}")))?;
        store
            .add(cert)
            .map_err(|e| ServerError::Tls(format!("rejected client CA certificate: {e}")))?;
    }
    Ok(store)
}
