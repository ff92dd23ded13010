//! Client error types.

use thiserror::Error;

/// Errors the client surfaces to its embedding application.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Invalid configuration (reconnect delay, TLS material, identity).
    #[error("configuration error: {0}")]
    Config(#[from] tether_core::ConfigError),

    /// Hostname did not resolve to any address.
    #[error("'{0}' did not resolve to any address")]
    Unresolvable(String),

    /// Socket-level failure.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame-level failure while setting up the connection.
    #[error(transparent)]
    Protocol(#[from] tether_proto::ProtocolError),

    /// TLS setup or handshake failure.
    #[error("tls error: {0}")]
    Tls(String),

    /// `connect` called while a connection loop is already running.
    #[error("client is already connected or connecting")]
    AlreadyConnected,

    /// The connection did not reach ready within the given time.
    #[error("not ready within {0:?}")]
    ReadyTimeout(std::time::Duration),
}
