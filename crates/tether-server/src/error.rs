//! Server error types.

use thiserror::Error;

/// Errors the server surfaces to its embedding application.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Invalid configuration (address, policy, buffer, TLS material).
    /// Fatal at setup; fix and retry.
    #[error("configuration error: {0}")]
    Config(#[from] tether_core::ConfigError),

    /// Socket-level failure (bind, accept).
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS material could not be loaded or the acceptor could not be
    /// built.
    #[error("tls error: {0}")]
    Tls(String),

    /// `listen` called twice.
    #[error("server is already listening")]
    AlreadyListening,

    /// Addressed session does not exist (wrong id or already gone).
    #[error("no session with id {0}")]
    UnknownSession(u64),
}
