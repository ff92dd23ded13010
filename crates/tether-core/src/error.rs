//! Error types for the session layer.
//!
//! Split by who handles them: [`SessionError`] feeds the per-connection
//! state machine and becomes a disconnect reason at the task boundary;
//! [`SendError`] surfaces synchronously from the send API; [`ConfigError`]
//! surfaces synchronously at setup; [`LinkError`] wraps what the I/O loops
//! can hit.

use std::io;

use thiserror::Error;

use crate::session::SessionState;

/// Setup-time configuration errors; raised synchronously to the caller.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Receive buffer below the 256-byte floor.
    #[error("receive buffer of {0} bytes is below the 256 byte minimum")]
    BufferTooSmall(usize),

    /// Inactivity timeout in the forbidden (0, 5 s) band.
    #[error("inactivity timeout of {0:?} is below the 5 second minimum (use zero for no timeout)")]
    TimeoutTooShort(std::time::Duration),

    /// Reconnect delay below the 1 second minimum.
    #[error("reconnect delay of {0} s is below the 1 second minimum")]
    ReconnectTooShort(u64),

    /// Address or host string could not be parsed/resolved.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// TLS material could not be loaded or was inconsistent.
    #[error("invalid TLS configuration: {0}")]
    InvalidTls(String),
}

/// Errors from the per-connection state machine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Frame arrived in a state that does not accept it, e.g. anything but
    /// `Auth` while identifying.
    #[error("unexpected {what} frame in state {state:?}")]
    UnexpectedFrame {
        /// What arrived.
        what: &'static str,
        /// State it arrived in.
        state: SessionState,
    },

    /// Wire-level violation bubbled up from the codec.
    #[error(transparent)]
    Protocol(#[from] tether_proto::ProtocolError),
}

/// Errors surfaced synchronously by the send API.
#[derive(Error, Debug)]
pub enum SendError {
    /// Session is not (or no longer) in a state that accepts sends.
    #[error("not connected")]
    NotConnected,

    /// Bounded send queue is at its configured depth.
    #[error("send queue is at its configured depth of {0}")]
    Backpressure(usize),

    /// The frame itself could not be encoded.
    #[error(transparent)]
    Protocol(#[from] tether_proto::ProtocolError),

    /// An object value could not be serialized for sending.
    #[error(transparent)]
    Object(#[from] crate::object::ObjectError),

    /// The write side failed after the frame was queued.
    #[error("write failed: {0}")]
    Io(String),
}

/// Errors from the link read/write loops.
#[derive(Error, Debug)]
pub enum LinkError {
    /// Socket-level failure.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The byte stream violated the wire contract.
    #[error(transparent)]
    Protocol(#[from] tether_proto::ProtocolError),
}

impl LinkError {
    /// Whether this error is a protocol violation (as opposed to an I/O
    /// failure); decides between the `ProtocolError` and `IoError`
    /// disconnect reasons.
    #[must_use]
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::Protocol(_))
    }
}
