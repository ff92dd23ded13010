//! Timeouts, limits, send options, and the process-wide receive buffer.

use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use tether_proto::{CompressionAlgo, EncryptionAlgo, KvMap};

use crate::error::ConfigError;

/// Grace period for a client to send its Auth frame.
pub const DEFAULT_IDENTIFICATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Smallest permitted non-zero inactivity timeout.
pub const MIN_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval of the client's liveness probe.
pub const KEEPALIVE_PROBE_INTERVAL: Duration = Duration::from_secs(15);

/// Default client reconnect delay in seconds.
pub const DEFAULT_RECONNECT_SECS: u64 = 5;

/// Smallest permitted reconnect delay in seconds.
pub const MIN_RECONNECT_SECS: u64 = 1;

/// Default cap on concurrent server sessions.
pub const DEFAULT_MAX_CONNECTIONS: usize = 500;

/// Floor for the receive buffer size.
pub const MIN_RECEIVE_BUFFER: usize = 256;

/// Default receive buffer size per raw read.
pub const DEFAULT_RECEIVE_BUFFER: usize = 4096;

// The one intentionally process-global knob. Reconfigurable at runtime,
// but a running session keeps the size it was created with.
static RECEIVE_BUFFER_SIZE: AtomicUsize = AtomicUsize::new(DEFAULT_RECEIVE_BUFFER);

/// Set the process-wide receive buffer size.
///
/// Takes effect for sessions created afterwards; live sessions keep their
/// buffer.
///
/// # Errors
///
/// [`ConfigError::BufferTooSmall`] below the 256-byte floor.
pub fn set_receive_buffer_size(bytes: usize) -> Result<(), ConfigError> {
    if bytes < MIN_RECEIVE_BUFFER {
        return Err(ConfigError::BufferTooSmall(bytes));
    }
    RECEIVE_BUFFER_SIZE.store(bytes, Ordering::Relaxed);
    Ok(())
}

/// Current process-wide receive buffer size.
#[must_use]
pub fn receive_buffer_size() -> usize {
    RECEIVE_BUFFER_SIZE.load(Ordering::Relaxed)
}

/// Per-session limits, fixed at session creation.
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    /// Cap on a single frame's total body length.
    pub max_frame_bytes: usize,
    /// Grace period for the identification exchange.
    pub identification_timeout: Duration,
    /// Inactivity timeout; zero means no timeout.
    pub inactivity_timeout: Duration,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_frame_bytes: tether_proto::DEFAULT_MAX_FRAME_BYTES,
            identification_timeout: DEFAULT_IDENTIFICATION_TIMEOUT,
            inactivity_timeout: Duration::ZERO,
        }
    }
}

impl SessionLimits {
    /// Validate the inactivity timeout band: zero (infinite) or ≥ 5 s.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.inactivity_timeout.is_zero() && self.inactivity_timeout < MIN_INACTIVITY_TIMEOUT {
            return Err(ConfigError::TimeoutTooShort(self.inactivity_timeout));
        }
        Ok(())
    }
}

/// Options for a single send, collapsing the historical overload surface
/// into one struct.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Metadata map surfaced verbatim to the peer handler.
    pub metadata: Option<KvMap>,
    /// Extra-info entries to merge into the frame.
    pub extra_info: Option<KvMap>,
    /// Route the peer's inbound event to this named handler instead of the
    /// default event.
    pub dynamic_callback_key: Option<String>,
    /// Wire compression.
    pub compression: CompressionAlgo,
    /// Wire encryption.
    pub encryption: EncryptionAlgo,
}

impl SendOptions {
    /// Attach a metadata map.
    #[must_use]
    pub fn with_metadata(mut self, metadata: KvMap) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Route to a named dynamic callback on the receiver.
    #[must_use]
    pub fn with_callback_key(mut self, key: impl Into<String>) -> Self {
        self.dynamic_callback_key = Some(key.into());
        self
    }

    /// Set wire compression.
    #[must_use]
    pub fn with_compression(mut self, algo: CompressionAlgo) -> Self {
        self.compression = algo;
        self
    }

    /// Set wire encryption.
    #[must_use]
    pub fn with_encryption(mut self, algo: EncryptionAlgo) -> Self {
        self.encryption = algo;
        self
    }

    /// Apply these options to a bare frame.
    #[must_use]
    pub fn apply(self, mut frame: tether_proto::Frame) -> tether_proto::Frame {
        if let Some(metadata) = self.metadata {
            frame = frame.with_metadata(metadata);
        }
        if let Some(extra) = self.extra_info {
            frame = frame.with_extra_info(extra);
        }
        if let Some(key) = self.dynamic_callback_key {
            frame = frame.with_callback_key(key);
        }
        frame.with_compression(self.compression).with_encryption(self.encryption)
    }
}
