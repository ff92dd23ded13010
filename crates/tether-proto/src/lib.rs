//! Wire protocol for the Tether messaging transport.
//!
//! This crate owns everything that touches bytes on the wire and nothing
//! that touches a socket:
//!
//! - [`Frame`]: one application message (type tag, payload, optional
//!   metadata/extra-info maps, transform tags)
//! - [`WirePrefix`]: the fixed 13-byte frame header with zero-copy parsing
//! - [`transform`]: per-section gzip/deflate compression and AES-256-CBC
//!   encryption with PBKDF2 key derivation
//! - [`FrameAssembler`]: streaming reassembly of frames from arbitrarily
//!   chunked reads
//! - [`AuthPayload`]: the identification payload of the first client frame
//!
//! The session layer drives these; see the `tether-core` crate.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod assembler;
mod auth;
mod errors;
mod frame;
mod header;
mod kv;
mod message;
pub mod transform;

pub use assembler::{DEFAULT_MAX_FRAME_BYTES, FrameAssembler};
pub use auth::AuthPayload;
pub use errors::{ProtocolError, Result};
pub use frame::{CALLBACK_KEY, Frame, TYPE_KEY};
pub use header::{PROTOCOL_VERSION, ParsedPrefix, WirePrefix};
pub use kv::KvMap;
pub use message::{CompressionAlgo, EncryptionAlgo, FrameFlags, MessageType};
pub use transform::FrameKey;
