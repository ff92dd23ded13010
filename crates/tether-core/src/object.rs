//! Pluggable object serialization seam.
//!
//! Object frames carry "some serialized value plus a type tag". The
//! library does not impose a format on users: the [`ObjectCodec`] trait is
//! the seam, and [`CborCodec`] is the default implementation (CBOR is
//! self-describing, compact, and needs no code generation). Decoded
//! objects surface as dynamic [`ObjectValue`]s; typed extraction is the
//! application's business.

use serde::Serialize;
use thiserror::Error;

/// Dynamic representation of a decoded object payload.
pub type ObjectValue = ciborium::Value;

/// Object serialization failure.
#[derive(Error, Debug)]
pub enum ObjectError {
    /// Value could not be serialized.
    #[error("object encode failed: {0}")]
    Encode(String),

    /// Payload could not be deserialized as the tagged type.
    #[error("object decode failed for type {type_name}: {message}")]
    Decode {
        /// Type tag the sender attached.
        type_name: String,
        /// Underlying codec error.
        message: String,
    },
}

/// Decodes object payloads by type tag.
///
/// Implementations must be cheap to call concurrently; one instance is
/// shared by every session of an endpoint.
pub trait ObjectCodec: Send + Sync {
    /// Decode `payload` as the type named by `type_name`.
    fn decode(&self, type_name: &str, payload: &[u8]) -> Result<ObjectValue, ObjectError>;
}

/// Default CBOR codec.
///
/// CBOR is self-describing, so the type tag is carried for the
/// application's benefit and not needed to parse the bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct CborCodec;

impl ObjectCodec for CborCodec {
    fn decode(&self, type_name: &str, payload: &[u8]) -> Result<ObjectValue, ObjectError> {
        ciborium::de::from_reader(payload).map_err(|e| ObjectError::Decode {
            type_name: type_name.to_owned(),
            message: e.to_string(),
        })
    }
}

/// Serialize a value for an object frame; returns the payload bytes and
/// the type tag (the Rust type path).
pub fn encode_object<T: Serialize>(value: &T) -> Result<(Vec<u8>, String), ObjectError> {
    let mut payload = Vec::new();
    ciborium::ser::into_writer(value, &mut payload)
        .map_err(|e| ObjectError::Encode(e.to_string()))?;
    Ok((payload, std::any::type_name::<T>().to_owned()))
}
