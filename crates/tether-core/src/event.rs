//! User-visible events and the inbound message envelope.

use bytes::Bytes;
use tether_proto::KvMap;

use crate::{
    object::ObjectValue,
    session::{DisconnectReason, SessionInfo},
};

/// Decoded body of an inbound application frame.
#[derive(Debug, Clone)]
pub enum InboundBody {
    /// UTF-8 text message.
    Message(String),
    /// Deserialized object.
    ///
    /// Both fields are `None` when the payload could not be decoded; the
    /// connection stays up and the failure is logged.
    Object {
        /// Decoded value, if deserialization succeeded.
        object: Option<ObjectValue>,
        /// Type tag the sender attached, if deserialization succeeded.
        type_name: Option<String>,
    },
    /// Opaque bytes.
    Bytes(Bytes),
}

/// One inbound application message, as handed to dynamic callbacks and
/// default events alike.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Identity of the session the message arrived on.
    pub session: SessionInfo,
    /// Decoded body.
    pub body: InboundBody,
    /// Metadata map the sender attached (empty if none).
    pub metadata: KvMap,
}

/// Events an endpoint emits to its embedding application.
///
/// Delivered through an unbounded channel so a slow consumer can never
/// stall a receive loop. Per session, `Disconnected` strictly follows
/// every inbound event of that session.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A session was admitted and inserted.
    Connected(SessionInfo),
    /// A session ended; fires exactly once per session.
    Disconnected {
        /// Identity snapshot at teardown.
        session: SessionInfo,
        /// Why it ended.
        reason: DisconnectReason,
    },
    /// TLS handshake completed and the peer was validated.
    TlsAuthSucceeded(SessionInfo),
    /// TLS handshake failed.
    TlsAuthFailed {
        /// Identity snapshot (pre-identification).
        session: SessionInfo,
        /// Handshake error text.
        error: String,
    },
    /// Text message arrived and no dynamic callback claimed it.
    MessageReceived(InboundMessage),
    /// Object arrived and no dynamic callback claimed it.
    ObjectReceived(InboundMessage),
    /// Byte payload arrived and no dynamic callback claimed it.
    BytesReceived(InboundMessage),
}
