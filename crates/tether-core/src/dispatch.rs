//! Inbound frame dispatch.
//!
//! The dispatcher turns decoded application frames into user-visible
//! events. Routing order: a frame carrying a registered dynamic-callback
//! key goes to that handler and suppresses the default event; everything
//! else becomes the default event for its message type. Auth and KeepAlive
//! never reach the dispatcher - the session state machine consumes them.
//!
//! User handlers are untrusted: panics are caught at this boundary,
//! logged, and never propagate into the receive loop.

use std::{
    collections::HashMap,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Arc, RwLock},
};

use tether_proto::{Frame, MessageType, ProtocolError};
use tokio::sync::mpsc;

use crate::{
    event::{InboundBody, InboundMessage, PeerEvent},
    object::ObjectCodec,
    session::SessionInfo,
};

/// A user-registered dynamic callback.
pub type DynamicHandler = Arc<dyn Fn(InboundMessage) + Send + Sync>;

/// Registry of dynamic callbacks, keyed by the string carried in a frame's
/// extra-info section.
#[derive(Default)]
pub struct CallbackTable {
    handlers: RwLock<HashMap<String, DynamicHandler>>,
}

impl CallbackTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under `key`, replacing any previous one.
    pub fn register(&self, key: impl Into<String>, handler: impl Fn(InboundMessage) + Send + Sync + 'static) {
        if let Ok(mut handlers) = self.handlers.write() {
            handlers.insert(key.into(), Arc::new(handler));
        }
    }

    /// Remove the handler under `key`. Returns whether one was registered.
    pub fn unregister(&self, key: &str) -> bool {
        self.handlers.write().map(|mut h| h.remove(key).is_some()).unwrap_or(false)
    }

    fn lookup(&self, key: &str) -> Option<DynamicHandler> {
        // Clone the Arc out so the handler runs without holding the lock;
        // handlers may themselves register or unregister callbacks.
        self.handlers.read().ok().and_then(|h| h.get(key).cloned())
    }
}

/// Routes decoded frames to dynamic callbacks or default events.
///
/// Shared across all sessions of a server; singleton on a client.
pub struct Dispatcher {
    callbacks: Arc<CallbackTable>,
    codec: Arc<dyn ObjectCodec>,
    events: mpsc::UnboundedSender<PeerEvent>,
}

impl Dispatcher {
    /// Create a dispatcher emitting default events into `events`.
    pub fn new(
        callbacks: Arc<CallbackTable>,
        codec: Arc<dyn ObjectCodec>,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        Self { callbacks, codec, events }
    }

    /// Emit a lifecycle event (connected, disconnected, TLS outcome).
    pub fn emit(&self, event: PeerEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!("event receiver dropped; event discarded");
        }
    }

    /// Route one application frame.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::MalformedFrame`] if a `Message` payload is not
    /// UTF-8; the caller closes the connection. Object decode failures are
    /// NOT errors - they surface as an `ObjectReceived` event with an
    /// empty object, and the connection stays up.
    pub fn dispatch(&self, session: SessionInfo, frame: Frame) -> Result<(), ProtocolError> {
        let callback_key = frame.callback_key().map(str::to_owned);
        let metadata = frame.metadata.clone().unwrap_or_default();

        let body = match frame.msg_type {
            MessageType::Message => {
                let text = String::from_utf8(frame.payload.to_vec()).map_err(|_| {
                    ProtocolError::MalformedFrame("message payload is not valid UTF-8".into())
                })?;
                InboundBody::Message(text)
            },
            MessageType::Object => self.decode_object(&frame),
            MessageType::Bytes => InboundBody::Bytes(frame.payload.clone()),
            MessageType::Auth | MessageType::KeepAlive => {
                // Consumed by the state machine before dispatch.
                return Ok(());
            },
        };

        let message = InboundMessage { session, body, metadata };

        if let Some(key) = callback_key {
            if let Some(handler) = self.callbacks.lookup(&key) {
                invoke_guarded(&key, &handler, message);
                return Ok(());
            }
            tracing::debug!(key = %key, "no dynamic callback registered; using default event");
        }

        let event = match &message.body {
            InboundBody::Message(_) => PeerEvent::MessageReceived(message),
            InboundBody::Object { .. } => PeerEvent::ObjectReceived(message),
            InboundBody::Bytes(_) => PeerEvent::BytesReceived(message),
        };
        self.emit(event);
        Ok(())
    }

    fn decode_object(&self, frame: &Frame) -> InboundBody {
        let Some(type_name) = frame.object_type().map(str::to_owned) else {
            tracing::error!("object frame without a Type entry in extra-info");
            return InboundBody::Object { object: None, type_name: None };
        };

        match self.codec.decode(&type_name, &frame.payload) {
            Ok(object) => InboundBody::Object { object: Some(object), type_name: Some(type_name) },
            Err(e) => {
                tracing::error!(error = %e, "object payload failed to deserialize");
                InboundBody::Object { object: None, type_name: None }
            },
        }
    }
}

fn invoke_guarded(key: &str, handler: &DynamicHandler, message: InboundMessage) {
    if catch_unwind(AssertUnwindSafe(|| handler(message))).is_err() {
        tracing::error!(key = %key, "dynamic callback panicked; connection unaffected");
    }
}
