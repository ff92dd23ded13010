//! Session layer of the Tether messaging transport.
//!
//! Everything between the wire codec (`tether-proto`) and the endpoint
//! crates (`tether-server`, `tether-client`) lives here:
//!
//! - [`Session`]: the per-connection lifecycle state machine, in the
//!   action pattern - methods take time as input and return actions for
//!   the driver to execute, keeping the logic pure and testable
//! - [`PolicySet`]: whitelist/blacklist/limit admission rules
//! - [`Dispatcher`] + [`CallbackTable`]: inbound routing to dynamic
//!   callbacks or default events, with panic isolation around user code
//! - [`SendQueue`]: ordered outbound delivery, one frame in flight
//! - [`FrameStream`] / [`run_writer`]: the async I/O loops both endpoint
//!   crates drive, generic over the stream type so TCP and TLS share them
//!
//! The endpoint crates own sockets, TLS, and task spawning; nothing in
//! this crate opens a connection.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
mod dispatch;
mod error;
mod event;
mod link;
mod object;
mod policy;
mod queue;
mod session;

pub use config::{SendOptions, SessionLimits, receive_buffer_size, set_receive_buffer_size};
pub use dispatch::{CallbackTable, Dispatcher, DynamicHandler};
pub use error::{ConfigError, LinkError, SendError, SessionError};
pub use event::{InboundBody, InboundMessage, PeerEvent};
pub use link::{FrameStream, run_writer};
pub use object::{CborCodec, ObjectCodec, ObjectError, ObjectValue, encode_object};
pub use policy::PolicySet;
pub use queue::{QueuedFrame, SendLane, SendQueue, SendQueueReceiver, send_queue};
pub use session::{DisconnectReason, Session, SessionAction, SessionInfo, SessionState};
