//! TCP/TLS client endpoint for the Tether messaging transport.
//!
//! One [`Client`] maintains one logical connection to one server and
//! exposes the capability symmetric to the server side: sends with
//! options, dynamic callbacks, and an event stream. The connection loop
//! resolves the host, connects (optionally through TLS), identifies
//! itself with an Auth frame as its very first frame, and then exchanges
//! application frames until the link drops - at which point it waits the
//! configured reconnect delay and tries again, until [`Client::disconnect`]
//! cancels it.
//!
//! Liveness: every 15 s in the ready state the client enqueues a
//! KeepAlive probe. On a half-open link the probe's write is what
//! surfaces the broken pipe; the read loop catches full closes (FIN)
//! immediately.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod transport;

use std::{
    sync::{
        Arc, Mutex as StdMutex,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
pub use error::ClientError;
use serde::Serialize;
use tether_core::{
    CallbackTable, CborCodec, DisconnectReason, Dispatcher, FrameStream, InboundMessage,
    ObjectCodec, PeerEvent, SendError, SendLane, SendOptions, SendQueue, Session, SessionAction,
    SessionInfo, SessionLimits,
    config::{KEEPALIVE_PROBE_INTERVAL, MIN_RECONNECT_SECS},
    encode_object, receive_buffer_size, run_writer, send_queue,
};
use tether_proto::{AuthPayload, Frame, FrameKey};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    sync::{Mutex, mpsc, oneshot, watch},
};
use tokio_util::sync::CancellationToken;
pub use transport::{TlsClientConfig, build_connector, connect_tcp};

/// Identity announced in the Auth frame.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    /// Human-readable client name.
    pub name: String,
    /// Stable identifier; random if not supplied.
    pub guid: String,
    /// Informational user/domain string.
    pub user_domain: String,
    /// Informational OS description.
    pub os_version: String,
}

impl Default for ClientIdentity {
    fn default() -> Self {
        Self {
            name: String::new(),
            guid: random_guid(),
            user_domain: String::new(),
            os_version: std::env::consts::OS.to_owned(),
        }
    }
}

fn random_guid() -> String {
    format!("{:032x}", rand::random::<u128>())
}

/// Client configuration, fixed once [`Client::connect`] is called.
pub struct ClientConfig {
    /// Identity sent in the Auth frame.
    pub identity: ClientIdentity,
    /// Per-session limits (frame size cap, timeouts).
    pub limits: SessionLimits,
    /// Passphrase for frame encryption; derives the AES key once.
    pub passphrase: Option<String>,
    /// Bound on the send queue. `None` = unbounded.
    pub max_queue_depth: Option<usize>,
    /// TLS settings; `None` runs plain TCP.
    pub tls: Option<TlsClientConfig>,
    /// Codec for inbound object payloads.
    pub object_codec: Arc<dyn ObjectCodec>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            identity: ClientIdentity::default(),
            limits: SessionLimits::default(),
            passphrase: None,
            max_queue_depth: None,
            tls: None,
            object_codec: Arc::new(CborCodec),
        }
    }
}

struct ActiveLink {
    queue: SendQueue,
    cancel: CancellationToken,
}

struct Shared {
    identity: ClientIdentity,
    limits: SessionLimits,
    key: Option<FrameKey>,
    max_queue_depth: Option<usize>,
    tls: Option<TlsClientConfig>,
    callbacks: Arc<CallbackTable>,
    dispatcher: Dispatcher,
    link: Mutex<Option<ActiveLink>>,
    connected: watch::Sender<bool>,
    running: AtomicBool,
    cancel: CancellationToken,
}

/// The client endpoint.
pub struct Client {
    shared: Arc<Shared>,
    events: StdMutex<Option<mpsc::UnboundedReceiver<PeerEvent>>>,
}

impl Client {
    /// Create a client from configuration.
    pub fn new(config: ClientConfig) -> Self {
        let key = config.passphrase.as_deref().map(FrameKey::derive);
        let callbacks = Arc::new(CallbackTable::new());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(Arc::clone(&callbacks), config.object_codec, events_tx);
        let (connected, _) = watch::channel(false);

        Self {
            shared: Arc::new(Shared {
                identity: config.identity,
                limits: config.limits,
                key,
                max_queue_depth: config.max_queue_depth,
                tls: config.tls,
                callbacks,
                dispatcher,
                link: Mutex::new(None),
                connected,
                running: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
            events: StdMutex::new(Some(events_rx)),
        }
    }

    /// Start the connection loop against `host:port`.
    ///
    /// Returns immediately; watch [`Client::events`] or
    /// [`Client::wait_until_ready`] for progress. On every disconnection
    /// the loop waits `reconnect_secs` (minimum 1) and retries, until
    /// [`Client::disconnect`].
    pub fn connect(&self, host: &str, port: u16, reconnect_secs: u64) -> Result<(), ClientError> {
        if reconnect_secs < MIN_RECONNECT_SECS {
            return Err(tether_core::ConfigError::ReconnectTooShort(reconnect_secs).into());
        }
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Err(ClientError::AlreadyConnected);
        }

        tokio::spawn(run_loop(
            Arc::clone(&self.shared),
            host.to_owned(),
            port,
            Duration::from_secs(reconnect_secs),
        ));
        Ok(())
    }

    /// Stop the connection loop and close any live link.
    pub fn disconnect(&self) {
        self.shared.cancel.cancel();
    }

    /// Take the event receiver. Yields `Some` exactly once.
    pub fn events(&self) -> Option<mpsc::UnboundedReceiver<PeerEvent>> {
        self.events.lock().ok().and_then(|mut guard| guard.take())
    }

    /// Whether the link is currently ready.
    #[must_use]
    pub fn connected(&self) -> bool {
        *self.shared.connected.subscribe().borrow()
    }

    /// This client's GUID as announced to the server.
    #[must_use]
    pub fn guid(&self) -> &str {
        &self.shared.identity.guid
    }

    /// Wait until the link is ready, up to `timeout`.
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<(), ClientError> {
        let mut rx = self.shared.connected.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|ready| *ready))
            .await
            .map_err(|_| ClientError::ReadyTimeout(timeout))?
            .map_err(|_| ClientError::ReadyTimeout(timeout))?;
        Ok(())
    }

    /// Register a dynamic callback under `key`.
    pub fn register_callback(
        &self,
        key: impl Into<String>,
        handler: impl Fn(InboundMessage) + Send + Sync + 'static,
    ) {
        self.shared.callbacks.register(key, handler);
    }

    /// Unregister the dynamic callback under `key`.
    pub fn unregister_callback(&self, key: &str) -> bool {
        self.shared.callbacks.unregister(key)
    }

    /// Send a text message; resolves once the bytes reach the socket
    /// buffer.
    pub async fn send_message(&self, text: &str, options: SendOptions) -> Result<(), SendError> {
        self.send_frame(options.apply(Frame::message(text))).await
    }

    /// Send an opaque byte payload.
    pub async fn send_bytes(
        &self,
        data: impl Into<Bytes>,
        options: SendOptions,
    ) -> Result<(), SendError> {
        self.send_frame(options.apply(Frame::bytes(data.into()))).await
    }

    /// Serialize and send an object.
    pub async fn send_object<T: Serialize>(
        &self,
        value: &T,
        options: SendOptions,
    ) -> Result<(), SendError> {
        let (payload, type_name) = encode_object(value)?;
        self.send_frame(options.apply(Frame::object(payload, type_name))).await
    }

    async fn send_frame(&self, frame: Frame) -> Result<(), SendError> {
        let queue = {
            let link = self.shared.link.lock().await;
            link.as_ref().ok_or(SendError::NotConnected)?.queue.clone()
        };

        let bytes = frame.encode(self.shared.key.as_ref())?;
        let (done_tx, done_rx) = oneshot::channel();
        queue.enqueue(bytes, SendLane::Data, Some(done_tx))?;
        done_rx.await.map_err(|_| SendError::NotConnected)?
    }
}

async fn run_loop(shared: Arc<Shared>, host: String, port: u16, delay: Duration) {
    loop {
        if shared.cancel.is_cancelled() {
            break;
        }

        if let Err(e) = connect_once(&shared, &host, port).await {
            tracing::warn!(error = %e, host = %host, port, "connection attempt failed");
        }

        if shared.cancel.is_cancelled() {
            break;
        }
        tracing::debug!(?delay, "scheduling reconnect");
        tokio::select! {
            () = shared.cancel.cancelled() => break,
            () = tokio::time::sleep(delay) => {},
        }
    }
    shared.connected.send_replace(false);
}

async fn connect_once(shared: &Arc<Shared>, host: &str, port: u16) -> Result<(), ClientError> {
    let stream = connect_tcp(host, port).await?;
    let peer = stream.peer_addr()?;

    match shared.tls.clone() {
        Some(tls) => {
            let connector = build_connector(&tls)?;
            let name = tls.server_name.unwrap_or_else(|| host.to_owned());
            let server_name = rustls::pki_types::ServerName::try_from(name)
                .map_err(|e| ClientError::Tls(format!("invalid server name: {e}")))?;

            match connector.connect(server_name, stream).await {
                Ok(tls_stream) => {
                    shared.dispatcher.emit(PeerEvent::TlsAuthSucceeded(own_info(shared, peer)));
                    let (read, write) = tokio::io::split(tls_stream);
                    drive(shared, peer, true, read, write).await
                },
                Err(e) => {
                    shared.dispatcher.emit(PeerEvent::TlsAuthFailed {
                        session: own_info(shared, peer),
                        error: e.to_string(),
                    });
                    Err(ClientError::Tls(e.to_string()))
                },
            }
        },
        None => {
            let (read, write) = stream.into_split();
            drive(shared, peer, false, read, write).await
        },
    }
}

async fn drive<R, W>(
    shared: &Arc<Shared>,
    peer: std::net::SocketAddr,
    tls: bool,
    read: R,
    mut write: W,
) -> Result<(), ClientError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let now = Instant::now();
    let mut session = Session::new(0, peer, tls, shared.limits, now);
    session.begin(now);
    if tls {
        session.tls_completed(now);
    }

    // Identification: the Auth frame is the first thing on the wire,
    // written directly before the queue-draining writer takes over.
    let auth_frame = Frame::auth(&AuthPayload {
        name: shared.identity.name.clone(),
        guid: shared.identity.guid.clone(),
        user_domain: shared.identity.user_domain.clone(),
        os_version: shared.identity.os_version.clone(),
    })?;
    let auth_bytes = auth_frame.encode(shared.key.as_ref())?;
    write.write_all(&auth_bytes).await?;
    write.flush().await?;

    // Run our own Auth through the machine: Identifying → Ready, identity
    // fields recorded. Cannot fail - we built the frame from valid fields.
    let _ = session.handle_frame(auth_frame, now);

    let link_cancel = shared.cancel.child_token();
    let (queue, queue_rx) = send_queue(shared.max_queue_depth);
    let (_ready_tx, ready_rx) = watch::channel(true);

    *shared.link.lock().await = Some(ActiveLink { queue: queue.clone(), cancel: link_cancel.clone() });
    shared.connected.send_replace(true);
    shared.dispatcher.emit(PeerEvent::Connected(session.info()));
    tracing::info!(peer = %peer, guid = %shared.identity.guid, "connected and identified");

    let mut writer = tokio::spawn(run_writer(write, queue_rx, ready_rx, link_cancel.clone()));
    let mut frames = FrameStream::new(
        read,
        shared.key.clone(),
        shared.limits.max_frame_bytes,
        receive_buffer_size(),
    );

    // First probe one interval out, then steady-state.
    let mut probe = tokio::time::interval_at(
        tokio::time::Instant::now() + KEEPALIVE_PROBE_INTERVAL,
        KEEPALIVE_PROBE_INTERVAL,
    );
    probe.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let reason = 'drive: loop {
        tokio::select! {
            () = link_cancel.cancelled() => break 'drive DisconnectReason::Normal,

            // Writer only exits early on a write failure (or cancel).
            _ = &mut writer => {
                break 'drive if link_cancel.is_cancelled() {
                    DisconnectReason::Normal
                } else {
                    DisconnectReason::IoError
                };
            },

            _ = probe.tick() => {
                if let Ok(bytes) = Frame::keep_alive().encode(shared.key.as_ref()) {
                    let _ = queue.enqueue(bytes, SendLane::Control, None);
                }
            },

            _ = tick.tick() => {
                for action in session.tick(Instant::now()) {
                    if let SessionAction::Close(reason) = action {
                        break 'drive reason;
                    }
                }
            },

            frame = frames.next_frame() => match frame {
                Ok(Some(frame)) => match session.handle_frame(frame, Instant::now()) {
                    Ok(actions) => {
                        for action in actions {
                            match action {
                                SessionAction::Deliver(frame) => {
                                    if let Err(e) =
                                        shared.dispatcher.dispatch(session.info(), frame)
                                    {
                                        tracing::warn!(error = %e, "undeliverable frame");
                                        break 'drive DisconnectReason::ProtocolError;
                                    }
                                },
                                SessionAction::SendFrame(out) => {
                                    if let Ok(bytes) = out.encode(shared.key.as_ref()) {
                                        let _ = queue.enqueue(bytes, SendLane::Control, None);
                                    }
                                },
                                SessionAction::Identified => {},
                                SessionAction::Close(reason) => break 'drive reason,
                            }
                        }
                    },
                    Err(e) => {
                        tracing::warn!(error = %e, "protocol violation");
                        break 'drive DisconnectReason::ProtocolError;
                    },
                },
                Ok(None) => break 'drive DisconnectReason::PeerClosed,
                Err(e) => {
                    tracing::warn!(error = %e, "receive failed");
                    break 'drive if e.is_protocol_violation() {
                        DisconnectReason::ProtocolError
                    } else {
                        DisconnectReason::IoError
                    };
                },
            },
        }
    };

    link_cancel.cancel();
    if !writer.is_finished() {
        let _ = (&mut writer).await;
    }

    let removed = shared.link.lock().await.take();
    shared.connected.send_replace(false);

    if removed.is_some() {
        session.begin_close(reason);
        session.mark_closed();
        tracing::info!(%reason, "disconnected");
        shared.dispatcher.emit(PeerEvent::Disconnected { session: session.info(), reason });
    }
    Ok(())
}

fn own_info(shared: &Arc<Shared>, peer: std::net::SocketAddr) -> SessionInfo {
    let mut info = SessionInfo {
        id: 0,
        name: shared.identity.name.clone(),
        guid: shared.identity.guid.clone(),
        user_domain: shared.identity.user_domain.clone(),
        os_version: shared.identity.os_version.clone(),
        ..SessionInfo::default()
    };
    info.set_peer_addr(peer);
    info
}
