//! TCP/TLS server endpoint for the Tether messaging transport.
//!
//! Production "glue" around the sans-IO logic in `tether-core`: the
//! [`Server`] owns the accept loop, the session map, and one driver task
//! per connection. Each driver runs the per-session [`Session`] state
//! machine, feeds inbound frames through the shared [`Dispatcher`], and
//! pairs with a writer task draining the session's send queue - so the
//! accept loop, the drivers, and the writers never block one another.
//!
//! Lifecycle of one connection: accept → admission policy → insert into
//! the session map + `Connected` event → optional TLS handshake →
//! identification (first frame must be Auth) → ready. Teardown runs
//! exactly once per session, no matter which of peer FIN, timeout, local
//! shutdown, or protocol error triggers it, and emits exactly one
//! `Disconnected` event after every inbound event of that session.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod transport;

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc, Mutex as StdMutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
pub use error::ServerError;
use serde::Serialize;
use tether_core::{
    CallbackTable, CborCodec, DisconnectReason, Dispatcher, FrameStream, InboundMessage,
    ObjectCodec, PeerEvent, PolicySet, SendError, SendLane, SendOptions, SendQueue,
    SendQueueReceiver, Session, SessionAction, SessionInfo, SessionLimits, encode_object,
    receive_buffer_size, run_writer, send_queue,
};
use tether_proto::{Frame, FrameKey};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    sync::{Mutex, Notify, mpsc, oneshot, watch},
    task::AbortHandle,
};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
pub use transport::{Listener, TlsServerConfig, build_acceptor};

/// Server configuration, fixed once [`Server::listen`] is called.
pub struct ServerConfig {
    /// Admission policy (whitelist/blacklist/limits).
    pub policy: PolicySet,
    /// Per-session limits (frame size, identification timeout). The
    /// inactivity timeout comes from the policy set.
    pub limits: SessionLimits,
    /// Passphrase for frame encryption; derives the AES key once.
    pub passphrase: Option<String>,
    /// Bound on each session's send queue. `None` = unbounded.
    pub max_queue_depth: Option<usize>,
    /// TLS settings; `None` runs plain TCP.
    pub tls: Option<TlsServerConfig>,
    /// Codec for inbound object payloads.
    pub object_codec: Arc<dyn ObjectCodec>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            policy: PolicySet::default(),
            limits: SessionLimits::default(),
            passphrase: None,
            max_queue_depth: None,
            tls: None,
            object_codec: Arc::new(CborCodec),
        }
    }
}

/// One session's bookkeeping in the map.
struct SessionEntry {
    info: Arc<StdMutex<SessionInfo>>,
    queue: SendQueue,
    cancel: CancellationToken,
    abort: StdMutex<Option<AbortHandle>>,
    /// Reason supplied by a local `shutdown_client`, picked up by the
    /// driver when its token fires.
    pending_reason: Arc<StdMutex<Option<DisconnectReason>>>,
}

struct Shared {
    policy: PolicySet,
    limits: SessionLimits,
    key: Option<FrameKey>,
    max_queue_depth: Option<usize>,
    callbacks: Arc<CallbackTable>,
    dispatcher: Dispatcher,
    sessions: Mutex<HashMap<u64, SessionEntry>>,
    /// Session ids are unique for the server's lifetime, monotonic from 1.
    next_id: AtomicU64,
    accepting: AtomicBool,
    listening: AtomicBool,
    /// Woken when a session slot frees (capacity gate, shutdown wait).
    slot_free: Notify,
    cancel: CancellationToken,
}

/// The server endpoint.
pub struct Server {
    shared: Arc<Shared>,
    tls: Option<TlsServerConfig>,
    events: StdMutex<Option<mpsc::UnboundedReceiver<PeerEvent>>>,
}

impl Server {
    /// Create a server from configuration.
    ///
    /// # Errors
    ///
    /// [`ServerError::Config`] if the policy or limits are out of band.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        config.policy.validate()?;
        let limits =
            SessionLimits { inactivity_timeout: config.policy.inactivity_timeout, ..config.limits };
        limits.validate()?;

        let key = config.passphrase.as_deref().map(FrameKey::derive);
        let callbacks = Arc::new(CallbackTable::new());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(Arc::clone(&callbacks), config.object_codec, events_tx);

        Ok(Self {
            shared: Arc::new(Shared {
                policy: config.policy,
                limits,
                key,
                max_queue_depth: config.max_queue_depth,
                callbacks,
                dispatcher,
                sessions: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                accepting: AtomicBool::new(false),
                listening: AtomicBool::new(false),
                slot_free: Notify::new(),
                cancel: CancellationToken::new(),
            }),
            tls: config.tls,
            events: StdMutex::new(Some(events_rx)),
        })
    }

    /// Begin accepting connections on `ip:port` (`""`/`"*"` = any).
    ///
    /// Returns the bound address; port 0 picks an ephemeral port.
    pub fn listen(&self, ip: &str, port: u16) -> Result<SocketAddr, ServerError> {
        if self.shared.listening.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyListening);
        }

        let listener = Listener::bind(ip, port, self.shared.policy.max_connections)?;
        let addr = listener.local_addr()?;
        let acceptor = self.tls.as_ref().map(build_acceptor).transpose()?;

        self.shared.accepting.store(true, Ordering::SeqCst);
        tokio::spawn(accept_loop(Arc::clone(&self.shared), listener, acceptor));
        Ok(addr)
    }

    /// Take the event receiver. Yields `Some` exactly once.
    pub fn events(&self) -> Option<mpsc::UnboundedReceiver<PeerEvent>> {
        self.events.lock().ok().and_then(|mut guard| guard.take())
    }

    /// Whether the accept gate is currently open.
    #[must_use]
    pub fn accepting(&self) -> bool {
        self.shared.accepting.load(Ordering::SeqCst)
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

    /// Number of live sessions.
    pub async fn client_count(&self) -> usize {
        self.shared.sessions.lock().await.len()
    }

    /// Whether a session with this id is live.
    pub async fn is_client_connected(&self, id: u64) -> bool {
        self.shared.sessions.lock().await.contains_key(&id)
    }

    /// Identity snapshot of a session.
    pub async fn client(&self, id: u64) -> Option<SessionInfo> {
        let sessions = self.shared.sessions.lock().await;
        sessions.get(&id).map(|entry| snapshot(&entry.info))
    }

    /// Find a session by its peer-chosen GUID.
    pub async fn client_by_guid(&self, guid: &str) -> Option<SessionInfo> {
        let sessions = self.shared.sessions.lock().await;
        sessions.values().map(|entry| snapshot(&entry.info)).find(|info| info.guid == guid)
    }

    /// Identity snapshots of every live session.
    pub async fn clients(&self) -> Vec<SessionInfo> {
        let sessions = self.shared.sessions.lock().await;
        sessions.values().map(|entry| snapshot(&entry.info)).collect()
    }

    /// Close one session with the given reason.
    ///
    /// # Errors
    ///
    /// [`ServerError::UnknownSession`] if no such session is live.
    pub async fn shutdown_client(
        &self,
        id: u64,
        reason: DisconnectReason,
    ) -> Result<(), ServerError> {
        let sessions = self.shared.sessions.lock().await;
        let entry = sessions.get(&id).ok_or(ServerError::UnknownSession(id))?;
        if let Ok(mut pending) = entry.pending_reason.lock() {
            *pending = Some(reason);
        }
        entry.cancel.cancel();
        Ok(())
    }

    /// Send a text message to one session.
    ///
    /// Resolves once the bytes reach the socket buffer. Fails fast with
    /// [`SendError::Backpressure`] when a configured queue depth is full,
    /// and with [`SendError::NotConnected`] when the session is gone or
    /// tearing down.
    pub async fn send_message(
        &self,
        id: u64,
        text: &str,
        options: SendOptions,
    ) -> Result<(), SendError> {
        self.send_frame(id, options.apply(Frame::message(text))).await
    }

    /// Send an opaque byte payload to one session.
    pub async fn send_bytes(
        &self,
        id: u64,
        data: impl Into<Bytes>,
        options: SendOptions,
    ) -> Result<(), SendError> {
        self.send_frame(id, options.apply(Frame::bytes(data.into()))).await
    }

    /// Serialize and send an object to one session.
    pub async fn send_object<T: Serialize>(
        &self,
        id: u64,
        value: &T,
        options: SendOptions,
    ) -> Result<(), SendError> {
        let (payload, type_name) = encode_object(value)?;
        self.send_frame(id, options.apply(Frame::object(payload, type_name))).await
    }

    /// Enqueue a text message to every live session; returns how many
    /// queues accepted it. Iterates a snapshot of the session map.
    pub async fn broadcast_message(&self, text: &str, options: SendOptions) -> Result<usize, SendError> {
        self.broadcast_frame(options.apply(Frame::message(text))).await
    }

    /// Enqueue a byte payload to every live session.
    pub async fn broadcast_bytes(
        &self,
        data: impl Into<Bytes>,
        options: SendOptions,
    ) -> Result<usize, SendError> {
        self.broadcast_frame(options.apply(Frame::bytes(data.into()))).await
    }

    /// Stop accepting, close every session, and wait up to `grace` before
    /// hard-closing stragglers.
    pub async fn shutdown(&self, grace: Duration) {
        self.shared.accepting.store(false, Ordering::SeqCst);
        self.shared.cancel.cancel();

        let deadline = Instant::now() + grace;
        loop {
            if self.shared.sessions.lock().await.is_empty() {
                return;
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let stragglers: Vec<(u64, SessionEntry)> =
            self.shared.sessions.lock().await.drain().collect();
        for (id, entry) in stragglers {
            tracing::warn!(id, "hard-closing session after the shutdown grace period");
            if let Some(abort) = entry.abort.lock().ok().and_then(|guard| guard.clone()) {
                abort.abort();
            }
            // The aborted driver can no longer emit its disconnect event.
            self.shared.dispatcher.emit(PeerEvent::Disconnected {
                session: snapshot(&entry.info),
                reason: DisconnectReason::Normal,
            });
        }
    }

    async fn send_frame(&self, id: u64, frame: Frame) -> Result<(), SendError> {
        let queue = {
            let sessions = self.shared.sessions.lock().await;
            sessions.get(&id).ok_or(SendError::NotConnected)?.queue.clone()
        };

        let bytes = frame.encode(self.shared.key.as_ref())?;
        let (done_tx, done_rx) = oneshot::channel();
        queue.enqueue(bytes, SendLane::Data, Some(done_tx))?;
        done_rx.await.map_err(|_| SendError::NotConnected)?
    }

    async fn broadcast_frame(&self, frame: Frame) -> Result<usize, SendError> {
        let bytes = frame.encode(self.shared.key.as_ref())?;
        let queues: Vec<SendQueue> = {
            let sessions = self.shared.sessions.lock().await;
            sessions.values().map(|entry| entry.queue.clone()).collect()
        };

        Ok(queues
            .iter()
            .filter(|queue| queue.enqueue(bytes.clone(), SendLane::Data, None).is_ok())
            .count())
    }
}

fn snapshot(info: &Arc<StdMutex<SessionInfo>>) -> SessionInfo {
    info.lock().map(|guard| guard.clone()).unwrap_or_default()
}

async fn accept_loop(shared: Arc<Shared>, listener: Listener, acceptor: Option<TlsAcceptor>) {
    loop {
        // Capacity gate: park until a slot frees.
        loop {
            let count = shared.sessions.lock().await.len();
            if count < shared.policy.max_connections {
                break;
            }
            shared.accepting.store(false, Ordering::SeqCst);
            tokio::select! {
                () = shared.cancel.cancelled() => return,
                () = shared.slot_free.notified() => {},
            }
        }
        shared.accepting.store(true, Ordering::SeqCst);

        let (stream, peer) = tokio::select! {
            () = shared.cancel.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::error!(error = %e, "accept failed");
                    continue;
                },
            },
        };

        if !shared.policy.is_connection_allowed(peer.ip()) {
            // Refused before any event fires; the socket just closes.
            tracing::info!(peer = %peer, "connection refused by admission policy");
            drop(stream);
            continue;
        }

        admit(&shared, stream, peer, acceptor.clone()).await;
    }
}

async fn admit(
    shared: &Arc<Shared>,
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: Option<TlsAcceptor>,
) {
    let id = shared.next_id.fetch_add(1, Ordering::SeqCst);

    let mut initial = SessionInfo { id, ..SessionInfo::default() };
    initial.set_peer_addr(peer);

    let (queue, queue_rx) = send_queue(shared.max_queue_depth);
    let cancel = shared.cancel.child_token();
    let info = Arc::new(StdMutex::new(initial.clone()));
    let pending_reason = Arc::new(StdMutex::new(None));

    let entry = SessionEntry {
        info: Arc::clone(&info),
        queue: queue.clone(),
        cancel: cancel.clone(),
        abort: StdMutex::new(None),
        pending_reason: Arc::clone(&pending_reason),
    };
    shared.sessions.lock().await.insert(id, entry);
    shared.dispatcher.emit(PeerEvent::Connected(initial));
    tracing::info!(id, peer = %peer, "client connected");

    let ctx = DriverCtx { shared: Arc::clone(shared), id, queue, cancel, info, pending_reason };
    let task = tokio::spawn(drive_session(ctx, stream, peer, acceptor, queue_rx));

    if let Some(entry) = shared.sessions.lock().await.get(&id) {
        if let Ok(mut abort) = entry.abort.lock() {
            *abort = Some(task.abort_handle());
        }
    }
}

/// Everything a session driver needs besides the socket.
struct DriverCtx {
    shared: Arc<Shared>,
    id: u64,
    queue: SendQueue,
    cancel: CancellationToken,
    info: Arc<StdMutex<SessionInfo>>,
    pending_reason: Arc<StdMutex<Option<DisconnectReason>>>,
}

async fn drive_session(
    ctx: DriverCtx,
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    queue_rx: SendQueueReceiver,
) {
    let now = Instant::now();
    let mut session =
        Session::new(ctx.id, peer, acceptor.is_some(), ctx.shared.limits, now);
    session.begin(now);

    let reason = match acceptor {
        Some(acceptor) => {
            let handshake = tokio::select! {
                () = ctx.cancel.cancelled() => None,
                result = acceptor.accept(stream) => Some(result),
            };
            match handshake {
                Some(Ok(tls)) => {
                    session.tls_completed(Instant::now());
                    ctx.shared.dispatcher.emit(PeerEvent::TlsAuthSucceeded(snapshot(&ctx.info)));
                    let (read, write) = tokio::io::split(tls);
                    run_io(&ctx, &mut session, read, write, queue_rx).await
                },
                Some(Err(e)) => {
                    tracing::warn!(id = ctx.id, error = %e, "tls handshake failed");
                    session.tls_failed(Instant::now());
                    ctx.shared.dispatcher.emit(PeerEvent::TlsAuthFailed {
                        session: snapshot(&ctx.info),
                        error: e.to_string(),
                    });
                    DisconnectReason::ProtocolError
                },
                None => DisconnectReason::Normal,
            }
        },
        None => {
            let (read, write) = stream.into_split();
            run_io(&ctx, &mut session, read, write, queue_rx).await
        },
    };

    finish(&ctx, &mut session, reason).await;
}

async fn run_io<R, W>(
    ctx: &DriverCtx,
    session: &mut Session<Instant>,
    read: R,
    write: W,
    queue_rx: SendQueueReceiver,
) -> DisconnectReason
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut frames = FrameStream::new(
        read,
        ctx.shared.key.clone(),
        ctx.shared.limits.max_frame_bytes,
        receive_buffer_size(),
    );
    let (ready_tx, ready_rx) = watch::channel(false);
    let mut writer = tokio::spawn(run_writer(write, queue_rx, ready_rx, ctx.cancel.clone()));

    session.set_receiving(true);
    session.set_writing(true);

    let mut tick = tokio::time::interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let reason = 'drive: loop {
        tokio::select! {
            () = ctx.cancel.cancelled() => {
                let requested = ctx.pending_reason.lock().ok().and_then(|mut g| g.take());
                break 'drive requested.unwrap_or(DisconnectReason::Normal);
            },

            // Writer only exits early on a write failure (or cancel).
            _ = &mut writer => {
                break 'drive if ctx.cancel.is_cancelled() {
                    let requested = ctx.pending_reason.lock().ok().and_then(|mut g| g.take());
                    requested.unwrap_or(DisconnectReason::Normal)
                } else {
                    DisconnectReason::IoError
                };
            },

            _ = tick.tick() => {
                for action in session.tick(Instant::now()) {
                    if let Some(reason) = execute_action(ctx, session, action, &ready_tx) {
                        break 'drive reason;
                    }
                }
            },

            frame = frames.next_frame() => match frame {
                Ok(Some(frame)) => match session.handle_frame(frame, Instant::now()) {
                    Ok(actions) => {
                        for action in actions {
                            if let Some(reason) = execute_action(ctx, session, action, &ready_tx) {
                                break 'drive reason;
                            }
                        }
                    },
                    Err(e) => {
                        tracing::warn!(id = ctx.id, error = %e, "protocol violation");
                        break 'drive DisconnectReason::ProtocolError;
                    },
                },
                Ok(None) => break 'drive DisconnectReason::PeerClosed,
                Err(e) => {
                    tracing::warn!(id = ctx.id, error = %e, "receive failed");
                    break 'drive if e.is_protocol_violation() {
                        DisconnectReason::ProtocolError
                    } else {
                        DisconnectReason::IoError
                    };
                },
            },
        }
    };

    session.set_receiving(false);
    ctx.cancel.cancel();
    if !writer.is_finished() {
        let _ = (&mut writer).await;
    }
    session.set_writing(false);
    reason
}

fn execute_action(
    ctx: &DriverCtx,
    session: &mut Session<Instant>,
    action: SessionAction,
    ready_tx: &watch::Sender<bool>,
) -> Option<DisconnectReason> {
    match action {
        SessionAction::Identified => {
            if let Ok(mut info) = ctx.info.lock() {
                *info = session.info();
            }
            ready_tx.send_replace(true);
            None
        },
        SessionAction::Deliver(frame) => {
            if let Err(e) = ctx.shared.dispatcher.dispatch(session.info(), frame) {
                tracing::warn!(id = ctx.id, error = %e, "undeliverable frame");
                return Some(DisconnectReason::ProtocolError);
            }
            None
        },
        SessionAction::SendFrame(frame) => {
            match frame.encode(ctx.shared.key.as_ref()) {
                Ok(bytes) => {
                    let _ = ctx.queue.enqueue(bytes, SendLane::Control, None);
                },
                Err(e) => tracing::warn!(id = ctx.id, error = %e, "control frame encode failed"),
            }
            None
        },
        SessionAction::Close(reason) => Some(reason),
    }
}

async fn finish(ctx: &DriverCtx, session: &mut Session<Instant>, reason: DisconnectReason) {
    session.begin_close(reason);
    session.mark_closed();
    ctx.cancel.cancel();

    let removed = ctx.shared.sessions.lock().await.remove(&ctx.id);
    ctx.shared.slot_free.notify_one();

    // Removal is the idempotency guard: the disconnect event fires exactly
    // once per admitted session, after every inbound event it produced.
    if removed.is_some() {
        tracing::info!(id = ctx.id, %reason, "client disconnected");
        ctx.shared
            .dispatcher
            .emit(PeerEvent::Disconnected { session: snapshot(&ctx.info), reason });
    }
}
