//! Per-connection session state machine.
//!
//! Pure state machine in the action pattern: methods take the current time
//! as input and return actions for the driver to execute, keeping the
//! lifecycle logic free of I/O and directly testable. Generic over the
//! instant type so tests can manufacture time.
//!
//! # State machine
//!
//! ```text
//!        Created ──begin──▶ HandshakingTls? ──▶ Identifying ──▶ Ready
//!                                 │                  │            │
//!                                 ▼                  ▼            ▼
//!                              Failed            Failed        Closing ──▶ Closed
//! ```
//!
//! `Closing` is entered exactly once (idempotent guard in
//! [`Session::begin_close`]); the disconnect event therefore fires exactly
//! once no matter how many shutdown paths race.

use std::{net::SocketAddr, ops::Sub, time::Duration};

use tether_proto::{AuthPayload, Frame, MessageType};

use crate::{config::SessionLimits, error::SessionError};

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Constructed, not yet started.
    Created,
    /// TLS handshake in progress.
    HandshakingTls,
    /// Waiting for the peer's Auth frame.
    Identifying,
    /// Identified and exchanging application frames.
    Ready,
    /// Teardown initiated; reason recorded.
    Closing,
    /// Socket closed, session removed. Terminal.
    Closed,
    /// Setup never completed (TLS or identification). Terminal.
    Failed,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Local, orderly shutdown.
    Normal,
    /// Peer closed the stream.
    PeerClosed,
    /// Identification or inactivity timeout.
    Timeout,
    /// Refused by the admission policy.
    PolicyDenied,
    /// Peer violated the wire contract.
    ProtocolError,
    /// Socket failure.
    IoError,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Normal => "normal",
            Self::PeerClosed => "peer closed",
            Self::Timeout => "timeout",
            Self::PolicyDenied => "policy denied",
            Self::ProtocolError => "protocol error",
            Self::IoError => "i/o error",
        };
        f.write_str(text)
    }
}

/// Cheap snapshot of a session's identity, carried by events and handles.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionInfo {
    /// Server-assigned numeric id, monotonic from 1.
    pub id: u64,
    /// Human-readable client name (empty until identified).
    pub name: String,
    /// Peer-chosen stable identifier (empty until identified).
    pub guid: String,
    /// Informational user/domain string.
    pub user_domain: String,
    /// Informational OS description.
    pub os_version: String,
    /// Peer IPv4 address in textual form, if the peer connected over IPv4.
    pub ipv4: Option<String>,
    /// Peer IPv6 address in textual form, if the peer connected over IPv6.
    pub ipv6: Option<String>,
}

impl SessionInfo {
    /// Record the peer address in its textual form.
    pub fn set_peer_addr(&mut self, addr: SocketAddr) {
        match addr.ip() {
            std::net::IpAddr::V4(ip) => self.ipv4 = Some(ip.to_string()),
            std::net::IpAddr::V6(ip) => self.ipv6 = Some(ip.to_string()),
        }
    }
}

/// Actions returned by the state machine for the driver to execute.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
    /// Encode and send this frame to the peer.
    SendFrame(Frame),
    /// Hand this decoded application frame to the dispatcher.
    Deliver(Frame),
    /// Identification completed; release gated sends.
    Identified,
    /// Tear the connection down with this reason.
    Close(DisconnectReason),
}

/// Per-connection state machine.
///
/// One per live TCP connection, owned by its driver task. Time is a
/// parameter, never read from a clock here.
#[derive(Debug, Clone)]
pub struct Session<I>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    state: SessionState,
    info: SessionInfo,
    limits: SessionLimits,
    tls_enabled: bool,
    /// When the current state was entered (drives the per-state timeouts).
    state_entered: I,
    last_activity: I,
    close_reason: Option<DisconnectReason>,
    // Liveness flags, maintained by the driver.
    receiving: bool,
    writing: bool,
    timed_out: bool,
}

impl<I> Session<I>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    /// Create a session in [`SessionState::Created`].
    pub fn new(
        id: u64,
        peer_addr: SocketAddr,
        tls_enabled: bool,
        limits: SessionLimits,
        now: I,
    ) -> Self {
        let mut info = SessionInfo { id, ..SessionInfo::default() };
        info.set_peer_addr(peer_addr);
        Self {
            state: SessionState::Created,
            info,
            limits,
            tls_enabled,
            state_entered: now,
            last_activity: now,
            close_reason: None,
            receiving: false,
            writing: false,
            timed_out: false,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether the session accepts application sends right now.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
    }

    /// Identity snapshot.
    #[must_use]
    pub fn info(&self) -> SessionInfo {
        self.info.clone()
    }

    /// Reason recorded when teardown began, if it has.
    #[must_use]
    pub fn close_reason(&self) -> Option<DisconnectReason> {
        self.close_reason
    }

    /// Configured limits.
    #[must_use]
    pub fn limits(&self) -> SessionLimits {
        self.limits
    }

    /// Whether a timeout tore this session down.
    #[must_use]
    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    /// Mark the receive loop as running or stopped.
    pub fn set_receiving(&mut self, on: bool) {
        self.receiving = on;
    }

    /// Mark the write loop as running or stopped.
    pub fn set_writing(&mut self, on: bool) {
        self.writing = on;
    }

    /// Whether both I/O loops are live.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.receiving && self.writing
    }

    /// Start the lifecycle: `Created` → `HandshakingTls` or `Identifying`.
    pub fn begin(&mut self, now: I) {
        debug_assert_eq!(self.state, SessionState::Created);
        self.enter(
            if self.tls_enabled { SessionState::HandshakingTls } else { SessionState::Identifying },
            now,
        );
    }

    /// TLS handshake finished: `HandshakingTls` → `Identifying`.
    pub fn tls_completed(&mut self, now: I) {
        debug_assert_eq!(self.state, SessionState::HandshakingTls);
        self.enter(SessionState::Identifying, now);
    }

    /// TLS handshake failed; terminal.
    pub fn tls_failed(&mut self, now: I) {
        self.enter(SessionState::Failed, now);
    }

    /// Process a decoded inbound frame.
    ///
    /// # Errors
    ///
    /// - [`SessionError::Protocol`] on a malformed Auth payload
    /// - [`SessionError::UnexpectedFrame`] when the frame is not valid for
    ///   the current state (notably: anything but Auth while identifying)
    pub fn handle_frame(
        &mut self,
        frame: Frame,
        now: I,
    ) -> Result<Vec<SessionAction>, SessionError> {
        self.last_activity = now;

        match (self.state, frame.msg_type) {
            (SessionState::Identifying, MessageType::Auth) => {
                let auth = AuthPayload::parse(&frame.payload)?;
                self.apply_auth(auth);
                self.enter(SessionState::Ready, now);
                tracing::debug!(
                    id = self.info.id,
                    name = %self.info.name,
                    guid = %self.info.guid,
                    "session identified"
                );
                Ok(vec![SessionAction::Identified])
            },

            // Re-identification while ready updates the fields in place.
            (SessionState::Ready, MessageType::Auth) => {
                let auth = AuthPayload::parse(&frame.payload)?;
                self.apply_auth(auth);
                Ok(vec![])
            },

            (SessionState::Ready, MessageType::KeepAlive) => Ok(vec![]),

            (
                SessionState::Ready,
                MessageType::Message | MessageType::Object | MessageType::Bytes,
            ) => Ok(vec![SessionAction::Deliver(frame)]),

            (state, msg_type) => Err(SessionError::UnexpectedFrame {
                what: match msg_type {
                    MessageType::Message => "Message",
                    MessageType::Object => "Object",
                    MessageType::Bytes => "Bytes",
                    MessageType::Auth => "Auth",
                    MessageType::KeepAlive => "KeepAlive",
                },
                state,
            }),
        }
    }

    /// Periodic maintenance: timeout detection.
    pub fn tick(&mut self, now: I) -> Vec<SessionAction> {
        match self.state {
            SessionState::Identifying => {
                let waited = now - self.state_entered;
                if waited > self.limits.identification_timeout {
                    tracing::warn!(
                        id = self.info.id,
                        ?waited,
                        "no auth frame within the identification timeout"
                    );
                    self.timed_out = true;
                    return vec![SessionAction::Close(DisconnectReason::Timeout)];
                }
            },
            SessionState::Ready if !self.limits.inactivity_timeout.is_zero() => {
                let idle = now - self.last_activity;
                if idle > self.limits.inactivity_timeout {
                    tracing::info!(id = self.info.id, ?idle, "session idle past the timeout");
                    self.timed_out = true;
                    return vec![SessionAction::Close(DisconnectReason::Timeout)];
                }
            },
            _ => {},
        }
        vec![]
    }

    /// Begin teardown, once.
    ///
    /// The first caller wins and gets `Some(reason)` back; every later
    /// caller gets `None`. This is the idempotency guard behind the
    /// exactly-one-disconnect-event contract.
    pub fn begin_close(&mut self, reason: DisconnectReason) -> Option<DisconnectReason> {
        match self.state {
            SessionState::Closing | SessionState::Closed | SessionState::Failed => None,
            SessionState::Created
            | SessionState::HandshakingTls
            | SessionState::Identifying
            | SessionState::Ready => {
                self.state = SessionState::Closing;
                self.close_reason = Some(reason);
                Some(reason)
            },
        }
    }

    /// Final transition after the socket is closed.
    ///
    /// `Failed` stays `Failed`; only `Closing` advances to `Closed`.
    pub fn mark_closed(&mut self) {
        if self.state == SessionState::Closing {
            self.state = SessionState::Closed;
        }
    }

    fn apply_auth(&mut self, auth: AuthPayload) {
        self.info.name = auth.name;
        self.info.guid = auth.guid;
        self.info.user_domain = auth.user_domain;
        self.info.os_version = auth.os_version;
    }

    fn enter(&mut self, state: SessionState, now: I) {
        self.state = state;
        self.state_entered = now;
        self.last_activity = now;
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:45000".parse().unwrap()
    }

    fn auth_frame() -> Frame {
        Frame::auth(&AuthPayload {
            name: "alice".into(),
            guid: "g-1".into(),
            user_domain: "WORKGROUP".into(),
            os_version: "linux".into(),
        })
        .unwrap()
    }

    fn ready_session(t0: Instant) -> Session<Instant> {
        let mut session = Session::new(1, addr(), false, SessionLimits::default(), t0);
        session.begin(t0);
        session.handle_frame(auth_frame(), t0).unwrap();
        session
    }

    #[test]
    fn lifecycle_without_tls() {
        let t0 = Instant::now();
        let mut session = Session::new(1, addr(), false, SessionLimits::default(), t0);
        assert_eq!(session.state(), SessionState::Created);

        session.begin(t0);
        assert_eq!(session.state(), SessionState::Identifying);

        let actions = session.handle_frame(auth_frame(), t0).unwrap();
        assert_eq!(actions, vec![SessionAction::Identified]);
        assert_eq!(session.state(), SessionState::Ready);

        let info = session.info();
        assert_eq!(info.name, "alice");
        assert_eq!(info.guid, "g-1");
        assert_eq!(info.ipv4.as_deref(), Some("127.0.0.1"));
        assert_eq!(info.ipv6, None);
    }

    #[test]
    fn lifecycle_with_tls() {
        let t0 = Instant::now();
        let mut session = Session::new(1, addr(), true, SessionLimits::default(), t0);
        session.begin(t0);
        assert_eq!(session.state(), SessionState::HandshakingTls);

        session.tls_completed(t0);
        assert_eq!(session.state(), SessionState::Identifying);
    }

    #[test]
    fn tls_failure_is_terminal() {
        let t0 = Instant::now();
        let mut session = Session::new(1, addr(), true, SessionLimits::default(), t0);
        session.begin(t0);
        session.tls_failed(t0);
        assert_eq!(session.state(), SessionState::Failed);
        // Teardown after a failed handshake fires no disconnect.
        assert_eq!(session.begin_close(DisconnectReason::IoError), None);
    }

    #[test]
    fn first_frame_must_be_auth() {
        let t0 = Instant::now();
        let mut session = Session::new(1, addr(), false, SessionLimits::default(), t0);
        session.begin(t0);

        let result = session.handle_frame(Frame::message("too eager"), t0);
        assert!(matches!(result, Err(SessionError::UnexpectedFrame { .. })));
    }

    #[test]
    fn malformed_auth_is_protocol_error() {
        let t0 = Instant::now();
        let mut session = Session::new(1, addr(), false, SessionLimits::default(), t0);
        session.begin(t0);

        let bogus = Frame::new(MessageType::Auth, &b"only|three|fields"[..]);
        let result = session.handle_frame(bogus, t0);
        assert!(matches!(result, Err(SessionError::Protocol(_))));
    }

    #[test]
    fn application_frames_deliver_when_ready() {
        let t0 = Instant::now();
        let mut session = ready_session(t0);

        let actions = session.handle_frame(Frame::message("hello"), t0).unwrap();
        assert!(matches!(actions.as_slice(), [SessionAction::Deliver(_)]));

        let actions = session.handle_frame(Frame::keep_alive(), t0).unwrap();
        assert!(actions.is_empty());
    }

    #[test]
    fn identification_timeout_fires() {
        let t0 = Instant::now();
        let mut session = Session::new(1, addr(), false, SessionLimits::default(), t0);
        session.begin(t0);

        assert!(session.tick(t0 + Duration::from_secs(9)).is_empty());

        let actions = session.tick(t0 + Duration::from_secs(11));
        assert_eq!(actions, vec![SessionAction::Close(DisconnectReason::Timeout)]);
        assert!(session.timed_out());
    }

    #[test]
    fn keepalive_resets_the_inactivity_clock() {
        let t0 = Instant::now();
        let limits = SessionLimits {
            inactivity_timeout: Duration::from_secs(5),
            ..SessionLimits::default()
        };
        let mut session = Session::new(1, addr(), false, limits, t0);
        session.begin(t0);
        session.handle_frame(auth_frame(), t0).unwrap();

        let t1 = t0 + Duration::from_secs(4);
        session.handle_frame(Frame::keep_alive(), t1).unwrap();

        // 6 s after t0, but only 2 s after the keepalive.
        assert!(session.tick(t0 + Duration::from_secs(6)).is_empty());

        let actions = session.tick(t1 + Duration::from_secs(6));
        assert_eq!(actions, vec![SessionAction::Close(DisconnectReason::Timeout)]);
    }

    #[test]
    fn zero_inactivity_timeout_never_fires() {
        let t0 = Instant::now();
        let mut session = ready_session(t0);
        assert!(session.tick(t0 + Duration::from_secs(86_400)).is_empty());
    }

    #[test]
    fn close_is_single_fire() {
        let t0 = Instant::now();
        let mut session = ready_session(t0);

        assert_eq!(
            session.begin_close(DisconnectReason::PeerClosed),
            Some(DisconnectReason::PeerClosed)
        );
        // The racing local shutdown loses.
        assert_eq!(session.begin_close(DisconnectReason::Normal), None);
        assert_eq!(session.close_reason(), Some(DisconnectReason::PeerClosed));

        session.mark_closed();
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.begin_close(DisconnectReason::Normal), None);
    }

    #[test]
    fn reauth_updates_identity() {
        let t0 = Instant::now();
        let mut session = ready_session(t0);

        let renamed = Frame::auth(&AuthPayload {
            name: "alice-2".into(),
            guid: "g-1".into(),
            user_domain: "WORKGROUP".into(),
            os_version: "linux".into(),
        })
        .unwrap();
        let actions = session.handle_frame(renamed, t0).unwrap();
        assert!(actions.is_empty());
        assert_eq!(session.info().name, "alice-2");
    }
}
