// Relay core: the message-handling state machine and the per-tick sweeps.
//
// `Relay` owns the `SessionRegistry` and the `LobbyDirectory` and is the only
// thing that mutates them. `server.rs` drives it from a single task: transport
// events (`open` / `handle_frame` / `close`) and the fixed-cadence `tick` are
// delivered one at a time, so none of this code needs locks and no handler
// ever observes a half-applied change.
//
// Frame handling:
// - Every inbound frame first refreshes the session's idle clock.
// - The opcode is checked against the session state before the payload is
//   decoded: only the handshake is allowed while unconfirmed, and the
//   handshake is only allowed once.
// - Any failure becomes a `FrameError`, which maps to a WebSocket close code.
//   The session is torn down immediately and the close request is queued on
//   its outbox; the transport's later close notification is then a no-op.
//
// Tick, in order:
// 1. Liveness sweep: ping sessions idle past `ping_after_ms` (once), close
//    sessions idle past `close_after_ms` that were already pinged.
// 2. Snapshot sweep: one encoded buffer per lobby, shared by every member.
//
// Time is passed in as epoch milliseconds rather than read from the clock, so
// tests can step it explicitly. `now_ms()` is what the server passes.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use lobby_relay_protocol::{
    ClientMessage, ClientOpcode, CloseReason, DecodeError, Identity, MAX_SNAPSHOT_ENTRIES,
    MIN_PROTOCOL_VERSION, ServerMessage, StateUpdate, encode_snapshot,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::lobby::{LobbyDirectory, LobbyKey};
use crate::session::{ConnId, Outbox, Session, SessionRegistry, SessionState};

/// How long a marker stays valid after the relay receives it.
pub const MARKER_TTL_MS: u64 = 5_000;

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Idle thresholds for the liveness sweep.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LivenessConfig {
    /// Idle time after which a session is sent one ping.
    pub ping_after_ms: u64,
    /// Idle time after which an already-pinged session is closed.
    pub close_after_ms: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            ping_after_ms: 30_000,
            close_after_ms: 40_000,
        }
    }
}

/// A frame as delivered by the transport.
#[derive(Clone, Debug)]
pub enum Inbound {
    Binary(Bytes),
    /// Any non-binary data frame. Its contents are never looked at.
    Text,
}

/// Why a frame terminated its connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("non-binary frame")]
    NotBinary,

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("opcode {opcode:?} not allowed while {state:?}")]
    InvalidState {
        opcode: ClientOpcode,
        state: SessionState,
    },

    #[error("protocol version {0} is below minimum {min}", min = MIN_PROTOCOL_VERSION)]
    Outdated(u8),
}

impl FrameError {
    pub fn close_reason(&self) -> CloseReason {
        match self {
            Self::NotBinary => CloseReason::Unsupported,
            Self::Decode(DecodeError::UnknownOpcode(_)) => CloseReason::InvalidOpcode,
            Self::Decode(_) => CloseReason::Malformed,
            Self::InvalidState { .. } => CloseReason::InvalidOpcode,
            Self::Outdated(_) => CloseReason::Outdated,
        }
    }
}

/// Counts served by the status endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    pub lobbies: usize,
    pub sockets: usize,
}

/// Debug view of one session.
#[derive(Clone, Debug, Serialize)]
pub struct SessionListing {
    pub conn: ConnId,
    pub client_id: Option<String>,
    pub state: SessionState,
    pub idle_ms: u64,
    pub pending_ping: bool,
    pub instance: Option<String>,
    pub tag: u16,
    pub lobby: Option<LobbyKey>,
    pub primary: Identity,
    pub secondary: Option<Identity>,
}

impl SessionListing {
    fn of(session: &Session, now: u64) -> Self {
        Self {
            conn: session.conn(),
            client_id: session.client_id().map(str::to_owned),
            state: session.state(),
            idle_ms: session.idle_ms(now),
            pending_ping: session.pending_ping(),
            instance: session.instance().map(str::to_owned),
            tag: session.tag(),
            lobby: session.lobby().cloned(),
            primary: session.primary(),
            secondary: session.secondary(),
        }
    }
}

/// Debug view of one lobby, members in join order.
#[derive(Clone, Debug, Serialize)]
pub struct LobbyListing {
    pub instance: String,
    pub tag: u16,
    pub members: Vec<SessionListing>,
}

/// The relay's entire mutable state.
pub struct Relay {
    sessions: SessionRegistry,
    lobbies: LobbyDirectory,
    liveness: LivenessConfig,
}

impl Relay {
    pub fn new(liveness: LivenessConfig) -> Self {
        Self {
            sessions: SessionRegistry::new(),
            lobbies: LobbyDirectory::new(),
            liveness,
        }
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn lobbies(&self) -> &LobbyDirectory {
        &self.lobbies
    }

    /// Register a newly accepted connection.
    pub fn open(&mut self, conn: ConnId, outbox: Outbox, now: u64) {
        if !self.sessions.insert(Session::new(conn, outbox, now)) {
            warn!(%conn, "connection handle reused, ignoring open");
            return;
        }
        debug!(%conn, sessions = self.sessions.len(), "connection opened");
    }

    /// The transport reports the connection is gone.
    pub fn close(&mut self, conn: ConnId) {
        if self.remove_session(conn).is_some() {
            debug!(%conn, sessions = self.sessions.len(), "connection closed");
        }
    }

    /// Apply one inbound frame. Any error closes the connection.
    pub fn handle_frame(&mut self, conn: ConnId, frame: Inbound, now: u64) {
        let Some(session) = self.sessions.get_mut(conn) else {
            trace!(%conn, "frame for closed connection dropped");
            return;
        };
        session.touch(now);

        if let Err(err) = self.apply_frame(conn, frame, now) {
            let reason = err.close_reason();
            debug!(%conn, error = %err, code = reason.code(), "closing connection");
            self.disconnect(conn, reason);
        }
    }

    fn apply_frame(&mut self, conn: ConnId, frame: Inbound, now: u64) -> Result<(), FrameError> {
        let Inbound::Binary(data) = frame else {
            return Err(FrameError::NotBinary);
        };
        let Some(session) = self.sessions.get(conn) else {
            return Ok(());
        };

        let opcode = ClientOpcode::of_frame(&data)?;
        let state = session.state();
        let allowed = match opcode {
            ClientOpcode::Handshake => state == SessionState::Unconfirmed,
            ClientOpcode::StateUpdate | ClientOpcode::Marker => state == SessionState::Confirmed,
        };
        if !allowed {
            return Err(FrameError::InvalidState { opcode, state });
        }

        match ClientMessage::decode(&data)? {
            ClientMessage::Handshake { id, version } => self.handle_handshake(conn, id, version),
            ClientMessage::StateUpdate(update) => {
                self.handle_state_update(conn, update);
                Ok(())
            }
            ClientMessage::Marker { x, y } => {
                self.handle_marker(conn, x, y, now);
                Ok(())
            }
        }
    }

    fn handle_handshake(&mut self, conn: ConnId, id: String, version: u8) -> Result<(), FrameError> {
        if version < MIN_PROTOCOL_VERSION {
            return Err(FrameError::Outdated(version));
        }
        if let Some(session) = self.sessions.get_mut(conn) {
            debug!(%conn, client_id = %id, version, "handshake accepted");
            session.confirm(id);
            session.send(Bytes::from(ServerMessage::HandshakeAck.encode()));
        }
        Ok(())
    }

    fn handle_state_update(&mut self, conn: ConnId, update: StateUpdate) {
        let Some(session) = self.sessions.get_mut(conn) else {
            return;
        };
        session.apply_update(&update);

        if !update.wants_lobby() {
            self.leave_lobby(conn);
            return;
        }
        let key = LobbyKey::new(update.instance, update.tag);
        if session.lobby() != Some(&key) {
            self.leave_lobby(conn);
            self.join_lobby(conn, key);
        }
    }

    fn handle_marker(&mut self, conn: ConnId, x: i16, y: i16, now: u64) {
        let Some(session) = self.sessions.get(conn) else {
            return;
        };
        let Some(key) = session.lobby() else {
            trace!(%conn, "marker outside a lobby ignored");
            return;
        };
        let marker = ServerMessage::Marker {
            pid: session.primary().pid,
            x,
            y,
            expires_at: (now + MARKER_TTL_MS) as f64,
        };
        self.broadcast(key, Bytes::from(marker.encode()));
    }

    fn join_lobby(&mut self, conn: ConnId, key: LobbyKey) {
        let Some(session) = self.sessions.get_mut(conn) else {
            return;
        };
        let created = !self.lobbies.contains(&key);
        self.lobbies.join(key.clone(), conn);
        debug!(%conn, lobby = %key, created, "joined lobby");
        session.set_lobby(Some(key));
    }

    fn leave_lobby(&mut self, conn: ConnId) {
        let Some(session) = self.sessions.get_mut(conn) else {
            return;
        };
        let Some(key) = session.lobby().cloned() else {
            return;
        };
        session.set_lobby(None);
        self.lobbies.leave(&key, conn);
        debug!(%conn, lobby = %key, destroyed = !self.lobbies.contains(&key), "left lobby");
    }

    /// Tear down a session: lobby first, then registry.
    fn remove_session(&mut self, conn: ConnId) -> Option<Session> {
        self.leave_lobby(conn);
        self.sessions.remove(conn)
    }

    /// Relay-initiated close.
    fn disconnect(&mut self, conn: ConnId, reason: CloseReason) {
        if let Some(session) = self.remove_session(conn) {
            session.close(reason);
        }
    }

    /// Send one shared buffer to every member of a lobby.
    fn broadcast(&self, key: &LobbyKey, frame: Bytes) {
        let Some(lobby) = self.lobbies.get(key) else {
            return;
        };
        for member in lobby.members() {
            if let Some(session) = self.sessions.get(*member) {
                session.send(frame.clone());
            }
        }
    }

    /// One scheduler tick: liveness first, then snapshots.
    pub fn tick(&mut self, now: u64) {
        self.liveness_sweep(now);
        self.broadcast_snapshots();
    }

    /// Ping idle sessions once and close the ones that never answered.
    pub fn liveness_sweep(&mut self, now: u64) {
        let LivenessConfig {
            ping_after_ms,
            close_after_ms,
        } = self.liveness;
        let ping = Bytes::from(ServerMessage::Ping.encode());
        let mut expired = Vec::new();

        for session in self.sessions.iter_mut() {
            let idle = session.idle_ms(now);
            if idle >= close_after_ms && session.pending_ping() {
                expired.push(session.conn());
            } else if idle >= ping_after_ms {
                if !session.pending_ping() {
                    trace!(conn = %session.conn(), idle, "pinging idle connection");
                    session.send(ping.clone());
                }
                session.set_pending_ping(true);
            } else {
                session.set_pending_ping(false);
            }
        }

        for conn in expired {
            info!(%conn, "closing inactive connection");
            self.disconnect(conn, CloseReason::Inactive);
        }
    }

    /// Encode one snapshot per lobby and fan it out to the lobby's members.
    pub fn broadcast_snapshots(&self) {
        for (key, lobby) in self.lobbies.iter() {
            let mut entries: Vec<Identity> = Vec::new();
            let mut omitted = 0usize;
            for session in lobby
                .members()
                .iter()
                .filter_map(|member| self.sessions.get(*member))
            {
                // A member's entries are written together or not at all.
                let len = entries.len();
                entries.extend(session.snapshot_entries());
                if omitted > 0 || entries.len() > MAX_SNAPSHOT_ENTRIES {
                    entries.truncate(len);
                    omitted += 1;
                }
            }
            if omitted > 0 {
                warn!(
                    lobby = %key,
                    omitted,
                    "snapshot full at {MAX_SNAPSHOT_ENTRIES} entries, members left out"
                );
            }
            self.broadcast(key, Bytes::from(encode_snapshot(&entries)));
        }
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            lobbies: self.lobbies.len(),
            sockets: self.sessions.len(),
        }
    }

    pub fn session_listing(&self, now: u64) -> Vec<SessionListing> {
        self.sessions
            .iter()
            .map(|session| SessionListing::of(session, now))
            .collect()
    }

    pub fn lobby_listing(&self, now: u64) -> Vec<LobbyListing> {
        self.lobbies
            .iter()
            .map(|(key, lobby)| LobbyListing {
                instance: key.instance.clone(),
                tag: key.tag,
                members: lobby
                    .members()
                    .iter()
                    .filter_map(|member| self.sessions.get(*member))
                    .map(|session| SessionListing::of(session, now))
                    .collect(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use lobby_relay_protocol::NO_INSTANCE;
    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;
    use crate::session::Outbound;

    const T0: u64 = 1_700_000_000_000;

    fn relay() -> Relay {
        Relay::new(LivenessConfig::default())
    }

    /// Open a connection and return the receiver its writer task would drain.
    fn open(relay: &mut Relay, n: u64, now: u64) -> UnboundedReceiver<Outbound> {
        let (outbox, rx) = Outbox::channel();
        relay.open(ConnId(n), outbox, now);
        rx
    }

    fn send(relay: &mut Relay, n: u64, msg: ClientMessage, now: u64) {
        relay.handle_frame(ConnId(n), Inbound::Binary(Bytes::from(msg.encode())), now);
    }

    fn send_raw(relay: &mut Relay, n: u64, bytes: &[u8], now: u64) {
        relay.handle_frame(ConnId(n), Inbound::Binary(Bytes::copy_from_slice(bytes)), now);
    }

    fn handshake(relay: &mut Relay, n: u64, now: u64) {
        send(
            relay,
            n,
            ClientMessage::Handshake {
                id: format!("client-{n}"),
                version: 1,
            },
            now,
        );
    }

    fn update(instance: &str, tag: u16, pid: u16, mass: u32) -> ClientMessage {
        ClientMessage::StateUpdate(StateUpdate {
            instance: instance.into(),
            tag,
            primary: Identity::new(pid, mass, 0),
            secondary: None,
        })
    }

    /// Open + handshake + drain the ack.
    fn confirmed(relay: &mut Relay, n: u64, now: u64) -> UnboundedReceiver<Outbound> {
        let mut rx = open(relay, n, now);
        handshake(relay, n, now);
        assert_eq!(messages(&mut rx), vec![ServerMessage::HandshakeAck]);
        rx
    }

    fn drain(rx: &mut UnboundedReceiver<Outbound>) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            out.push(item);
        }
        out
    }

    fn messages_of(items: Vec<Outbound>) -> Vec<ServerMessage> {
        items
            .into_iter()
            .map(|item| match item {
                Outbound::Frame(bytes) => ServerMessage::decode(&bytes).unwrap(),
                Outbound::Close(reason) => panic!("unexpected close {reason:?}"),
            })
            .collect()
    }

    fn messages(rx: &mut UnboundedReceiver<Outbound>) -> Vec<ServerMessage> {
        messages_of(drain(rx))
    }

    fn assert_closed(rx: &mut UnboundedReceiver<Outbound>, reason: CloseReason) {
        let items = drain(rx);
        assert_eq!(items.last(), Some(&Outbound::Close(reason)), "got {items:?}");
    }

    fn snapshot(entries: &[(u16, u32, u8)]) -> ServerMessage {
        ServerMessage::Snapshot {
            entries: entries
                .iter()
                .map(|&(pid, mass, flags)| Identity::new(pid, mass, flags))
                .collect(),
        }
    }

    fn lobby_of(relay: &Relay, n: u64) -> Option<LobbyKey> {
        relay.sessions().get(ConnId(n)).and_then(|s| s.lobby().cloned())
    }

    #[test]
    fn handshake_is_acknowledged() {
        let mut relay = relay();
        let mut rx = open(&mut relay, 1, T0);
        send(
            &mut relay,
            1,
            ClientMessage::Handshake {
                id: "abc".into(),
                version: 1,
            },
            T0,
        );
        let items = drain(&mut rx);
        assert_eq!(items, vec![Outbound::Frame(Bytes::from_static(&[1]))]);

        let session = relay.sessions().get(ConnId(1)).unwrap();
        assert!(session.is_confirmed());
        assert_eq!(session.client_id(), Some("abc"));
    }

    #[test]
    fn second_handshake_is_invalid_opcode() {
        let mut relay = relay();
        let mut rx = confirmed(&mut relay, 1, T0);
        handshake(&mut relay, 1, T0);
        assert_closed(&mut rx, CloseReason::InvalidOpcode);
        assert!(relay.sessions().is_empty());
    }

    #[test]
    fn outdated_version_closes_with_distinct_code() {
        let mut relay = relay();
        let mut rx = open(&mut relay, 1, T0);
        send(
            &mut relay,
            1,
            ClientMessage::Handshake {
                id: "old".into(),
                version: 0,
            },
            T0,
        );
        assert_closed(&mut rx, CloseReason::Outdated);
        assert_eq!(CloseReason::Outdated.code(), 1008);
        assert!(relay.sessions().is_empty());
    }

    #[test]
    fn frame_errors_describe_themselves() {
        assert_eq!(
            FrameError::Outdated(0).to_string(),
            "protocol version 0 is below minimum 1"
        );
        let decode: FrameError = DecodeError::Empty.into();
        assert_eq!(decode.close_reason(), CloseReason::Malformed);
        assert_eq!(decode.to_string(), DecodeError::Empty.to_string());
    }

    #[test]
    fn update_before_handshake_is_invalid_opcode() {
        let mut relay = relay();
        let mut rx = open(&mut relay, 1, T0);
        send(&mut relay, 1, update("x", 5, 42, 1000), T0);
        assert_closed(&mut rx, CloseReason::InvalidOpcode);
        assert!(relay.lobbies().is_empty());
        assert!(relay.sessions().is_empty());
    }

    #[test]
    fn marker_before_handshake_is_invalid_opcode() {
        let mut relay = relay();
        let mut rx = open(&mut relay, 1, T0);
        send(&mut relay, 1, ClientMessage::Marker { x: 1, y: 1 }, T0);
        assert_closed(&mut rx, CloseReason::InvalidOpcode);
    }

    #[test]
    fn state_check_precedes_payload_decoding() {
        // Truncated update from an unconfirmed session: state error wins.
        let mut relay = relay();
        let mut rx = open(&mut relay, 1, T0);
        send_raw(&mut relay, 1, &[2, b'x'], T0);
        assert_closed(&mut rx, CloseReason::InvalidOpcode);
    }

    #[test]
    fn text_frame_is_unsupported() {
        let mut relay = relay();
        let mut rx = confirmed(&mut relay, 1, T0);
        relay.handle_frame(ConnId(1), Inbound::Text, T0);
        assert_closed(&mut rx, CloseReason::Unsupported);
    }

    #[test]
    fn framing_errors() {
        let mut relay = relay();

        let mut empty = confirmed(&mut relay, 1, T0);
        send_raw(&mut relay, 1, &[], T0);
        assert_closed(&mut empty, CloseReason::Malformed);

        let mut truncated = confirmed(&mut relay, 2, T0);
        send_raw(&mut relay, 2, &[2, b'x', 0, 5], T0);
        assert_closed(&mut truncated, CloseReason::Malformed);

        let mut unknown = confirmed(&mut relay, 3, T0);
        send_raw(&mut relay, 3, &[3], T0);
        assert_closed(&mut unknown, CloseReason::InvalidOpcode);

        assert!(relay.sessions().is_empty());
    }

    #[test]
    fn single_member_snapshot() {
        let mut relay = relay();
        let mut rx = confirmed(&mut relay, 1, T0);
        send(&mut relay, 1, update("x", 5, 42, 1000), T0);
        assert_eq!(lobby_of(&relay, 1), Some(LobbyKey::new("x", 5)));
        assert!(messages(&mut rx).is_empty(), "snapshots only go out on tick");

        relay.tick(T0 + 500);
        assert_eq!(messages(&mut rx), vec![snapshot(&[(42, 1000, 0)])]);
    }

    #[test]
    fn two_members_get_identical_snapshot_in_join_order() {
        let mut relay = relay();
        let mut a = confirmed(&mut relay, 1, T0);
        let mut b = confirmed(&mut relay, 2, T0);
        send(&mut relay, 1, update("x", 5, 42, 1000), T0);
        send(&mut relay, 2, update("x", 5, 7, 500), T0);

        relay.tick(T0 + 500);
        let expected = snapshot(&[(42, 1000, 0), (7, 500, 0)]);
        let frames_a = drain(&mut a);
        let frames_b = drain(&mut b);
        assert_eq!(frames_a, frames_b);
        assert_eq!(messages_of(frames_a), vec![expected]);
    }

    #[test]
    fn secondary_identity_follows_its_primary() {
        let mut relay = relay();
        let mut a = confirmed(&mut relay, 1, T0);
        let _b = confirmed(&mut relay, 2, T0);
        send(
            &mut relay,
            1,
            ClientMessage::StateUpdate(StateUpdate {
                instance: "x".into(),
                tag: 5,
                primary: Identity::new(42, 1000, 1),
                secondary: Some(Identity::new(43, 300, 2)),
            }),
            T0,
        );
        send(&mut relay, 2, update("x", 5, 7, 500), T0);

        relay.tick(T0 + 500);
        assert_eq!(
            messages(&mut a),
            vec![snapshot(&[(42, 1000, 1), (43, 300, 2), (7, 500, 0)])]
        );
    }

    #[test]
    fn secondary_without_pid_is_not_broadcast() {
        let mut relay = relay();
        let mut a = confirmed(&mut relay, 1, T0);
        send(
            &mut relay,
            1,
            ClientMessage::StateUpdate(StateUpdate {
                instance: "x".into(),
                tag: 5,
                primary: Identity::new(42, 1000, 0),
                secondary: Some(Identity::new(0, 0, 0)),
            }),
            T0,
        );

        relay.tick(T0 + 500);
        let frames = drain(&mut a);
        match &frames[..] {
            [Outbound::Frame(bytes)] => assert_eq!(bytes[1], 1, "count byte"),
            other => panic!("expected one snapshot, got {other:?}"),
        }
        assert_eq!(messages_of(frames), vec![snapshot(&[(42, 1000, 0)])]);
        assert_eq!(
            relay.sessions().get(ConnId(1)).unwrap().secondary(),
            Some(Identity::new(0, 0, 0))
        );
    }

    #[test]
    fn full_snapshot_keeps_member_pairs_whole() {
        // 128 members with two entries each: the last pair would cross 255.
        let mut relay = relay();
        let mut first = confirmed(&mut relay, 1, T0);
        for n in 2..=128 {
            let _rx = confirmed(&mut relay, n, T0);
        }
        for n in 1..=128u64 {
            let pid = n as u16 * 2;
            send(
                &mut relay,
                n,
                ClientMessage::StateUpdate(StateUpdate {
                    instance: "x".into(),
                    tag: 5,
                    primary: Identity::new(pid, 100, 0),
                    secondary: Some(Identity::new(pid + 1, 10, 1)),
                }),
                T0,
            );
        }

        relay.tick(T0 + 500);
        let frames = drain(&mut first);
        match &frames[..] {
            [Outbound::Frame(bytes)] => assert_eq!(bytes[1], 254, "count byte"),
            other => panic!("expected one snapshot, got {other:?}"),
        }
        let Some(ServerMessage::Snapshot { entries }) = messages_of(frames).pop() else {
            panic!("expected a snapshot");
        };
        assert_eq!(entries.len(), 254);
        for pair in entries.chunks(2) {
            assert_eq!(pair[1].pid, pair[0].pid + 1);
        }
        assert_eq!(entries.last().unwrap().pid, 127 * 2 + 1);
    }

    #[test]
    fn sentinel_tag_zero_and_pid_zero_leave_the_lobby() {
        for leave in [
            update(NO_INSTANCE, 5, 42, 1000),
            update("null", 5, 42, 1000),
            update("x", 0, 42, 1000),
            update("x", 5, 0, 1000),
        ] {
            let mut relay = relay();
            let _rx = confirmed(&mut relay, 1, T0);
            send(&mut relay, 1, update("x", 5, 42, 1000), T0);
            assert_eq!(relay.stats().lobbies, 1);

            send(&mut relay, 1, leave, T0);
            assert_eq!(lobby_of(&relay, 1), None);
            assert!(relay.lobbies().is_empty(), "empty lobby must be destroyed");
        }
    }

    #[test]
    fn rejoin_after_leave_with_same_key() {
        let mut relay = relay();
        let _rx = confirmed(&mut relay, 1, T0);
        send(&mut relay, 1, update("x", 5, 0, 1000), T0);
        assert_eq!(lobby_of(&relay, 1), None);
        // Same instance and tag as the stored ones, now with a pid.
        send(&mut relay, 1, update("x", 5, 42, 1000), T0);
        assert_eq!(lobby_of(&relay, 1), Some(LobbyKey::new("x", 5)));
        let session = relay.sessions().get(ConnId(1)).unwrap();
        assert_eq!(session.instance(), Some("x"));
        assert_eq!(session.tag(), 5);
    }

    #[test]
    fn changing_key_moves_between_lobbies() {
        let mut relay = relay();
        let _a = confirmed(&mut relay, 1, T0);
        let _b = confirmed(&mut relay, 2, T0);
        send(&mut relay, 1, update("x", 5, 42, 1000), T0);
        send(&mut relay, 2, update("x", 5, 7, 500), T0);

        send(&mut relay, 1, update("y", 5, 42, 1000), T0);
        assert_eq!(lobby_of(&relay, 1), Some(LobbyKey::new("y", 5)));
        let old = relay.lobbies().get(&LobbyKey::new("x", 5)).unwrap();
        assert_eq!(old.members(), &[ConnId(2)]);
        assert_eq!(relay.stats().lobbies, 2);
    }

    #[test]
    fn repeated_update_keeps_position() {
        let mut relay = relay();
        let mut a = confirmed(&mut relay, 1, T0);
        let _b = confirmed(&mut relay, 2, T0);
        send(&mut relay, 1, update("x", 5, 42, 1000), T0);
        send(&mut relay, 2, update("x", 5, 7, 500), T0);
        send(&mut relay, 1, update("x", 5, 42, 1200), T0);

        let lobby = relay.lobbies().get(&LobbyKey::new("x", 5)).unwrap();
        assert_eq!(lobby.members(), &[ConnId(1), ConnId(2)]);

        relay.tick(T0 + 500);
        assert_eq!(messages(&mut a), vec![snapshot(&[(42, 1200, 0), (7, 500, 0)])]);
    }

    #[test]
    fn marker_is_relayed_immediately_to_whole_lobby() {
        let mut relay = relay();
        let mut a = confirmed(&mut relay, 1, T0);
        let mut b = confirmed(&mut relay, 2, T0);
        let mut outsider = confirmed(&mut relay, 3, T0);
        send(&mut relay, 1, update("x", 5, 42, 1000), T0);
        send(&mut relay, 2, update("x", 5, 7, 500), T0);
        send(&mut relay, 3, update("x", 6, 9, 500), T0);

        let received_at = T0 + 123;
        send(&mut relay, 1, ClientMessage::Marker { x: 100, y: -200 }, received_at);

        let expected = ServerMessage::Marker {
            pid: 42,
            x: 100,
            y: -200,
            expires_at: (received_at + 5_000) as f64,
        };
        assert_eq!(messages(&mut a), vec![expected.clone()]);
        assert_eq!(messages(&mut b), vec![expected]);
        assert!(messages(&mut outsider).is_empty());
    }

    #[test]
    fn marker_outside_lobby_is_ignored() {
        let mut relay = relay();
        let mut rx = confirmed(&mut relay, 1, T0);
        send(&mut relay, 1, ClientMessage::Marker { x: 1, y: 2 }, T0);
        assert!(drain(&mut rx).is_empty());
        assert_eq!(relay.stats().sockets, 1);
    }

    #[test]
    fn idle_session_is_pinged_once_then_closed() {
        let mut relay = relay();
        let mut rx = confirmed(&mut relay, 1, T0);
        send(&mut relay, 1, update("x", 5, 42, 1000), T0);

        relay.liveness_sweep(T0 + 29_999);
        assert!(drain(&mut rx).is_empty());

        relay.liveness_sweep(T0 + 30_000);
        assert_eq!(messages(&mut rx), vec![ServerMessage::Ping]);
        assert!(relay.sessions().get(ConnId(1)).unwrap().pending_ping());

        for t in [30_500, 35_000, 39_999] {
            relay.liveness_sweep(T0 + t);
            assert!(drain(&mut rx).is_empty(), "second ping at {t}");
        }

        relay.liveness_sweep(T0 + 40_000);
        assert_closed(&mut rx, CloseReason::Inactive);
        assert!(relay.sessions().is_empty());
        assert!(relay.lobbies().is_empty());
    }

    #[test]
    fn very_idle_unpinged_session_is_pinged_before_close() {
        let mut relay = relay();
        let mut rx = confirmed(&mut relay, 1, T0);
        relay.liveness_sweep(T0 + 60_000);
        assert_eq!(messages(&mut rx), vec![ServerMessage::Ping]);
        relay.liveness_sweep(T0 + 60_500);
        assert_closed(&mut rx, CloseReason::Inactive);
    }

    #[test]
    fn any_frame_resets_idle_clock() {
        let mut relay = relay();
        let mut rx = confirmed(&mut relay, 1, T0);
        relay.liveness_sweep(T0 + 30_000);
        assert_eq!(messages(&mut rx), vec![ServerMessage::Ping]);

        send(&mut relay, 1, update("x", 5, 42, 1000), T0 + 31_000);
        let session = relay.sessions().get(ConnId(1)).unwrap();
        assert!(!session.pending_ping());
        assert_eq!(session.idle_ms(T0 + 31_000), 0);

        relay.liveness_sweep(T0 + 45_000);
        assert!(drain(&mut rx).is_empty());
        relay.liveness_sweep(T0 + 61_000);
        assert_eq!(messages(&mut rx), vec![ServerMessage::Ping]);
    }

    #[test]
    fn liveness_runs_before_snapshots() {
        let mut relay = relay();
        let mut a = confirmed(&mut relay, 1, T0);
        let mut b = confirmed(&mut relay, 2, T0);
        send(&mut relay, 1, update("x", 5, 42, 1000), T0);
        send(&mut relay, 2, update("x", 5, 7, 500), T0 + 35_000);

        relay.tick(T0 + 30_000);
        drain(&mut a);
        drain(&mut b);

        // Session 1 expires; session 2's snapshot no longer includes it.
        relay.tick(T0 + 40_000);
        assert_closed(&mut a, CloseReason::Inactive);
        assert_eq!(messages(&mut b), vec![snapshot(&[(7, 500, 0)])]);
    }

    #[test]
    fn transport_close_tears_down_lobby_membership() {
        let mut relay = relay();
        let _a = confirmed(&mut relay, 1, T0);
        let mut b = confirmed(&mut relay, 2, T0);
        send(&mut relay, 1, update("x", 5, 42, 1000), T0);
        send(&mut relay, 2, update("x", 5, 7, 500), T0);

        relay.close(ConnId(1));
        assert!(relay.sessions().get(ConnId(1)).is_none());
        relay.tick(T0 + 500);
        assert_eq!(messages(&mut b), vec![snapshot(&[(7, 500, 0)])]);

        relay.close(ConnId(2));
        assert_eq!(relay.stats(), RelayStats { lobbies: 0, sockets: 0 });
    }

    #[test]
    fn frames_after_relay_close_are_dropped() {
        let mut relay = relay();
        let mut rx = open(&mut relay, 1, T0);
        send_raw(&mut relay, 1, &[9], T0);
        assert_closed(&mut rx, CloseReason::InvalidOpcode);

        handshake(&mut relay, 1, T0);
        assert!(drain(&mut rx).is_empty());
        relay.close(ConnId(1));
        assert!(relay.sessions().is_empty());
    }

    #[test]
    fn one_bad_connection_does_not_disturb_others() {
        let mut relay = relay();
        let mut good = confirmed(&mut relay, 1, T0);
        let mut bad = confirmed(&mut relay, 2, T0);
        send(&mut relay, 1, update("x", 5, 42, 1000), T0);
        send(&mut relay, 2, update("x", 5, 7, 500), T0);

        send_raw(&mut relay, 2, &[4, 1], T0);
        assert_closed(&mut bad, CloseReason::Malformed);

        relay.tick(T0 + 500);
        assert_eq!(messages(&mut good), vec![snapshot(&[(42, 1000, 0)])]);
    }

    #[test]
    fn session_lobby_and_directory_agree() {
        let mut relay = relay();
        let mut receivers = Vec::new();
        for n in 1..=4 {
            receivers.push(confirmed(&mut relay, n, T0));
        }
        let script = [
            (1, update("x", 5, 1, 1)),
            (2, update("x", 5, 2, 1)),
            (3, update("y", 1, 3, 1)),
            (1, update("y", 1, 1, 1)),
            (2, update(NO_INSTANCE, 0, 0, 0)),
            (4, update("x", 5, 4, 1)),
            (3, update("x", 5, 3, 1)),
        ];
        for (n, msg) in script {
            send(&mut relay, n, msg, T0);
            for session in relay.sessions().iter() {
                if let Some(key) = session.lobby() {
                    let lobby = relay.lobbies().get(key).unwrap();
                    assert!(lobby.members().contains(&session.conn()));
                }
            }
            for (key, lobby) in relay.lobbies().iter() {
                assert!(!lobby.is_empty());
                for member in lobby.members() {
                    let session = relay.sessions().get(*member).unwrap();
                    assert_eq!(session.lobby(), Some(key));
                }
            }
        }
        relay.close(ConnId(3));
        assert_eq!(
            relay.lobbies().get(&LobbyKey::new("x", 5)).unwrap().members(),
            &[ConnId(4)]
        );
    }

    #[test]
    fn listings_reflect_state() {
        let mut relay = relay();
        let _a = confirmed(&mut relay, 1, T0);
        let _b = open(&mut relay, 2, T0);
        send(&mut relay, 1, update("x", 5, 42, 1000), T0);

        assert_eq!(relay.stats(), RelayStats { lobbies: 1, sockets: 2 });

        let lobbies = relay.lobby_listing(T0 + 1_000);
        assert_eq!(lobbies.len(), 1);
        assert_eq!(lobbies[0].instance, "x");
        assert_eq!(lobbies[0].members[0].primary.pid, 42);
        assert_eq!(lobbies[0].members[0].idle_ms, 1_000);

        let sessions = relay.session_listing(T0);
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[1].state, SessionState::Unconfirmed);

        let json = serde_json::to_value(relay.stats()).unwrap();
        assert_eq!(json, serde_json::json!({"lobbies": 1, "sockets": 2}));
    }
}
