// Per-connection session state and the registry that owns it.
//
// A `Session` exists for exactly as long as its WebSocket connection. It is
// keyed by a `ConnId` the transport issues at accept time (a monotonically
// increasing counter), never by any property of the socket itself. The
// `SessionRegistry` is a plain `BTreeMap` owned by `Relay`; all mutation
// happens from the relay's single owner task, so there is no internal locking.
//
// Writing to clients: each session holds an `Outbox`, the sending half of an
// unbounded channel drained by that connection's writer task (see
// `server.rs`). Sends are fire-and-forget. If the writer task is already gone
// the frame is silently dropped; the transport will report the close shortly
// and the relay tears the session down then.
//
// Lobby membership is recorded on the session as `lobby: Option<LobbyKey>`,
// but only `Relay` changes it, in the same step that changes the
// `LobbyDirectory`, so the two always agree.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use lobby_relay_protocol::{CloseReason, Identity, StateUpdate};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::lobby::LobbyKey;

/// Transport-issued connection handle, unique for the lifetime of the process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Work item for a connection's writer task.
#[derive(Clone, Debug, PartialEq)]
pub enum Outbound {
    /// A binary frame. Broadcast frames share one buffer across recipients.
    Frame(Bytes),
    /// Send a close frame with this reason and stop writing.
    Close(CloseReason),
}

/// Sending half of a connection's outbound queue.
#[derive(Clone, Debug)]
pub struct Outbox(mpsc::UnboundedSender<Outbound>);

impl Outbox {
    pub fn new(tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self(tx)
    }

    /// Create an outbox together with the receiver its writer task drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(tx), rx)
    }

    pub fn send(&self, frame: Bytes) {
        let _ = self.0.send(Outbound::Frame(frame));
    }

    pub fn close(&self, reason: CloseReason) {
        let _ = self.0.send(Outbound::Close(reason));
    }
}

/// Handshake state. Only ever moves forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Unconfirmed,
    Confirmed,
}

/// Server-side state for one live connection.
#[derive(Debug)]
pub struct Session {
    conn: ConnId,
    state: SessionState,
    client_id: Option<String>,
    last_activity: u64,
    pending_ping: bool,
    lobby: Option<LobbyKey>,
    instance: Option<String>,
    tag: u16,
    primary: Identity,
    secondary: Option<Identity>,
    outbox: Outbox,
}

impl Session {
    /// A freshly accepted, unconfirmed session. `now` is epoch milliseconds.
    pub fn new(conn: ConnId, outbox: Outbox, now: u64) -> Self {
        Self {
            conn,
            state: SessionState::Unconfirmed,
            client_id: None,
            last_activity: now,
            pending_ping: false,
            lobby: None,
            instance: None,
            tag: 0,
            primary: Identity::default(),
            secondary: None,
            outbox,
        }
    }

    pub fn conn(&self) -> ConnId {
        self.conn
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_confirmed(&self) -> bool {
        self.state == SessionState::Confirmed
    }

    /// Complete the handshake.
    pub fn confirm(&mut self, client_id: String) {
        self.client_id = Some(client_id);
        self.state = SessionState::Confirmed;
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    /// Record inbound activity: resets the idle clock and clears any
    /// outstanding ping.
    pub fn touch(&mut self, now: u64) {
        self.last_activity = now;
        self.pending_ping = false;
    }

    pub fn last_activity(&self) -> u64 {
        self.last_activity
    }

    /// Milliseconds since the last inbound frame.
    pub fn idle_ms(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_activity)
    }

    pub fn pending_ping(&self) -> bool {
        self.pending_ping
    }

    pub(crate) fn set_pending_ping(&mut self, pending: bool) {
        self.pending_ping = pending;
    }

    /// Copy the identity fields and reported instance/tag from an update.
    /// The secondary identity is replaced wholesale, so it is cleared when the
    /// update carries none.
    pub fn apply_update(&mut self, update: &StateUpdate) {
        self.primary = update.primary;
        self.secondary = update.secondary;
        self.instance = Some(update.instance.clone());
        self.tag = update.tag;
    }

    pub fn primary(&self) -> Identity {
        self.primary
    }

    pub fn secondary(&self) -> Option<Identity> {
        self.secondary
    }

    /// Instance id from the most recent state update.
    pub fn instance(&self) -> Option<&str> {
        self.instance.as_deref()
    }

    pub fn tag(&self) -> u16 {
        self.tag
    }

    pub fn lobby(&self) -> Option<&LobbyKey> {
        self.lobby.as_ref()
    }

    pub(crate) fn set_lobby(&mut self, lobby: Option<LobbyKey>) {
        self.lobby = lobby;
    }

    /// Snapshot entries this session contributes: primary, then secondary.
    /// A secondary with pid 0 is stored but not broadcast.
    pub fn snapshot_entries(&self) -> impl Iterator<Item = Identity> + '_ {
        std::iter::once(self.primary).chain(self.secondary.filter(|s| s.pid != 0))
    }

    pub fn send(&self, frame: Bytes) {
        self.outbox.send(frame);
    }

    pub fn close(&self, reason: CloseReason) {
        self.outbox.close(reason);
    }
}

/// All live sessions, keyed by connection handle.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: BTreeMap<ConnId, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session. Returns false (and leaves the registry unchanged) if
    /// the handle is already registered.
    pub fn insert(&mut self, session: Session) -> bool {
        match self.sessions.entry(session.conn()) {
            std::collections::btree_map::Entry::Occupied(_) => false,
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(session);
                true
            }
        }
    }

    pub fn remove(&mut self, conn: ConnId) -> Option<Session> {
        self.sessions.remove(&conn)
    }

    pub fn get(&self, conn: ConnId) -> Option<&Session> {
        self.sessions.get(&conn)
    }

    pub fn get_mut(&mut self, conn: ConnId) -> Option<&mut Session> {
        self.sessions.get_mut(&conn)
    }

    pub fn contains(&self, conn: ConnId) -> bool {
        self.sessions.contains_key(&conn)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Session> {
        self.sessions.values_mut()
    }
}
