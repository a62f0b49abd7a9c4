// Lobby directory: which connections share an (instance, tag) key.
//
// A lobby is nothing more than an ordered, duplicate-free member list. Order
// is join order and is significant: snapshot entries are written in it. The
// directory creates a lobby lazily on the first join for a key and drops it
// the moment its last member leaves, so `contains(key)` is equivalent to "has
// at least one member". Nothing else ever garbage-collects lobbies.
//
// The directory does not know about sessions. Keeping each session's `lobby`
// field in step with membership here is `Relay`'s job.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::session::ConnId;

/// Composite lobby key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct LobbyKey {
    pub instance: String,
    pub tag: u16,
}

impl LobbyKey {
    pub fn new(instance: impl Into<String>, tag: u16) -> Self {
        Self {
            instance: instance.into(),
            tag,
        }
    }
}

impl fmt::Display for LobbyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.instance, self.tag)
    }
}

/// Members of one lobby, in join order.
#[derive(Debug, Default)]
pub struct Lobby {
    members: Vec<ConnId>,
}

impl Lobby {
    /// Add a member. Returns false if it was already present.
    fn add(&mut self, conn: ConnId) -> bool {
        if self.members.contains(&conn) {
            return false;
        }
        self.members.push(conn);
        true
    }

    /// Remove a member, preserving the order of the rest.
    fn remove(&mut self, conn: ConnId) -> bool {
        match self.members.iter().position(|m| *m == conn) {
            Some(index) => {
                self.members.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn members(&self) -> &[ConnId] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// All non-empty lobbies.
#[derive(Debug, Default)]
pub struct LobbyDirectory {
    lobbies: BTreeMap<LobbyKey, Lobby>,
}

impl LobbyDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `conn` to the lobby for `key`, creating it if needed. Returns false
    /// if `conn` was already a member.
    pub fn join(&mut self, key: LobbyKey, conn: ConnId) -> bool {
        self.lobbies.entry(key).or_default().add(conn)
    }

    /// Remove `conn` from the lobby for `key`, dropping the lobby if it is
    /// now empty. Returns false if there was no such membership.
    pub fn leave(&mut self, key: &LobbyKey, conn: ConnId) -> bool {
        let Some(lobby) = self.lobbies.get_mut(key) else {
            return false;
        };
        let removed = lobby.remove(conn);
        if lobby.is_empty() {
            self.lobbies.remove(key);
        }
        removed
    }

    pub fn get(&self, key: &LobbyKey) -> Option<&Lobby> {
        self.lobbies.get(key)
    }

    pub fn contains(&self, key: &LobbyKey) -> bool {
        self.lobbies.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lobbies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lobbies.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&LobbyKey, &Lobby)> {
        self.lobbies.iter()
    }
}
