// Core value types shared by the relay and its clients.
//
// `Identity` is the (pid, mass, flags) triple every state update carries, once
// for the primary identity and optionally a second time for a linked
// sub-identity. It is also the unit a snapshot broadcast is made of, so the
// same type flows from decode through the session registry to encode.

use serde::{Deserialize, Serialize};

/// Lowest client protocol version the relay accepts in a handshake.
pub const MIN_PROTOCOL_VERSION: u8 = 1;

/// Protocol version this crate speaks.
pub const PROTOCOL_VERSION: u8 = 1;

/// Instance id a client reports when it is not in any instance.
pub const NO_INSTANCE: &str = "none";

/// Older clients stringify a missing instance as `"null"`.
pub const LEGACY_NO_INSTANCE: &str = "null";

/// Snapshot entry count travels as a single byte.
pub const MAX_SNAPSHOT_ENTRIES: usize = u8::MAX as usize;

/// One (pid, mass, flags) entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub pid: u16,
    pub mass: u32,
    pub flags: u8,
}

impl Identity {
    /// Wire size of one triple.
    pub const ENCODED_LEN: usize = 2 + 4 + 1;

    pub const fn new(pid: u16, mass: u32, flags: u8) -> Self {
        Self { pid, mass, flags }
    }
}

/// True if `instance` means "not in any instance".
pub fn is_no_instance(instance: &str) -> bool {
    instance == NO_INSTANCE || instance == LEGACY_NO_INSTANCE
}
