// Protocol messages for client-relay communication.
//
// Two enums define the full protocol vocabulary:
// - `ClientMessage`: sent by clients to the relay (handshake, state update,
//   marker).
// - `ServerMessage`: sent by the relay to clients (handshake ack, snapshot,
//   liveness ping, marker broadcast).
//
// Each frame is a single opcode byte followed by a fixed little-endian layout
// (see `codec.rs`). There is no per-field tagging: the only optional data on
// the wire is the secondary identity at the tail of a state update, and its
// presence is signalled purely by whether bytes remain after the primary
// identity. Decoding does that check explicitly instead of attempting the read
// and recovering from the error.
//
// Close reasons live here too because the numeric codes are part of the
// contract with clients, even though the relay sends them as WebSocket close
// frames rather than protocol frames.

use crate::codec::{DecodeError, Reader, Writer, str_len};
use crate::types::{Identity, MAX_SNAPSHOT_ENTRIES, is_no_instance};

/// Opcodes a client may send.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientOpcode {
    Handshake = 1,
    StateUpdate = 2,
    Marker = 4,
}

impl ClientOpcode {
    /// Peek the opcode of a frame without decoding the payload.
    pub fn of_frame(frame: &[u8]) -> Result<Self, DecodeError> {
        let first = *frame.first().ok_or(DecodeError::Empty)?;
        Self::try_from(first)
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for ClientOpcode {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Handshake),
            2 => Ok(Self::StateUpdate),
            4 => Ok(Self::Marker),
            other => Err(DecodeError::UnknownOpcode(other)),
        }
    }
}

/// Opcodes the relay sends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerOpcode {
    HandshakeAck = 1,
    Snapshot = 2,
    Ping = 3,
    Marker = 4,
}

impl TryFrom<u8> for ServerOpcode {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::HandshakeAck),
            2 => Ok(Self::Snapshot),
            3 => Ok(Self::Ping),
            4 => Ok(Self::Marker),
            other => Err(DecodeError::UnknownOpcode(other)),
        }
    }
}

/// Payload of a client state update (opcode 2).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateUpdate {
    pub instance: String,
    pub tag: u16,
    pub primary: Identity,
    pub secondary: Option<Identity>,
}

impl StateUpdate {
    /// Whether this update places the client in a lobby. An update with the
    /// "no instance" sentinel, tag 0 or pid 0 means "not in any lobby".
    pub fn wants_lobby(&self) -> bool {
        !is_no_instance(&self.instance) && self.tag != 0 && self.primary.pid != 0
    }

    /// Length of the frame up to and including the primary identity.
    pub fn primary_len(&self) -> usize {
        1 + str_len(&self.instance) + 2 + Identity::ENCODED_LEN
    }

    fn encoded_len(&self) -> usize {
        self.primary_len() + self.secondary.map_or(0, |_| Identity::ENCODED_LEN)
    }

    fn decode_payload(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let instance = reader.read_str()?;
        let tag = reader.read_u16()?;
        let primary = read_identity(reader)?;
        // Trailing secondary identity is present only if bytes remain.
        let secondary = if reader.has_remaining() {
            Some(read_identity(reader)?)
        } else {
            None
        };
        Ok(Self {
            instance,
            tag,
            primary,
            secondary,
        })
    }
}

/// Messages sent by a client to the relay.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientMessage {
    /// First frame of every connection.
    Handshake { id: String, version: u8 },
    /// Current instance, tag and identities.
    StateUpdate(StateUpdate),
    /// Point event to relay to the sender's lobby.
    Marker { x: i16, y: i16 },
}

impl ClientMessage {
    pub fn opcode(&self) -> ClientOpcode {
        match self {
            Self::Handshake { .. } => ClientOpcode::Handshake,
            Self::StateUpdate(_) => ClientOpcode::StateUpdate,
            Self::Marker { .. } => ClientOpcode::Marker,
        }
    }

    /// Decode a complete frame. Bytes after the last field are ignored.
    pub fn decode(frame: &[u8]) -> Result<Self, DecodeError> {
        let opcode = ClientOpcode::of_frame(frame)?;
        let mut reader = Reader::new(&frame[1..]);
        match opcode {
            ClientOpcode::Handshake => {
                let id = reader.read_str()?;
                let version = reader.read_u8()?;
                Ok(Self::Handshake { id, version })
            }
            ClientOpcode::StateUpdate => {
                StateUpdate::decode_payload(&mut reader).map(Self::StateUpdate)
            }
            ClientOpcode::Marker => {
                let x = reader.read_i16()?;
                let y = reader.read_i16()?;
                Ok(Self::Marker { x, y })
            }
        }
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            Self::Handshake { id, .. } => 1 + str_len(id) + 1,
            Self::StateUpdate(update) => update.encoded_len(),
            Self::Marker { .. } => 1 + 2 + 2,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::with_len(self.encoded_len());
        w.write_u8(self.opcode().code());
        match self {
            Self::Handshake { id, version } => {
                w.write_str(id).write_u8(*version);
            }
            Self::StateUpdate(update) => {
                w.write_str(&update.instance).write_u16(update.tag);
                write_identity(&mut w, &update.primary);
                if let Some(secondary) = &update.secondary {
                    write_identity(&mut w, secondary);
                }
            }
            Self::Marker { x, y } => {
                w.write_i16(*x).write_i16(*y);
            }
        }
        w.finish()
    }
}

/// Messages sent by the relay to a client.
#[derive(Clone, Debug, PartialEq)]
pub enum ServerMessage {
    /// Handshake accepted.
    HandshakeAck,
    /// Periodic merged view of every identity in the client's lobby.
    Snapshot { entries: Vec<Identity> },
    /// The relay has not heard from the client for a while.
    Ping,
    /// A lobby member placed a marker. `expires_at` is epoch milliseconds.
    Marker {
        pid: u16,
        x: i16,
        y: i16,
        expires_at: f64,
    },
}

impl ServerMessage {
    pub const MARKER_LEN: usize = 1 + 2 + 2 + 2 + 8;

    pub fn opcode(&self) -> ServerOpcode {
        match self {
            Self::HandshakeAck => ServerOpcode::HandshakeAck,
            Self::Snapshot { .. } => ServerOpcode::Snapshot,
            Self::Ping => ServerOpcode::Ping,
            Self::Marker { .. } => ServerOpcode::Marker,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::HandshakeAck | Self::Ping => vec![self.opcode() as u8],
            Self::Snapshot { entries } => encode_snapshot(entries),
            Self::Marker {
                pid,
                x,
                y,
                expires_at,
            } => {
                let mut w = Writer::with_len(Self::MARKER_LEN);
                w.write_u8(ServerOpcode::Marker as u8)
                    .write_u16(*pid)
                    .write_i16(*x)
                    .write_i16(*y)
                    .write_f64(*expires_at);
                w.finish()
            }
        }
    }

    pub fn decode(frame: &[u8]) -> Result<Self, DecodeError> {
        let first = *frame.first().ok_or(DecodeError::Empty)?;
        let mut reader = Reader::new(&frame[1..]);
        match ServerOpcode::try_from(first)? {
            ServerOpcode::HandshakeAck => Ok(Self::HandshakeAck),
            ServerOpcode::Ping => Ok(Self::Ping),
            ServerOpcode::Snapshot => {
                let count = reader.read_u8()?;
                let entries = (0..count)
                    .map(|_| read_identity(&mut reader))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Self::Snapshot { entries })
            }
            ServerOpcode::Marker => Ok(Self::Marker {
                pid: reader.read_u16()?,
                x: reader.read_i16()?,
                y: reader.read_i16()?,
                expires_at: reader.read_f64()?,
            }),
        }
    }
}

/// Encode a snapshot frame from already-flattened entries. At most
/// `MAX_SNAPSHOT_ENTRIES` entries are written; the caller decides whether
/// truncation is worth reporting.
pub fn encode_snapshot(entries: &[Identity]) -> Vec<u8> {
    let count = entries.len().min(MAX_SNAPSHOT_ENTRIES);
    let mut w = Writer::with_len(2 + count * Identity::ENCODED_LEN);
    // `count` is clamped to u8::MAX above.
    w.write_u8(ServerOpcode::Snapshot as u8).write_u8(count as u8);
    for entry in &entries[..count] {
        write_identity(&mut w, entry);
    }
    w.finish()
}

fn read_identity(reader: &mut Reader<'_>) -> Result<Identity, DecodeError> {
    Ok(Identity {
        pid: reader.read_u16()?,
        mass: reader.read_u32()?,
        flags: reader.read_u8()?,
    })
}

fn write_identity(w: &mut Writer, identity: &Identity) {
    w.write_u16(identity.pid)
        .write_u32(identity.mass)
        .write_u8(identity.flags);
}

/// Why the relay closed a connection. Sent as the WebSocket close code and
/// reason text.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// Liveness expired after an unanswered ping.
    Inactive,
    /// A frame could not be decoded.
    Malformed,
    /// A text (non-binary) frame was received.
    Unsupported,
    /// Opcode unknown or not allowed in the session's state.
    InvalidOpcode,
    /// Handshake version below `MIN_PROTOCOL_VERSION`.
    Outdated,
}

impl CloseReason {
    pub fn code(self) -> u16 {
        match self {
            Self::Inactive => 1000,
            Self::Malformed => 1002,
            Self::Unsupported | Self::InvalidOpcode => 1003,
            Self::Outdated => 1008,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            Self::Inactive => "Inactive",
            Self::Malformed => "Malformed frame",
            Self::Unsupported => "Unsupported frame",
            Self::InvalidOpcode => "Invalid opcode",
            Self::Outdated => "Outdated protocol version",
        }
    }

    /// Recover the reason from a received close frame. Code 1003 is shared,
    /// so the message text decides between its two reasons.
    pub fn from_code(code: u16, message: &str) -> Option<Self> {
        match code {
            1000 => Some(Self::Inactive),
            1002 => Some(Self::Malformed),
            1003 if message == Self::Unsupported.message() => Some(Self::Unsupported),
            1003 => Some(Self::InvalidOpcode),
            1008 => Some(Self::Outdated),
            _ => None,
        }
    }
}
