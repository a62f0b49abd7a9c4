// lobby_relay_protocol — binary wire protocol for the lobby relay.
//
// This crate defines the frame layouts, message types and close reasons used
// by the relay (`lobby_relay`) and its clients. It is shared between both
// sides and has no networking or async dependency: everything operates on
// complete frames as `&[u8]` / `Vec<u8>`.
//
// Module overview:
// - `codec.rs`:    Little-endian `Reader`/`Writer` cursors, NUL-terminated
//                  8-bit and wide strings, `DecodeError`.
// - `message.rs`:  `ClientMessage` / `ServerMessage` with their opcodes,
//                  `StateUpdate`, snapshot encoding, `CloseReason`.
// - `types.rs`:    The `Identity` triple and protocol constants.
//
// Design decisions:
// - **Opcode byte only.** Frames have no length prefix; the WebSocket message
//   boundary is the frame boundary. The optional secondary identity on a
//   state update is detected by remaining length alone.
// - **Exact-size encoding.** Every encoder computes the frame length up front
//   and writes into a single allocation of that size.
// - **Errors, not panics.** All decode paths return `DecodeError`; the relay
//   maps those to close codes.

pub mod codec;
pub mod message;
pub mod types;

pub use codec::{DecodeError, Reader, Writer};
pub use message::{
    ClientMessage, ClientOpcode, CloseReason, ServerMessage, ServerOpcode, StateUpdate,
    encode_snapshot,
};
pub use types::{
    Identity, LEGACY_NO_INSTANCE, MAX_SNAPSHOT_ENTRIES, MIN_PROTOCOL_VERSION, NO_INSTANCE,
    PROTOCOL_VERSION, is_no_instance,
};
