// lobby_relay — real-time lobby relay over WebSocket.
//
// Clients connect, confirm a handshake, then repeatedly report which game
// instance they are in along with a small identity record. The relay groups
// clients that report the same (instance, tag) into a lobby and, on a fixed
// tick, sends every member one merged snapshot of all members' identities.
// Markers (point events) are relayed to the sender's lobby immediately. Idle
// connections are pinged once and then closed. Nothing is persisted: all
// state lives in memory for the lifetime of the process.
//
// Module overview:
// - `session.rs`:  Per-connection `Session` state, the `SessionRegistry`
//                  that owns it, and the `Outbox` each session writes to.
// - `lobby.rs`:    `LobbyKey` and the `LobbyDirectory` of ordered member
//                  lists.
// - `relay.rs`:    `Relay`, the message-handling state machine plus the
//                  liveness and snapshot sweeps. Pure and synchronous; time
//                  is passed in.
// - `server.rs`:   axum WebSocket transport, the single-owner relay task and
//                  its tick, `RelayConfig` / `start_relay`.
// - `status.rs`:   HTTP status routes (`/count` and debug listings).
// - `client.rs`:   `NetClient`, a tokio-tungstenite client used by the
//                  integration tests and available to consumers.
//
// Dependencies: `lobby_relay_protocol` (frame layouts and message types).
//
// The relay runs as a standalone binary (`main.rs`) or embedded via the
// library API (`start_relay`).

pub mod client;
pub mod lobby;
pub mod relay;
pub mod server;
pub mod session;
mod status;

pub use relay::LivenessConfig;
pub use server::{RelayConfig, RelayHandle, start_relay};
