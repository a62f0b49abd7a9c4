// WebSocket client for connecting to the lobby relay.
//
// Provides a channel-backed interface over the binary protocol:
// - `connect()` opens the WebSocket, spawns a background reader task, sends
//   the handshake and waits for the acknowledgement.
// - The reader task decodes every binary frame into a `ServerMessage` and
//   pushes it into an unbounded channel as `ClientEvent::Message`. A close
//   frame (or the stream ending) becomes a single `ClientEvent::Closed`.
// - The caller holds the sink half for sending.
// - `poll()` drains the inbox without waiting; `recv_timeout()` waits for
//   the next event.
//
// This module lives in the relay crate so the integration tests and any
// consumer can use it without reimplementing the framing. It has no state
// beyond the socket: sending a state update does not remember anything, and
// reconnecting means calling `connect()` again.

use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use lobby_relay_protocol::{ClientMessage, CloseReason, PROTOCOL_VERSION, ServerMessage, StateUpdate};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long `connect()` waits for the handshake acknowledgement.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Close code reported for a close frame without a status.
const NO_STATUS_CLOSE: u16 = 1005;

/// Close code reported when the connection ended without a close frame.
const ABNORMAL_CLOSE: u16 = 1006;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("websocket error: {0}")]
    WebSocket(Box<tungstenite::Error>),

    #[error("relay closed the connection ({code}): {reason}")]
    Closed { code: u16, reason: String },

    #[error("no handshake acknowledgement within {0:?}")]
    Timeout(Duration),

    #[error("unexpected reply to handshake: {0:?}")]
    Unexpected(ServerMessage),
}

impl From<tungstenite::Error> for ClientError {
    fn from(err: tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}

/// Something the relay sent us.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientEvent {
    Message(ServerMessage),
    Closed { code: u16, reason: String },
}

impl ClientEvent {
    /// The relay's reason for closing, if this is a close it initiated.
    pub fn close_reason(&self) -> Option<CloseReason> {
        match self {
            Self::Closed { code, reason } => CloseReason::from_code(*code, reason),
            Self::Message(_) => None,
        }
    }
}

/// WebSocket client for relay communication.
pub struct NetClient {
    writer: SplitSink<WsStream, Message>,
    inbox: mpsc::UnboundedReceiver<ClientEvent>,
    reader: JoinHandle<()>,
}

impl NetClient {
    /// Connect to a relay at `url` (e.g. `ws://127.0.0.1:6969/`), send the
    /// handshake with `id` and wait for the acknowledgement.
    pub async fn connect(url: &str, id: &str) -> Result<Self, ClientError> {
        Self::connect_with_version(url, id, PROTOCOL_VERSION).await
    }

    /// Like `connect`, but announcing an arbitrary protocol version.
    pub async fn connect_with_version(url: &str, id: &str, version: u8) -> Result<Self, ClientError> {
        let mut client = Self::open(url).await?;
        client
            .send(&ClientMessage::Handshake {
                id: id.into(),
                version,
            })
            .await?;

        match client.recv_timeout(HANDSHAKE_TIMEOUT).await {
            Some(ClientEvent::Message(ServerMessage::HandshakeAck)) => Ok(client),
            Some(ClientEvent::Message(other)) => Err(ClientError::Unexpected(other)),
            Some(ClientEvent::Closed { code, reason }) => Err(ClientError::Closed { code, reason }),
            None => Err(ClientError::Timeout(HANDSHAKE_TIMEOUT)),
        }
    }

    /// Open the WebSocket without handshaking.
    pub async fn open(url: &str) -> Result<Self, ClientError> {
        let (ws, _response) = connect_async(url).await?;
        let (writer, ws_rx) = ws.split();
        let (tx, inbox) = mpsc::unbounded_channel();
        let reader = tokio::spawn(reader_loop(ws_rx, tx));
        debug!(url, "connected to relay");
        Ok(Self {
            writer,
            inbox,
            reader,
        })
    }

    /// Report identity and lobby. A sentinel instance, tag 0 or pid 0 leaves
    /// the current lobby.
    pub async fn send_update(&mut self, update: StateUpdate) -> Result<(), ClientError> {
        self.send(&ClientMessage::StateUpdate(update)).await
    }

    /// Drop a marker at `(x, y)` for everyone in the lobby.
    pub async fn send_marker(&mut self, x: i16, y: i16) -> Result<(), ClientError> {
        self.send(&ClientMessage::Marker { x, y }).await
    }

    /// Send arbitrary bytes as one binary frame.
    pub async fn send_raw(&mut self, frame: Vec<u8>) -> Result<(), ClientError> {
        self.writer.send(Message::binary(frame)).await?;
        Ok(())
    }

    /// Send a text frame. The relay only speaks binary.
    pub async fn send_text(&mut self, text: &str) -> Result<(), ClientError> {
        self.writer.send(Message::text(text.to_owned())).await?;
        Ok(())
    }

    async fn send(&mut self, msg: &ClientMessage) -> Result<(), ClientError> {
        self.send_raw(msg.encode()).await
    }

    /// Drain all queued events (non-blocking).
    pub fn poll(&mut self) -> Vec<ClientEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.inbox.try_recv() {
            events.push(event);
        }
        events
    }

    /// Wait up to `timeout` for the next event.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<ClientEvent> {
        tokio::time::timeout(timeout, self.inbox.recv())
            .await
            .ok()
            .flatten()
    }

    /// Close the connection from our side.
    pub async fn close(mut self) {
        let _ = self.writer.send(Message::Close(None)).await;
        let _ = self.writer.close().await;
        if tokio::time::timeout(HANDSHAKE_TIMEOUT, &mut self.reader)
            .await
            .is_err()
        {
            self.reader.abort();
        }
    }
}

/// Reader task: decode frames in a loop, push to channel.
async fn reader_loop(mut ws_rx: SplitStream<WsStream>, tx: mpsc::UnboundedSender<ClientEvent>) {
    let mut closed = false;
    while let Some(msg) = ws_rx.next().await {
        let event = match msg {
            Ok(Message::Binary(bytes)) => match ServerMessage::decode(&bytes) {
                Ok(message) => ClientEvent::Message(message),
                Err(err) => {
                    warn!(error = %err, "undecodable frame from relay");
                    continue;
                }
            },
            Ok(Message::Close(frame)) => {
                // Keep reading so the close reply gets flushed.
                closed = true;
                match frame {
                    Some(frame) => ClientEvent::Closed {
                        code: frame.code.into(),
                        reason: frame.reason.as_str().to_owned(),
                    },
                    None => ClientEvent::Closed {
                        code: NO_STATUS_CLOSE,
                        reason: String::new(),
                    },
                }
            }
            Ok(_) => continue,
            Err(err) => {
                debug!(error = %err, "relay connection ended");
                break;
            }
        };
        if tx.send(event).is_err() {
            return;
        }
    }
    if !closed {
        let _ = tx.send(ClientEvent::Closed {
            code: ABNORMAL_CLOSE,
            reason: String::new(),
        });
    }
}
