//! WebSocket client for the room relay.
//!
//! Thin by design: the relay owns all room state, so the client only
//! manages the connection lifecycle, forwards outgoing frames, and hands
//! every inbound frame to the application as an event. Used by the
//! integration tests and by any UI embedding the relay.

use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{ProtocolError, WireMessage, SERVER_USER};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the relay client.
#[derive(Debug, Clone)]
pub enum RelayEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// An inbound frame (chat message or server notice)
    Message(WireMessage),
}

/// The relay client.
pub struct RelayClient {
    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Server-assigned client id, learned from the welcome notice
    client_id: Arc<RwLock<Option<String>>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<String>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<RelayEvent>>,

    /// Event sender (held by the reader task)
    event_tx: mpsc::Sender<RelayEvent>,

    /// Server URL
    server_url: String,
}

impl RelayClient {
    /// Create a new relay client.
    pub fn new(server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            client_id: Arc::new(RwLock::new(None)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            server_url: server_url.into(),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<RelayEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let (ws_stream, _) = match tokio_tungstenite::connect_async(&self.server_url).await {
            Ok(ok) => ok,
            Err(_) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward the outgoing channel to the WebSocket.
        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_writer.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
        });

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(RelayEvent::Connected).await;

        // Reader task: decode inbound frames into events. The first server
        // notice carries our assigned client id; record it.
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let client_id = self.client_id.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        match WireMessage::decode(text.as_str()) {
                            Ok(frame) => {
                                if frame.user == SERVER_USER {
                                    if let Some(id) = &frame.client_id {
                                        let mut known = client_id.write().await;
                                        if known.is_none() {
                                            *known = Some(id.clone());
                                        }
                                    }
                                }
                                let _ = event_tx.send(RelayEvent::Message(frame)).await;
                            }
                            Err(e) => {
                                log::warn!("Undecodable frame from server: {e}");
                            }
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(RelayEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Send a chat message to `room`. The first message naming a room the
    /// connection is not currently in performs the join.
    pub async fn send_chat(
        &self,
        user: impl Into<String>,
        room: impl Into<String>,
        text: impl Into<String>,
    ) -> Result<(), ProtocolError> {
        self.send_message(&WireMessage::chat(user, room, text)).await
    }

    /// Request our own disconnect.
    pub async fn kill(&self) -> Result<(), ProtocolError> {
        let mut msg = WireMessage::chat("", "", "");
        msg.kill = Some(true);
        self.send_message(&msg).await
    }

    /// Request a room-wide history clear.
    pub async fn kill_room(&self, room: impl Into<String>) -> Result<(), ProtocolError> {
        let mut msg = WireMessage::chat("", room, "");
        msg.kill_room = Some(true);
        self.send_message(&msg).await
    }

    /// Send an already-encoded payload verbatim. Exists so tests can push
    /// malformed frames at the server.
    pub async fn send_raw(&self, raw: impl Into<String>) -> Result<(), ProtocolError> {
        match &self.outgoing_tx {
            Some(tx) => tx
                .send(raw.into())
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    async fn send_message(&self, msg: &WireMessage) -> Result<(), ProtocolError> {
        self.send_raw(msg.encode()?).await
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Get the server-assigned client id, once the welcome notice arrived.
    pub async fn client_id(&self) -> Option<String> {
        self.client_id.read().await.clone()
    }

    /// Get the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}
