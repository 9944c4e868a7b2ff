//! WebSocket server shell around the room relay.
//!
//! Owns the TCP accept loop and, per connection, a reader loop plus a
//! writer task. The reader feeds transport events into [`RoomRelay`]; the
//! writer drains the connection's outbound channel so a slow peer never
//! blocks anyone else's broadcast.

use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use crate::relay::{Connection, Outbound, RoomRelay};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub active_rooms: usize,
}

/// The relay server.
pub struct RelayServer {
    config: RelayConfig,
    relay: Arc<RoomRelay>,
    stats: Arc<RwLock<RelayStats>>,
}

impl RelayServer {
    /// Create a new relay server with the given configuration.
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            relay: Arc::new(RoomRelay::new()),
            stats: Arc::new(RwLock::new(RelayStats::default())),
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Start listening for WebSocket connections.
    ///
    /// This runs the server event loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let relay = self.relay.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, relay, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Get server statistics.
    pub async fn stats(&self) -> RelayStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.relay.room_count().await;
        stats
    }

    /// Get the relay for direct state inspection.
    pub fn relay(&self) -> &Arc<RoomRelay> {
        &self.relay
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}

/// Handle a single WebSocket connection from handshake to teardown.
async fn handle_connection(
    stream: TcpStream,
    relay: Arc<RoomRelay>,
    stats: Arc<RwLock<RelayStats>>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    {
        let mut s = stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    let conn = Connection::new(relay.allocate_id(), out_tx);
    let conn_id = conn.id();

    // Writer task: the only owner of the socket's sending half. Broadcasts
    // land on the channel and drain here, so the relay lock is never held
    // across a socket write.
    let writer = tokio::spawn(async move {
        while let Some(out) = out_rx.recv().await {
            match out {
                Outbound::Frame(text) => {
                    if ws_sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: "Client requested termination".into(),
                    };
                    let _ = ws_sender.send(Message::Close(Some(frame))).await;
                    break;
                }
            }
        }
    });

    relay.on_open(&conn).await;

    // Reader loop: feed transport events into the relay.
    loop {
        match ws_receiver.next().await {
            Some(Ok(Message::Text(text))) => {
                {
                    let mut s = stats.write().await;
                    s.total_messages += 1;
                }
                relay.on_message(&conn, text.as_str()).await;
            }
            Some(Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Binary(_))) => {
                // Pings are answered by tungstenite's protocol layer;
                // binary frames are not part of this protocol.
            }
            Some(Ok(Message::Close(_))) | None => {
                log::debug!("Connection {conn_id} closed by peer");
                relay.on_close(conn_id).await;
                break;
            }
            Some(Err(e)) => {
                relay.on_error(conn_id, &e).await;
                break;
            }
            Some(Ok(Message::Frame(_))) => {}
        }
    }

    writer.abort();

    let mut s = stats.write().await;
    s.active_connections = s.active_connections.saturating_sub(1);
    Ok(())
}
