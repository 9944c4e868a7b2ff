//! The room relay: shared membership state and the lifecycle operations
//! the transport invokes on it.
//!
//! ## Architecture
//!
//! ```text
//! reader task ──► RoomRelay::on_message ──┐
//!                                         │  (one Mutex, no awaits held)
//!                 ┌───────────────────────┤
//!                 ▼                       ▼
//!         connection → room        room → members
//!         connection → client id          │
//!                 │                       │ snapshot + single-attempt send
//!                 ▼                       ▼
//!          writer task A           writer tasks B, C, …
//! ```
//!
//! Three mappings live behind one `tokio::sync::Mutex` and are only ever
//! touched through the operations below, each of which is a single atomic
//! read-modify-write. The central invariant, re-established by every
//! mutation: a connection's assigned room always contains it as a member,
//! and a room entry exists iff its member set is non-empty.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, Mutex};

use crate::protocol::{generate_client_id, ProtocolError, WireMessage};

/// Identifies one connection for the relay's lifetime.
pub type ConnectionId = u64;

/// Commands delivered to a connection's writer task.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// A JSON-encoded frame to forward to the peer.
    Frame(String),
    /// Close the socket with a normal-closure code.
    Close,
}

/// Handle to one connected peer: its id plus the sending half of the
/// channel its writer task drains.
///
/// Cloning is cheap; the relay stores clones in room member sets. Sending
/// is a single non-blocking attempt — if the writer task is gone the send
/// fails and the peer is treated as dead.
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl Connection {
    pub fn new(id: ConnectionId, outbound: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { id, outbound }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Encode and enqueue one frame. Fails only if the peer's writer task
    /// has already terminated.
    fn send_frame(&self, msg: &WireMessage) -> Result<(), ProtocolError> {
        let encoded = msg.encode()?;
        self.outbound
            .send(Outbound::Frame(encoded))
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Ask the writer task to close the socket normally.
    fn request_close(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }
}

/// The three mappings of the relay, never exposed outside this module.
#[derive(Default)]
struct RelayState {
    /// connection → assigned room (absent until first valid join)
    room_by_conn: HashMap<ConnectionId, String>,
    /// connection → server-assigned client id
    client_ids: HashMap<ConnectionId, String>,
    /// room → member connections (entry exists iff non-empty)
    members: HashMap<String, HashMap<ConnectionId, Connection>>,
}

/// The room relay.
///
/// Owns all membership state; the transport layer calls [`on_open`],
/// [`on_message`], [`on_close`] and [`on_error`] on connection lifecycle
/// events and never touches the mappings directly.
///
/// [`on_open`]: RoomRelay::on_open
/// [`on_message`]: RoomRelay::on_message
/// [`on_close`]: RoomRelay::on_close
/// [`on_error`]: RoomRelay::on_error
pub struct RoomRelay {
    state: Mutex<RelayState>,
    next_conn_id: AtomicU64,
}

impl Default for RoomRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomRelay {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RelayState::default()),
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Allocate a fresh connection id for a newly accepted transport.
    pub fn allocate_id(&self) -> ConnectionId {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Connection opened: assign a client id and send the welcome notice.
    ///
    /// No room is assigned yet and no other connection is affected.
    /// Returns the id assigned to this connection.
    pub async fn on_open(&self, conn: &Connection) -> String {
        let client_id = generate_client_id();
        let mut state = self.state.lock().await;
        state.client_ids.insert(conn.id(), client_id.clone());

        log::info!("New connection {} (clientId: {client_id})", conn.id());
        if conn.send_frame(&WireMessage::welcome(client_id.clone())).is_err() {
            log::warn!("Connection {} vanished before welcome", conn.id());
        }
        client_id
    }

    /// Inbound payload from a connection.
    ///
    /// Parses the frame and dispatches: kill, killRoom, room switch or
    /// ordinary broadcast. Malformed payloads and invalid operations get an
    /// error notice back to the sender only and mutate nothing.
    pub async fn on_message(&self, conn: &Connection, raw: &str) {
        let mut state = self.state.lock().await;
        let client_id = state
            .client_ids
            .get(&conn.id())
            .cloned()
            .unwrap_or_else(|| "unknown".to_string());

        let msg = match WireMessage::decode(raw) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Connection {}: malformed payload: {e}", conn.id());
                let _ = conn.send_frame(&WireMessage::error(
                    format!("Error processing message: {e}"),
                    client_id,
                ));
                return;
            }
        };

        // The sender's identity is always the server-side record. An inbound
        // clientId is logged and otherwise discarded.
        if let Some(claimed) = &msg.client_id {
            if *claimed != client_id {
                log::debug!(
                    "Connection {} claimed clientId {claimed}, using {client_id}",
                    conn.id()
                );
            }
        }

        log::debug!(
            "Received message from {} (clientId: {client_id}) in room \"{}\": {}",
            msg.user,
            msg.chatroom,
            msg.message
        );

        if msg.kill == Some(true) {
            log::info!("Connection {} requested termination", conn.id());
            conn.request_close();
            return;
        }

        if msg.kill_room == Some(true) {
            self.handle_kill_room(&mut state, conn, &client_id, &msg.chatroom);
            return;
        }

        if msg.chatroom.is_empty() {
            let _ = conn.send_frame(&WireMessage::error(
                "Error: No chatroom specified",
                client_id,
            ));
            return;
        }

        let current = state.room_by_conn.get(&conn.id()).cloned();
        if current.as_deref() == Some(msg.chatroom.as_str()) {
            // Ordinary broadcast to the whole room, sender included.
            // Attribution is the server-assigned id, never the payload's.
            let room = msg.chatroom.clone();
            let outgoing = WireMessage {
                client_id: Some(client_id),
                kill: None,
                kill_room: None,
                clear_all_messages: None,
                ..msg
            };
            broadcast(&mut state, &room, None, &outgoing);
        } else {
            self.switch_room(&mut state, conn, &client_id, current, &msg.chatroom);
        }
    }

    /// Room-wide history clear. Membership is not altered; members only
    /// receive a notice flagged `clearAllMessages` so consuming UIs drop
    /// their cached history.
    fn handle_kill_room(
        &self,
        state: &mut RelayState,
        conn: &Connection,
        client_id: &str,
        room: &str,
    ) {
        if room.is_empty() {
            let _ = conn.send_frame(&WireMessage::error(
                "Error: No chatroom specified for kill room operation",
                client_id.to_string(),
            ));
            return;
        }
        if state.members.contains_key(room) {
            log::info!("Room {room} history cleared by clientId {client_id}");
            broadcast(
                state,
                room,
                None,
                &WireMessage::room_cleared(room, client_id.to_string()),
            );
        } else {
            log::info!("Cannot clear non-existent room: {room}");
        }
    }

    /// Move a connection into `new_room`, leaving `old_room` if set.
    ///
    /// The whole transition runs under the one lock: old-room removal,
    /// left-notice, empty-room GC, new-room insertion and join notices
    /// cannot interleave with any other operation.
    fn switch_room(
        &self,
        state: &mut RelayState,
        conn: &Connection,
        client_id: &str,
        old_room: Option<String>,
        new_room: &str,
    ) {
        if let Some(old) = old_room {
            let was_member = state
                .members
                .get_mut(&old)
                .map(|members| members.remove(&conn.id()).is_some())
                .unwrap_or(false);
            if was_member {
                broadcast(
                    state,
                    &old,
                    Some(conn.id()),
                    &WireMessage::user_left(&old, client_id.to_string()),
                );
                if state.members.get(&old).is_some_and(|m| m.is_empty()) {
                    state.members.remove(&old);
                    log::info!("Room {old} is now empty and removed");
                }
            }
        }

        state
            .members
            .entry(new_room.to_string())
            .or_default()
            .insert(conn.id(), conn.clone());
        state.room_by_conn.insert(conn.id(), new_room.to_string());

        let _ = conn.send_frame(&WireMessage::joined(new_room, client_id.to_string()));
        broadcast(
            state,
            new_room,
            Some(conn.id()),
            &WireMessage::user_joined(new_room, client_id.to_string()),
        );

        log::info!("Connection {} joined room {new_room}", conn.id());
        log_state(state);
    }

    /// Connection closed: full teardown plus a left-notice to the room's
    /// remaining members. Idempotent — a second call for the same id is a
    /// no-op.
    pub async fn on_close(&self, id: ConnectionId) {
        let mut state = self.state.lock().await;
        if cleanup(&mut state, id, true) {
            log::info!("Connection {id} closed");
            log_state(&state);
        }
    }

    /// Transport-level error: logged, then the same teardown as a close.
    pub async fn on_error(&self, id: ConnectionId, error: &(dyn std::error::Error + Sync + '_)) {
        log::error!("Connection {id} transport error: {error}");
        let mut state = self.state.lock().await;
        cleanup(&mut state, id, true);
    }

    // ─── Introspection (owned snapshots, used by stats and tests) ───

    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.client_ids.len()
    }

    pub async fn room_count(&self) -> usize {
        self.state.lock().await.members.len()
    }

    pub async fn room_of(&self, id: ConnectionId) -> Option<String> {
        self.state.lock().await.room_by_conn.get(&id).cloned()
    }

    pub async fn client_id_of(&self, id: ConnectionId) -> Option<String> {
        self.state.lock().await.client_ids.get(&id).cloned()
    }

    pub async fn member_ids(&self, room: &str) -> Vec<ConnectionId> {
        let state = self.state.lock().await;
        let mut ids: Vec<ConnectionId> = state
            .members
            .get(room)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    pub async fn rooms(&self) -> Vec<String> {
        let mut rooms: Vec<String> = self.state.lock().await.members.keys().cloned().collect();
        rooms.sort_unstable();
        rooms
    }
}

/// Deliver `msg` to every member of `room` except `exclude`.
///
/// Iterates a snapshot of the member handles so inline removals cannot
/// skip or duplicate remaining members; each member gets exactly one send
/// attempt, and a failed attempt reaps that member against the live maps.
fn broadcast(
    state: &mut RelayState,
    room: &str,
    exclude: Option<ConnectionId>,
    msg: &WireMessage,
) {
    let snapshot: Vec<Connection> = match state.members.get(room) {
        Some(members) => members.values().cloned().collect(),
        None => {
            log::debug!("Cannot broadcast to non-existent room: {room}");
            return;
        }
    };

    let total = snapshot.len();
    let mut sent = 0usize;
    for member in snapshot {
        if Some(member.id()) == exclude {
            continue;
        }
        match member.send_frame(msg) {
            Ok(()) => sent += 1,
            Err(_) => {
                log::warn!(
                    "Delivery to connection {} failed, reaping it",
                    member.id()
                );
                // Dead member: same teardown as a close, minus the nested
                // left-notice (the pass in progress already owns the room).
                cleanup(state, member.id(), false);
            }
        }
    }
    log::debug!("Broadcast to room {room}: sent to {sent}/{total} members");
}

/// Remove `id` from all three mappings, notifying the old room's remaining
/// members when `notify` is set. Returns whether the connection was known.
fn cleanup(state: &mut RelayState, id: ConnectionId, notify: bool) -> bool {
    let room = state.room_by_conn.remove(&id);
    let client_id = state.client_ids.remove(&id);
    if room.is_none() && client_id.is_none() {
        return false;
    }

    if let Some(room) = room {
        let was_member = state
            .members
            .get_mut(&room)
            .map(|members| members.remove(&id).is_some())
            .unwrap_or(false);
        if was_member {
            if notify {
                let leaver = client_id.unwrap_or_else(|| "unknown".to_string());
                broadcast(state, &room, Some(id), &WireMessage::user_left(&room, leaver));
            }
            if state.members.get(&room).is_some_and(|m| m.is_empty()) {
                state.members.remove(&room);
                log::info!("Room {room} is now empty and removed");
            }
        }
    }
    true
}

/// Debug dump of the relay's state, mirroring the shape of the maps.
fn log_state(state: &RelayState) {
    if !log::log_enabled!(log::Level::Debug) {
        return;
    }
    log::debug!("Active connections: {}", state.client_ids.len());
    log::debug!("Active chatrooms: {}", state.members.len());
    for (room, members) in &state.members {
        log::debug!("Room {room}: {} clients", members.len());
        for id in members.keys() {
            let client_id = state.client_ids.get(id).map(String::as_str).unwrap_or("unknown");
            log::debug!("  - Connection {id}: clientId={client_id}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SERVER_USER;
    use tokio::sync::mpsc::UnboundedReceiver;

    /// Build a connection wired to an in-memory receiver.
    fn test_conn(relay: &RoomRelay) -> (Connection, UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Connection::new(relay.allocate_id(), tx), rx)
    }

    /// Drain every frame currently queued for a connection.
    fn drain(rx: &mut UnboundedReceiver<Outbound>) -> Vec<WireMessage> {
        let mut frames = Vec::new();
        while let Ok(out) = rx.try_recv() {
            if let Outbound::Frame(raw) = out {
                frames.push(WireMessage::decode(&raw).unwrap());
            }
        }
        frames
    }

    /// Open a connection and discard its welcome notice.
    async fn open(
        relay: &RoomRelay,
        rx: &mut UnboundedReceiver<Outbound>,
        conn: &Connection,
    ) -> String {
        let client_id = relay.on_open(conn).await;
        let frames = drain(rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].client_id.as_deref(), Some(client_id.as_str()));
        client_id
    }

    /// Join a room and discard the joined notice.
    async fn join(
        relay: &RoomRelay,
        rx: &mut UnboundedReceiver<Outbound>,
        conn: &Connection,
        room: &str,
    ) {
        let raw = WireMessage::chat("u", room, "").encode().unwrap();
        relay.on_message(conn, &raw).await;
        let frames = drain(rx);
        assert_eq!(frames.len(), 1, "expected only the joined notice");
        assert!(frames[0].message.contains("joined room"));
    }

    /// The bidirectional-consistency invariant from the data model.
    async fn assert_invariant(relay: &RoomRelay) {
        for room in relay.rooms().await {
            let members = relay.member_ids(&room).await;
            assert!(!members.is_empty(), "room {room} exists but is empty");
            for id in members {
                assert_eq!(
                    relay.room_of(id).await.as_deref(),
                    Some(room.as_str()),
                    "member {id} of {room} does not point back at it"
                );
            }
        }
    }

    #[tokio::test]
    async fn test_open_sends_welcome_without_room() {
        let relay = RoomRelay::new();
        let (conn, mut rx) = test_conn(&relay);

        let client_id = relay.on_open(&conn).await;
        let frames = drain(&mut rx);

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].user, SERVER_USER);
        assert_eq!(frames[0].chatroom, "");
        assert_eq!(frames[0].client_id.as_deref(), Some(client_id.as_str()));
        assert_eq!(relay.room_of(conn.id()).await, None);
        assert_eq!(relay.room_count().await, 0);
        assert_eq!(relay.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_first_join_creates_room() {
        let relay = RoomRelay::new();
        let (conn, mut rx) = test_conn(&relay);
        open(&relay, &mut rx, &conn).await;

        join(&relay, &mut rx, &conn, "r1").await;

        assert_eq!(relay.room_of(conn.id()).await.as_deref(), Some("r1"));
        assert_eq!(relay.member_ids("r1").await, vec![conn.id()]);
        assert_invariant(&relay).await;
    }

    #[tokio::test]
    async fn test_second_join_notifies_existing_members() {
        let relay = RoomRelay::new();
        let (a, mut a_rx) = test_conn(&relay);
        let (b, mut b_rx) = test_conn(&relay);
        open(&relay, &mut a_rx, &a).await;
        open(&relay, &mut b_rx, &b).await;
        join(&relay, &mut a_rx, &a, "r1").await;

        join(&relay, &mut b_rx, &b, "r1").await;

        let a_frames = drain(&mut a_rx);
        assert_eq!(a_frames.len(), 1);
        assert_eq!(a_frames[0].message, "A new user joined the chat");
        assert_eq!(relay.member_ids("r1").await.len(), 2);
        assert_invariant(&relay).await;
    }

    #[tokio::test]
    async fn test_broadcast_completeness() {
        let relay = RoomRelay::new();
        let mut peers = Vec::new();
        for _ in 0..3 {
            let (conn, mut rx) = test_conn(&relay);
            open(&relay, &mut rx, &conn).await;
            join(&relay, &mut rx, &conn, "r").await;
            peers.push((conn, rx));
        }
        // Clear the join notices the earlier members received.
        for (_, rx) in peers.iter_mut() {
            drain(rx);
        }

        let raw = WireMessage::chat("A", "r", "yo").encode().unwrap();
        relay.on_message(&peers[0].0, &raw).await;

        for (_, rx) in peers.iter_mut() {
            let frames = drain(rx);
            assert_eq!(frames.len(), 1, "each member gets exactly one copy");
            assert_eq!(frames[0].message, "yo");
        }
    }

    #[tokio::test]
    async fn test_broadcast_carries_server_assigned_id() {
        let relay = RoomRelay::new();
        let (conn, mut rx) = test_conn(&relay);
        let client_id = open(&relay, &mut rx, &conn).await;
        join(&relay, &mut rx, &conn, "r").await;

        // Spoof a clientId on the inbound payload.
        let mut msg = WireMessage::chat("A", "r", "hi");
        msg.client_id = Some("forged".to_string());
        relay.on_message(&conn, &msg.encode().unwrap()).await;

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].client_id.as_deref(), Some(client_id.as_str()));
    }

    #[tokio::test]
    async fn test_room_switch() {
        let relay = RoomRelay::new();
        let (a, mut a_rx) = test_conn(&relay);
        let (b, mut b_rx) = test_conn(&relay);
        open(&relay, &mut a_rx, &a).await;
        open(&relay, &mut b_rx, &b).await;
        join(&relay, &mut a_rx, &a, "x").await;
        join(&relay, &mut b_rx, &b, "x").await;
        drain(&mut a_rx);

        // B switches to "y".
        let raw = WireMessage::chat("B", "y", "").encode().unwrap();
        relay.on_message(&b, &raw).await;

        assert_eq!(relay.room_of(b.id()).await.as_deref(), Some("y"));
        assert_eq!(relay.member_ids("x").await, vec![a.id()]);
        assert_eq!(relay.member_ids("y").await, vec![b.id()]);

        let a_frames = drain(&mut a_rx);
        assert_eq!(a_frames.len(), 1);
        assert_eq!(a_frames[0].message, "A user left the chat");

        let b_frames = drain(&mut b_rx);
        assert_eq!(b_frames.len(), 1);
        assert!(b_frames[0].message.contains("joined room y"));
        assert_invariant(&relay).await;
    }

    #[tokio::test]
    async fn test_switch_out_of_singleton_room_removes_it() {
        let relay = RoomRelay::new();
        let (conn, mut rx) = test_conn(&relay);
        open(&relay, &mut rx, &conn).await;
        join(&relay, &mut rx, &conn, "x").await;

        join(&relay, &mut rx, &conn, "y").await;

        assert_eq!(relay.rooms().await, vec!["y".to_string()]);
        assert_invariant(&relay).await;
    }

    #[tokio::test]
    async fn test_close_removes_empty_room() {
        let relay = RoomRelay::new();
        let (conn, mut rx) = test_conn(&relay);
        open(&relay, &mut rx, &conn).await;
        join(&relay, &mut rx, &conn, "z").await;

        relay.on_close(conn.id()).await;

        assert_eq!(relay.room_count().await, 0);
        assert_eq!(relay.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_close_notifies_remaining_members() {
        let relay = RoomRelay::new();
        let (a, mut a_rx) = test_conn(&relay);
        let (b, mut b_rx) = test_conn(&relay);
        open(&relay, &mut a_rx, &a).await;
        open(&relay, &mut b_rx, &b).await;
        join(&relay, &mut a_rx, &a, "r").await;
        join(&relay, &mut b_rx, &b, "r").await;
        drain(&mut a_rx);

        relay.on_close(b.id()).await;

        let frames = drain(&mut a_rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].message, "A user left the chat");
        assert_eq!(relay.member_ids("r").await, vec![a.id()]);
        assert_invariant(&relay).await;
    }

    #[tokio::test]
    async fn test_cleanup_idempotent() {
        let relay = RoomRelay::new();
        let (conn, mut rx) = test_conn(&relay);
        open(&relay, &mut rx, &conn).await;
        join(&relay, &mut rx, &conn, "r").await;

        relay.on_close(conn.id()).await;
        relay.on_close(conn.id()).await; // second teardown is a no-op

        assert_eq!(relay.connection_count().await, 0);
        assert_eq!(relay.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_error_performs_same_teardown() {
        let relay = RoomRelay::new();
        let (conn, mut rx) = test_conn(&relay);
        open(&relay, &mut rx, &conn).await;
        join(&relay, &mut rx, &conn, "r").await;

        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "peer reset");
        relay.on_error(conn.id(), &io_err).await;

        assert_eq!(relay.connection_count().await, 0);
        assert_eq!(relay.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_kill_closes_only_sender() {
        let relay = RoomRelay::new();
        let (a, mut a_rx) = test_conn(&relay);
        let (b, mut b_rx) = test_conn(&relay);
        open(&relay, &mut a_rx, &a).await;
        open(&relay, &mut b_rx, &b).await;
        join(&relay, &mut a_rx, &a, "r").await;
        join(&relay, &mut b_rx, &b, "r").await;
        drain(&mut a_rx);

        let mut msg = WireMessage::chat("B", "r", "");
        msg.kill = Some(true);
        relay.on_message(&b, &msg.encode().unwrap()).await;

        // B got a close directive, A got nothing, membership untouched
        // until the transport close event lands.
        assert!(matches!(b_rx.try_recv(), Ok(Outbound::Close)));
        assert!(drain(&mut a_rx).is_empty());
        assert_eq!(relay.member_ids("r").await.len(), 2);
    }

    #[tokio::test]
    async fn test_kill_room_reaches_all_members() {
        let relay = RoomRelay::new();
        let (a, mut a_rx) = test_conn(&relay);
        let (b, mut b_rx) = test_conn(&relay);
        open(&relay, &mut a_rx, &a).await;
        let b_id = open(&relay, &mut b_rx, &b).await;
        join(&relay, &mut a_rx, &a, "r").await;
        join(&relay, &mut b_rx, &b, "r").await;
        drain(&mut a_rx);

        let mut msg = WireMessage::chat("B", "r", "");
        msg.kill_room = Some(true);
        relay.on_message(&b, &msg.encode().unwrap()).await;

        for rx in [&mut a_rx, &mut b_rx] {
            let frames = drain(rx);
            assert_eq!(frames.len(), 1, "sender included in the clear notice");
            assert_eq!(frames[0].clear_all_messages, Some(true));
            assert_eq!(frames[0].client_id.as_deref(), Some(b_id.as_str()));
        }
        // Membership is untouched.
        assert_eq!(relay.member_ids("r").await.len(), 2);
        assert_invariant(&relay).await;
    }

    #[tokio::test]
    async fn test_kill_room_nonexistent_is_silent() {
        let relay = RoomRelay::new();
        let (a, mut a_rx) = test_conn(&relay);
        open(&relay, &mut a_rx, &a).await;
        join(&relay, &mut a_rx, &a, "r").await;

        let mut msg = WireMessage::chat("A", "ghost", "");
        msg.kill_room = Some(true);
        relay.on_message(&a, &msg.encode().unwrap()).await;

        assert!(drain(&mut a_rx).is_empty());
        assert_eq!(relay.rooms().await, vec!["r".to_string()]);
    }

    #[tokio::test]
    async fn test_kill_room_without_name_errors_sender_only() {
        let relay = RoomRelay::new();
        let (a, mut a_rx) = test_conn(&relay);
        open(&relay, &mut a_rx, &a).await;

        let mut msg = WireMessage::chat("A", "", "");
        msg.kill_room = Some(true);
        relay.on_message(&a, &msg.encode().unwrap()).await;

        let frames = drain(&mut a_rx);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].message.contains("kill room"));
        assert_eq!(relay.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_empty_chatroom_errors_sender_only() {
        let relay = RoomRelay::new();
        let (a, mut a_rx) = test_conn(&relay);
        open(&relay, &mut a_rx, &a).await;

        let raw = WireMessage::chat("A", "", "hello").encode().unwrap();
        relay.on_message(&a, &raw).await;

        let frames = drain(&mut a_rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].message, "Error: No chatroom specified");
        assert_eq!(relay.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_malformed_payload_keeps_connection_open() {
        let relay = RoomRelay::new();
        let (a, mut a_rx) = test_conn(&relay);
        open(&relay, &mut a_rx, &a).await;
        join(&relay, &mut a_rx, &a, "r").await;

        relay.on_message(&a, "{{{ not json").await;

        let frames = drain(&mut a_rx);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].message.starts_with("Error processing message"));
        // No close directive, no state change.
        assert!(a_rx.try_recv().is_err());
        assert_eq!(relay.room_of(a.id()).await.as_deref(), Some("r"));
        assert_invariant(&relay).await;
    }

    #[tokio::test]
    async fn test_dead_member_reaped_during_broadcast() {
        let relay = RoomRelay::new();
        let (a, mut a_rx) = test_conn(&relay);
        let (b, mut b_rx) = test_conn(&relay);
        let (c, mut c_rx) = test_conn(&relay);
        open(&relay, &mut a_rx, &a).await;
        open(&relay, &mut b_rx, &b).await;
        open(&relay, &mut c_rx, &c).await;
        join(&relay, &mut a_rx, &a, "r").await;
        join(&relay, &mut b_rx, &b, "r").await;
        join(&relay, &mut c_rx, &c, "r").await;
        drain(&mut a_rx);
        drain(&mut b_rx);

        // B dies without a close event.
        drop(b_rx);

        let raw = WireMessage::chat("A", "r", "ping").encode().unwrap();
        relay.on_message(&a, &raw).await;

        // Live members each got exactly one copy; B was reaped inline.
        for rx in [&mut a_rx, &mut c_rx] {
            let frames = drain(rx);
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0].message, "ping");
        }
        assert_eq!(relay.member_ids("r").await, {
            let mut ids = vec![a.id(), c.id()];
            ids.sort_unstable();
            ids
        });
        assert_eq!(relay.room_of(b.id()).await, None);
        assert_eq!(relay.client_id_of(b.id()).await, None);
        assert_invariant(&relay).await;
    }

    #[tokio::test]
    async fn test_last_member_dead_during_kill_room_removes_room() {
        let relay = RoomRelay::new();
        let (a, mut a_rx) = test_conn(&relay);
        let (b, mut b_rx) = test_conn(&relay);
        open(&relay, &mut a_rx, &a).await;
        open(&relay, &mut b_rx, &b).await;
        join(&relay, &mut b_rx, &b, "r").await;

        drop(b_rx);

        // A (not a member) clears the room; the only member is dead, so the
        // room empties out and is collected.
        let mut msg = WireMessage::chat("A", "r", "");
        msg.kill_room = Some(true);
        relay.on_message(&a, &msg.encode().unwrap()).await;

        assert_eq!(relay.room_count().await, 0);
        assert_invariant(&relay).await;
    }
}
