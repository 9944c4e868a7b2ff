//! # room-relay — WebSocket room relay
//!
//! Groups persistent WebSocket connections into named rooms and relays
//! JSON text messages among members of the same room.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ RelayClient │ ◄─────────────────► │ RelayServer │
//! │ (per user)  │     JSON frames     │ (central)   │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                     ┌──────┴──────┐
//!                                     │  RoomRelay  │
//!                                     │ (membership │
//!                                     │  + fan-out) │
//!                                     └─────────────┘
//! ```
//!
//! The relay tracks three mappings behind one lock — connection → room,
//! connection → client id, room → members — and keeps them bidirectionally
//! consistent across every join, switch, broadcast and disconnect. Rooms
//! are created lazily on first join and removed when their last member
//! leaves. Delivery is best-effort: a member whose send fails is reaped
//! inline and the broadcast continues.
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire format (`WireMessage`)
//! - [`relay`] — membership state and lifecycle operations
//! - [`server`] — WebSocket relay server
//! - [`client`] — WebSocket relay client

pub mod client;
pub mod protocol;
pub mod relay;
pub mod server;

// Re-exports for convenience
pub use client::{ConnectionState, RelayClient, RelayEvent};
pub use protocol::{generate_client_id, ProtocolError, WireMessage, SERVER_USER};
pub use relay::{Connection, ConnectionId, Outbound, RoomRelay};
pub use server::{RelayConfig, RelayServer, RelayStats};
