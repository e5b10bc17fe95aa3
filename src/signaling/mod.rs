//! Signaling Module - Transport für Offer/Answer/ICE
//!
//! Dieses Modul verwaltet die Kommunikation mit dem Rendezvous-Server:
//! - Nachrichtenformat und JSON-Codec
//! - Transport-Abstraktion mit typisierten Events
//! - WebSocket-Transport und In-Process-Hub
//!

mod client;
mod memory;
mod messages;
mod transport;

pub use client::{WebSocketTransport, WebSocketTransportFactory, DEFAULT_KEEPALIVE};
pub use memory::{MemoryHub, MemoryTransport};
pub use messages::*;
pub use transport::{
    SignalingTransport, TransportError, TransportEvent, TransportFactory, TransportState,
};
