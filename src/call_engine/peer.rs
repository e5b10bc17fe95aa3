//! Peer Connection Schnittstelle
//!
//! Die Negotiation Engine spricht nur über diese Traits mit der
//! Peer Connection. Events der Verbindung (lokale Candidates, neue
//! Remote-Tracks, Statuswechsel) kommen über einen typisierten Kanal.

use super::media::{MediaStreamHandle, TrackKind};
use super::negotiation::NegotiationError;
use crate::signaling::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

// ============================================================================
// ICE SERVER CONFIGURATION
// ============================================================================

/// STUN/TURN Server
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

/// Standard STUN Server Konfiguration
pub fn default_ice_servers() -> Vec<IceServer> {
    vec![
        // Google STUN Server (kostenlos, für ~90% der Verbindungen)
        IceServer {
            urls: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
                "stun:stun2.l.google.com:19302".to_string(),
            ],
            ..Default::default()
        },
    ]
}

// ============================================================================
// PEER EVENTS
// ============================================================================

/// Verbindungsstatus der Peer Connection (ICE + DTLS)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Ein vom Peer empfangener Track
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: TrackKind,
}

/// Events, die die Peer Connection von sich aus auslöst
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    RemoteTrack(RemoteTrack),
    ConnectionState(PeerConnectionState),
}

// ============================================================================
// TRAITS
// ============================================================================

/// Die von der Negotiation benötigten Fähigkeiten einer Peer Connection
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Fügt alle Tracks des lokalen Streams hinzu
    async fn add_local_stream(&self, stream: &MediaStreamHandle) -> Result<(), NegotiationError>;

    /// Erstellt ein Offer und setzt es als Local Description
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError>;

    /// Erstellt ein Answer und setzt es als Local Description
    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;

    /// Schließt die Verbindung. Mehrfacher Aufruf ist erlaubt.
    async fn close(&self);
}

/// Erzeugt eine Peer Connection pro Anruf
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        ice_servers: &[IceServer],
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::UnboundedReceiver<PeerEvent>), NegotiationError>;
}
