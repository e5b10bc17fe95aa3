//! Call Engine Module - Lebenszyklus eines Anrufs
//!
//! Dieses Modul verwaltet:
//! - Lokale Medien (Mikrofon über cpal)
//! - WebRTC Peer Connection und Offer/Answer/ICE Negotiation
//! - Call Sessions und deren Abbau

mod audio;
mod engine;
mod media;
mod negotiation;
mod peer;
mod session;
#[cfg(test)]
pub(crate) mod testing;
mod webrtc_peer;

pub use audio::{CpalCapture, CHANNELS, SAMPLE_RATE};
pub use engine::{CallEngine, CallError, CallErrorKind, CallEvent};
pub use media::{
    CaptureConstraints, CaptureError, MediaCapture, MediaStreamHandle, MediaTrack, TrackKind,
};
pub use negotiation::{NegotiationEngine, NegotiationError};
pub use peer::{
    default_ice_servers, IceServer, PeerConnection, PeerConnectionFactory, PeerConnectionState,
    PeerEvent, RemoteTrack,
};
pub use session::{CallRole, CallSession, CallState};
pub use webrtc_peer::{WebRtcPeer, WebRtcPeerFactory};
