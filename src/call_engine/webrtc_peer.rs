//! WebRTC Peer Connection
//!
//! Implementiert [`PeerConnection`] mit dem `webrtc` Crate. Callbacks
//! der Verbindung werden in [`PeerEvent`]s übersetzt.

use super::audio::{CHANNELS, SAMPLE_RATE};
use super::media::{MediaStreamHandle, TrackKind};
use super::negotiation::NegotiationError;
use super::peer::{
    IceServer, PeerConnection, PeerConnectionFactory, PeerConnectionState, PeerEvent, RemoteTrack,
};
use crate::signaling::{IceCandidate, SdpKind, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

fn webrtc_error(e: webrtc::Error) -> NegotiationError {
    NegotiationError::PeerConnection(e.to_string())
}

// ============================================================================
// FACTORY
// ============================================================================

/// Erzeugt WebRTC Peer Connections mit Standard-Codecs und Interceptors
#[derive(Debug, Default, Clone)]
pub struct WebRtcPeerFactory;

impl WebRtcPeerFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcPeerFactory {
    async fn create(
        &self,
        ice_servers: &[IceServer],
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::UnboundedReceiver<PeerEvent>), NegotiationError>
    {
        // Media Engine mit Opus/VP8 konfigurieren
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(webrtc_error)?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry =
            register_default_interceptors(registry, &mut media_engine).map_err(webrtc_error)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone(),
                    credential: server.credential.clone(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(webrtc_error)?,
        );

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        register_handlers(&pc, event_tx);

        let peer = Arc::new(WebRtcPeer {
            pc,
            local_tracks: Mutex::new(Vec::new()),
        });
        Ok((peer, event_rx))
    }
}

/// Übersetzt die Callbacks der Peer Connection in [`PeerEvent`]s
fn register_handlers(pc: &Arc<RTCPeerConnection>, event_tx: mpsc::UnboundedSender<PeerEvent>) {
    // Connection State Handler
    let tx = event_tx.clone();
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        tracing::info!("Peer connection state: {:?}", s);

        let state = match s {
            RTCPeerConnectionState::New => Some(PeerConnectionState::New),
            RTCPeerConnectionState::Connecting => Some(PeerConnectionState::Connecting),
            RTCPeerConnectionState::Connected => Some(PeerConnectionState::Connected),
            RTCPeerConnectionState::Disconnected => Some(PeerConnectionState::Disconnected),
            RTCPeerConnectionState::Failed => Some(PeerConnectionState::Failed),
            RTCPeerConnectionState::Closed => Some(PeerConnectionState::Closed),
            _ => None,
        };
        if let Some(state) = state {
            let _ = tx.send(PeerEvent::ConnectionState(state));
        }

        Box::pin(async {})
    }));

    // ICE Candidate Handler
    let tx = event_tx.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        // `None` markiert das Ende des Gatherings
        if let Some(c) = candidate {
            match c.to_json() {
                Ok(init) => {
                    let _ = tx.send(PeerEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }));
                }
                Err(e) => tracing::warn!("Failed to serialize local ICE candidate: {}", e),
            }
        }
        Box::pin(async {})
    }));

    // Track Handler (für eingehende Medien)
    let tx = event_tx;
    pc.on_track(Box::new(move |track, _, _| {
        let kind = match track.kind() {
            RTPCodecType::Video => TrackKind::Video,
            _ => TrackKind::Audio,
        };
        tracing::info!("Received {:?} track: {:?}", kind, track.codec());
        let _ = tx.send(PeerEvent::RemoteTrack(RemoteTrack {
            id: track.id(),
            stream_id: track.stream_id(),
            kind,
        }));
        Box::pin(async {})
    }));
}

// ============================================================================
// WEBRTC PEER
// ============================================================================

/// Peer Connection eines Anrufs
pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    local_tracks: Mutex<Vec<Arc<TrackLocalStaticRTP>>>,
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn add_local_stream(&self, stream: &MediaStreamHandle) -> Result<(), NegotiationError> {
        for track in stream.tracks() {
            let codec = match track.kind() {
                TrackKind::Audio => RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_string(),
                    clock_rate: SAMPLE_RATE,
                    channels: CHANNELS,
                    ..Default::default()
                },
                TrackKind::Video => RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_string(),
                    clock_rate: 90000,
                    ..Default::default()
                },
            };

            let rtp_track = Arc::new(TrackLocalStaticRTP::new(
                codec,
                track.id().to_string(),
                stream.id().to_string(),
            ));

            self.pc
                .add_track(Arc::clone(&rtp_track) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(webrtc_error)?;
            self.local_tracks.lock().push(rtp_track);
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        let offer = self.pc.create_offer(None).await.map_err(webrtc_error)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(webrtc_error)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let answer = self.pc.create_answer(None).await.map_err(webrtc_error)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(webrtc_error)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let remote = match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
        }
        .map_err(|e| NegotiationError::InvalidDescription(e.to_string()))?;

        self.pc
            .set_remote_description(remote)
            .await
            .map_err(|e| NegotiationError::InvalidDescription(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(webrtc_error)
    }

    async fn close(&self) {
        self.local_tracks.lock().clear();
        if let Err(e) = self.pc.close().await {
            tracing::warn!("Failed to close peer connection: {}", e);
        }
    }
}

impl std::fmt::Debug for WebRtcPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcPeer")
            .field("state", &self.pc.connection_state())
            .field("local_tracks", &self.local_tracks.lock().len())
            .finish()
    }
}
