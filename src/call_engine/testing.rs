//! Test-Doubles für Capture, Peer Connection und Transport

use super::media::{
    CaptureConstraints, CaptureError, MediaCapture, MediaStreamHandle, MediaTrack, TrackKind,
};
use super::negotiation::NegotiationError;
use super::peer::{
    IceServer, PeerConnection, PeerConnectionFactory, PeerConnectionState, PeerEvent, RemoteTrack,
};
use crate::signaling::{
    IceCandidate, SdpKind, SessionDescription, SignalingMessage, SignalingTransport,
    TransportState,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

// ============================================================================
// FAKE CAPTURE
// ============================================================================

pub(crate) struct FakeCapture {
    outcome: Result<(), CaptureError>,
    gate: Option<Arc<Notify>>,
    acquired: Mutex<Vec<MediaStreamHandle>>,
}

impl FakeCapture {
    pub(crate) fn new() -> Self {
        Self {
            outcome: Ok(()),
            gate: None,
            acquired: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn failing(error: CaptureError) -> Self {
        Self {
            outcome: Err(error),
            ..Self::new()
        }
    }

    /// `acquire` wartet, bis der Gate-Notify ausgelöst wird
    pub(crate) fn gated(gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new()
        }
    }

    pub(crate) fn acquired(&self) -> Vec<MediaStreamHandle> {
        self.acquired.lock().clone()
    }
}

#[async_trait]
impl MediaCapture for FakeCapture {
    async fn acquire(
        &self,
        constraints: CaptureConstraints,
    ) -> Result<MediaStreamHandle, CaptureError> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        self.outcome.clone()?;

        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(Arc::new(MediaTrack::new("mic", TrackKind::Audio, "fake mic")));
        }
        if constraints.video {
            tracks.push(Arc::new(MediaTrack::new("cam", TrackKind::Video, "fake cam")));
        }
        let stream = MediaStreamHandle::new(uuid::Uuid::new_v4().to_string(), tracks);
        self.acquired.lock().push(stream.clone());
        Ok(stream)
    }
}

// ============================================================================
// FAKE PEER CONNECTION
// ============================================================================

/// Was die Fake-Verbindung meldet, sobald beide Descriptions gesetzt sind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Connectivity {
    Connects,
    Fails,
    Silent,
}

#[derive(Default)]
struct FakePeerState {
    calls: Vec<String>,
    has_local: bool,
    has_remote: bool,
    closed: usize,
}

pub(crate) struct FakePeer {
    label: String,
    connectivity: Connectivity,
    close_delay: Duration,
    state: Mutex<FakePeerState>,
    event_tx: mpsc::UnboundedSender<PeerEvent>,
}

impl FakePeer {
    pub(crate) fn new(
        label: impl Into<String>,
        connectivity: Connectivity,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<PeerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let peer = Arc::new(Self {
            label: label.into(),
            connectivity,
            close_delay: Duration::ZERO,
            state: Mutex::new(FakePeerState::default()),
            event_tx,
        });
        (peer, event_rx)
    }

    /// Protokoll aller Aufrufe, z.B. `set_remote:offer` oder `candidate:c1`
    pub(crate) fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    /// Angewendete Remote Candidates in Reihenfolge
    pub(crate) fn applied_candidates(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| c.strip_prefix("candidate:").map(str::to_string))
            .collect()
    }

    pub(crate) fn close_count(&self) -> usize {
        self.state.lock().closed
    }

    pub(crate) fn emit(&self, event: PeerEvent) {
        let _ = self.event_tx.send(event);
    }

    fn record(&self, call: impl Into<String>) {
        self.state.lock().calls.push(call.into());
    }

    fn describe(&self, kind: SdpKind) -> SessionDescription {
        let sdp = format!("v=0 fake {} from {}", self.label, self.label);
        self.emit(PeerEvent::LocalCandidate(IceCandidate::new(format!(
            "candidate:{}-host",
            self.label
        ))));
        match kind {
            SdpKind::Offer => SessionDescription::offer(sdp),
            SdpKind::Answer => SessionDescription::answer(sdp),
        }
    }

    fn maybe_connect(&self) {
        let ready = {
            let state = self.state.lock();
            state.has_local && state.has_remote
        };
        if !ready {
            return;
        }
        match self.connectivity {
            Connectivity::Connects => {
                self.emit(PeerEvent::RemoteTrack(RemoteTrack {
                    id: format!("{}-remote-audio", self.label),
                    stream_id: format!("{}-remote", self.label),
                    kind: TrackKind::Audio,
                }));
                self.emit(PeerEvent::ConnectionState(PeerConnectionState::Connected));
            }
            Connectivity::Fails => {
                self.emit(PeerEvent::ConnectionState(PeerConnectionState::Failed));
            }
            Connectivity::Silent => {}
        }
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn add_local_stream(&self, stream: &MediaStreamHandle) -> Result<(), NegotiationError> {
        self.record(format!("add_local_stream:{}", stream.tracks().len()));
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        self.record("create_offer");
        self.state.lock().has_local = true;
        let offer = self.describe(SdpKind::Offer);
        self.maybe_connect();
        Ok(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        self.record("create_answer");
        if !self.state.lock().has_remote {
            return Err(NegotiationError::InvalidState(
                "answer without remote offer".to_string(),
            ));
        }
        self.state.lock().has_local = true;
        let answer = self.describe(SdpKind::Answer);
        self.maybe_connect();
        Ok(answer)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let kind = match description.kind {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
        };
        self.record(format!("set_remote:{}", kind));
        if !description.sdp.starts_with("v=0") {
            return Err(NegotiationError::InvalidDescription(
                "SDP must start with v=0".to_string(),
            ));
        }
        self.state.lock().has_remote = true;
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.record(format!("candidate:{}", candidate.candidate));
        if candidate.candidate.contains("bogus") {
            return Err(NegotiationError::PeerConnection(
                "unparseable candidate".to_string(),
            ));
        }
        Ok(())
    }

    async fn close(&self) {
        if !self.close_delay.is_zero() {
            tokio::time::sleep(self.close_delay).await;
        }
        self.record("close");
        self.state.lock().closed += 1;
    }
}

pub(crate) struct FakePeerFactory {
    connectivity: Connectivity,
    close_delay: Duration,
    created: Mutex<Vec<Arc<FakePeer>>>,
}

impl FakePeerFactory {
    pub(crate) fn new(connectivity: Connectivity) -> Self {
        Self {
            connectivity,
            close_delay: Duration::ZERO,
            created: Mutex::new(Vec::new()),
        }
    }

    /// `close()` der erzeugten Peers dauert so lange
    pub(crate) fn with_close_delay(mut self, delay: Duration) -> Self {
        self.close_delay = delay;
        self
    }

    pub(crate) fn created(&self) -> Vec<Arc<FakePeer>> {
        self.created.lock().clone()
    }
}

#[async_trait]
impl PeerConnectionFactory for FakePeerFactory {
    async fn create(
        &self,
        _ice_servers: &[IceServer],
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::UnboundedReceiver<PeerEvent>), NegotiationError>
    {
        let label = format!("peer{}", self.created.lock().len() + 1);
        let (event_tx, events) = mpsc::unbounded_channel();
        let peer = Arc::new(FakePeer {
            label,
            connectivity: self.connectivity,
            close_delay: self.close_delay,
            state: Mutex::new(FakePeerState::default()),
            event_tx,
        });
        self.created.lock().push(Arc::clone(&peer));
        Ok((peer, events))
    }
}

// ============================================================================
// RECORDING TRANSPORT
// ============================================================================

/// Offener Transport, der alles Gesendete mitschreibt
pub(crate) struct RecordingTransport {
    state: Mutex<TransportState>,
    sent: Mutex<Vec<SignalingMessage>>,
}

impl RecordingTransport {
    pub(crate) fn open() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(TransportState::Open),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn sent(&self) -> Vec<SignalingMessage> {
        self.sent.lock().clone()
    }
}

impl SignalingTransport for RecordingTransport {
    fn state(&self) -> TransportState {
        *self.state.lock()
    }

    fn send(&self, message: SignalingMessage) -> bool {
        if *self.state.lock() != TransportState::Open {
            return false;
        }
        self.sent.lock().push(message);
        true
    }

    fn close(&self) {
        *self.state.lock() = TransportState::Closed;
    }
}
