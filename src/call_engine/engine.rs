//! Call Engine - Lebenszyklus eines Anrufs
//!
//! Koordiniert lokale Medien, Peer Connection und Signaling-Transport zu
//! einer Session. Pro Session läuft genau ein Driver-Task, der Transport-
//! und Peer-Events abarbeitet. Jede Änderung prüft die Generation der
//! Session; Events einer bereits beendeten Session sind No-ops.
//!
//! Abbau-Reihenfolge: lokale Tracks stoppen, Peer Connection schließen,
//! `Bye` senden und Transport schließen, Session verwerfen.

use super::audio::CpalCapture;
use super::media::{
    CaptureConstraints, CaptureError, MediaCapture, MediaStreamHandle, MediaTrack, TrackKind,
};
use super::negotiation::{NegotiationEngine, NegotiationError};
use super::peer::{PeerConnection, PeerConnectionFactory, PeerEvent, RemoteTrack};
use super::session::{CallRole, CallSession, CallState};
use super::webrtc_peer::WebRtcPeerFactory;
use crate::config::CallConfig;
use crate::signaling::{
    SignalingMessage, SignalingTransport, TransportError, TransportEvent, TransportFactory,
    WebSocketTransportFactory,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("Media capture failed: {0}")]
    Capture(#[from] CaptureError),

    #[error("Signaling failed: {0}")]
    Transport(#[from] TransportError),

    #[error("Negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),

    #[error("Signaling transport did not open within {0:?}")]
    TransportTimeout(Duration),

    #[error("Already in a call")]
    AlreadyInCall,

    #[error("Call was ended before it was established")]
    Cancelled,

    #[error("Invalid signaling endpoint: {0}")]
    InvalidEndpoint(String),
}

/// Fehlerklasse ohne Details, für die UI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallErrorKind {
    Capture,
    Transport,
    Negotiation,
    TransportTimeout,
    AlreadyInCall,
    Cancelled,
    InvalidEndpoint,
}

impl CallError {
    pub fn kind(&self) -> CallErrorKind {
        match self {
            Self::Capture(_) => CallErrorKind::Capture,
            Self::Transport(_) => CallErrorKind::Transport,
            Self::Negotiation(_) => CallErrorKind::Negotiation,
            Self::TransportTimeout(_) => CallErrorKind::TransportTimeout,
            Self::AlreadyInCall => CallErrorKind::AlreadyInCall,
            Self::Cancelled => CallErrorKind::Cancelled,
            Self::InvalidEndpoint(_) => CallErrorKind::InvalidEndpoint,
        }
    }
}

// ============================================================================
// CALL EVENTS
// ============================================================================

/// Events die vom CallEngine ausgelöst werden
#[derive(Debug, Clone)]
pub enum CallEvent {
    StateChanged(CallState),
    RemoteStreamAvailable(MediaStreamHandle),
    Error { kind: CallErrorKind, detail: String },
}

impl CallEvent {
    fn error(error: &CallError) -> Self {
        Self::Error {
            kind: error.kind(),
            detail: error.to_string(),
        }
    }
}

// ============================================================================
// SHARED SESSION STATE
// ============================================================================

/// Ressourcen der laufenden Session
struct ActiveSession {
    generation: u64,
    session: CallSession,
    local: Option<MediaStreamHandle>,
    remote: Option<MediaStreamHandle>,
    peer: Option<Arc<dyn PeerConnection>>,
    transport: Option<Arc<dyn SignalingTransport>>,
    driver: Option<JoinHandle<()>>,
    cancel: watch::Sender<bool>,
}

struct Inner {
    generation: u64,
    state: CallState,
    active: Option<ActiveSession>,
    /// Gesetzt, solange eine herausgelöste Session noch abgebaut wird
    releasing: Option<(u64, watch::Receiver<bool>)>,
}

impl Inner {
    fn live(&mut self, generation: u64) -> Option<&mut ActiveSession> {
        self.active
            .as_mut()
            .filter(|active| active.generation == generation)
    }
}

struct Shared {
    inner: Mutex<Inner>,
    event_tx: broadcast::Sender<CallEvent>,
}

impl Shared {
    fn publish(&self, event: CallEvent) {
        // Ohne Subscriber geht das Event verloren
        let _ = self.event_tx.send(event);
    }

    /// Führt `f` nur aus, wenn die Generation noch lebt
    fn attach(&self, generation: u64, f: impl FnOnce(&mut ActiveSession)) -> bool {
        match self.inner.lock().live(generation) {
            Some(active) => {
                f(active);
                true
            }
            None => false,
        }
    }

    fn set_state(&self, generation: u64, state: CallState) {
        {
            let mut inner = self.inner.lock();
            if inner.live(generation).is_none() || inner.state == state {
                return;
            }
            inner.state = state;
        }
        tracing::debug!("Call state: {:?}", state);
        self.publish(CallEvent::StateChanged(state));
    }

    /// Löst die Session heraus; danach ist jedes Event dieser Generation ein No-op
    ///
    /// Bis `released()` mit dem zurückgegebenen Sender aufgerufen wird, gilt die
    /// Session als im Abbau: `start()` lehnt ab und `end()` wartet.
    fn take(&self, generation: Option<u64>) -> Option<(ActiveSession, watch::Sender<bool>)> {
        let mut inner = self.inner.lock();
        let matches = match (&inner.active, generation) {
            (Some(active), Some(generation)) => active.generation == generation,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !matches {
            return None;
        }
        let active = inner.active.take()?;
        let (done_tx, done_rx) = watch::channel(false);
        inner.releasing = Some((active.generation, done_rx));
        Some((active, done_tx))
    }

    /// Noch laufender Abbau einer herausgelösten Session
    fn releasing(&self) -> Option<watch::Receiver<bool>> {
        self.inner
            .lock()
            .releasing
            .as_ref()
            .map(|(_, done)| done.clone())
    }

    /// Endzustand nach dem Abbau, sofern seitdem kein neuer Anruf begann
    ///
    /// Gibt `false` zurück, wenn die Generation nicht mehr aktuell ist; dann
    /// darf für sie nichts mehr veröffentlicht werden.
    fn settle(&self, generation: u64, outcome: CallState) -> bool {
        let mut inner = self.inner.lock();
        let current = inner.active.is_none() && inner.generation == generation;
        if current {
            inner.state = outcome;
        }
        current
    }

    /// Beendet den Abbau: `start()` ist wieder erlaubt, wartende `end()` kehren zurück
    fn released(&self, generation: u64, done: watch::Sender<bool>) {
        {
            let mut inner = self.inner.lock();
            if matches!(inner.releasing, Some((g, _)) if g == generation) {
                inner.releasing = None;
            }
        }
        let _ = done.send(true);
    }

    fn attach_remote_track(&self, generation: u64, track: RemoteTrack) {
        let available = {
            let mut inner = self.inner.lock();
            let Some(active) = inner.live(generation) else {
                return;
            };

            let label = match track.kind {
                TrackKind::Audio => "remote audio",
                TrackKind::Video => "remote video",
            };
            let media = Arc::new(MediaTrack::new(track.id, track.kind, label));

            match active.remote.clone() {
                None => {
                    let remote = MediaStreamHandle::new(track.stream_id, vec![media]);
                    active.remote = Some(remote.clone());
                    Some(remote)
                }
                Some(remote) if remote.id() == track.stream_id => {
                    remote.add_track(media);
                    None
                }
                Some(remote) => {
                    tracing::warn!(
                        "Ignoring track of stream {} (already receiving {})",
                        track.stream_id,
                        remote.id()
                    );
                    None
                }
            }
        };

        if let Some(remote) = available {
            tracing::info!("Remote stream available: {}", remote.id());
            self.publish(CallEvent::RemoteStreamAvailable(remote));
        }
    }
}

/// Gibt alle Ressourcen einer herausgelösten Session frei
async fn release(capture: &dyn MediaCapture, mut active: ActiveSession, send_bye: bool) {
    let _ = active.cancel.send(true);

    // 1. Lokale Tracks stoppen
    if let Some(local) = active.local.take() {
        capture.release(&local);
    }
    if let Some(remote) = active.remote.take() {
        remote.stop();
    }

    // 2. Peer Connection schließen
    if let Some(peer) = active.peer.take() {
        peer.close().await;
    }

    // 3. Bye (best effort) und Transport schließen
    if let Some(transport) = active.transport.take() {
        if send_bye {
            transport.send(SignalingMessage::Bye);
        }
        transport.close();
    }

    tracing::info!(session = %active.session.id, "Call resources released");
}

/// Abbau aus dem Driver oder nach einem Fehler in `start()`
async fn finish(
    shared: &Shared,
    capture: &dyn MediaCapture,
    generation: u64,
    outcome: CallState,
    send_bye: bool,
    error: Option<&CallError>,
) -> bool {
    let Some((active, done)) = shared.take(Some(generation)) else {
        return false;
    };
    release(capture, active, send_bye).await;

    if shared.settle(generation, outcome) {
        if outcome != CallState::Idle {
            shared.publish(CallEvent::StateChanged(outcome));
        }
        if let Some(error) = error {
            shared.publish(CallEvent::error(error));
        }
    } else {
        tracing::debug!("Session {} superseded, not reporting {:?}", generation, outcome);
    }
    shared.released(generation, done);
    true
}

/// Wartet, bis das Flag gesetzt oder der Sender verworfen wird
async fn raised(flag: &mut watch::Receiver<bool>) {
    loop {
        if *flag.borrow_and_update() {
            return;
        }
        if flag.changed().await.is_err() {
            return;
        }
    }
}

// ============================================================================
// CALL ENGINE
// ============================================================================

/// Verwaltet genau einen Anruf zur Zeit
pub struct CallEngine {
    config: CallConfig,
    capture: Arc<dyn MediaCapture>,
    transports: Arc<dyn TransportFactory>,
    peers: Arc<dyn PeerConnectionFactory>,
    shared: Arc<Shared>,
}

impl CallEngine {
    pub fn new(
        config: CallConfig,
        capture: Arc<dyn MediaCapture>,
        transports: Arc<dyn TransportFactory>,
        peers: Arc<dyn PeerConnectionFactory>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            config,
            capture,
            transports,
            peers,
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    generation: 0,
                    state: CallState::Idle,
                    active: None,
                    releasing: None,
                }),
                event_tx,
            }),
        }
    }

    /// Mikrofon über cpal, WebSocket-Signaling und WebRTC
    pub fn native(config: CallConfig) -> Self {
        let transports = Arc::new(WebSocketTransportFactory::new(config.keepalive));
        Self::new(
            config,
            Arc::new(CpalCapture::new()),
            transports,
            Arc::new(WebRtcPeerFactory::new()),
        )
    }

    pub fn config(&self) -> &CallConfig {
        &self.config
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.shared.event_tx.subscribe()
    }

    pub fn state(&self) -> CallState {
        self.shared.inner.lock().state
    }

    pub fn session(&self) -> Option<CallSession> {
        self.shared
            .inner
            .lock()
            .active
            .as_ref()
            .map(|active| active.session.clone())
    }

    pub fn local_stream(&self) -> Option<MediaStreamHandle> {
        self.shared
            .inner
            .lock()
            .active
            .as_ref()
            .and_then(|active| active.local.clone())
    }

    pub fn remote_stream(&self) -> Option<MediaStreamHandle> {
        self.shared
            .inner
            .lock()
            .active
            .as_ref()
            .and_then(|active| active.remote.clone())
    }

    /// Schaltet das Mikrofon stumm
    pub fn set_muted(&self, muted: bool) {
        if let Some(local) = self.local_stream() {
            local.set_enabled(TrackKind::Audio, !muted);
            tracing::debug!("Microphone muted: {}", muted);
        }
    }

    /// Stumm, wenn es Audio-Tracks gibt und keiner aktiv ist
    pub fn is_muted(&self) -> bool {
        self.local_stream()
            .map(|local| {
                let audio = local.tracks_of(TrackKind::Audio);
                !audio.is_empty() && audio.iter().all(|t| !t.is_enabled())
            })
            .unwrap_or(false)
    }

    pub fn set_video_enabled(&self, enabled: bool) {
        if let Some(local) = self.local_stream() {
            local.set_enabled(TrackKind::Video, enabled);
            tracing::debug!("Camera enabled: {}", enabled);
        }
    }

    /// Startet einen Anruf mit der konfigurierten Rolle
    pub async fn start(
        &self,
        room_id: &str,
        user_id: &str,
    ) -> Result<MediaStreamHandle, CallError> {
        self.start_with_role(room_id, user_id, self.config.role)
            .await
    }

    /// Startet einen Anruf
    ///
    /// Kehrt zurück, sobald der lokale Stream steht, die Signaling-Verbindung
    /// offen ist und (als Initiator) das Offer gesendet wurde.
    pub async fn start_with_role(
        &self,
        room_id: &str,
        user_id: &str,
        role: CallRole,
    ) -> Result<MediaStreamHandle, CallError> {
        let session = CallSession::new(room_id, user_id, role);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let generation = {
            let mut inner = self.shared.inner.lock();
            // Ein verworfener Abbau (Sender weg) blockiert nicht
            let releasing = matches!(
                &inner.releasing,
                Some((_, done)) if done.has_changed().is_ok()
            );
            if inner.active.is_some() || releasing {
                return Err(CallError::AlreadyInCall);
            }
            let generation = inner.generation + 1;
            inner.generation = generation;
            inner.state = CallState::Idle;
            inner.active = Some(ActiveSession {
                generation,
                session: session.clone(),
                local: None,
                remote: None,
                peer: None,
                transport: None,
                driver: None,
                cancel: cancel_tx,
            });
            generation
        };

        tracing::info!(
            session = %session.id,
            room = %session.room_id,
            user = %session.user_id,
            "Starting call as {:?}",
            role
        );

        match self.establish(generation, &session, cancel_rx).await {
            Ok(local) => Ok(local),
            Err(error) => Err(self.abort_start(generation, error).await),
        }
    }

    async fn establish(
        &self,
        generation: u64,
        session: &CallSession,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<MediaStreamHandle, CallError> {
        // 1. Lokale Medien
        let constraints = CaptureConstraints {
            audio: true,
            video: self.config.video,
        };
        let local = self.capture.acquire(constraints).await?;
        if !self
            .shared
            .attach(generation, |active| active.local = Some(local.clone()))
        {
            self.capture.release(&local);
            return Err(CallError::Cancelled);
        }
        self.shared.set_state(generation, CallState::Negotiating);

        // 2. Peer Connection
        let (peer, peer_rx) = self.peers.create(&self.config.ice_servers).await?;
        if !self
            .shared
            .attach(generation, |active| active.peer = Some(Arc::clone(&peer)))
        {
            peer.close().await;
            return Err(CallError::Cancelled);
        }
        peer.add_local_stream(&local).await?;

        // 3. Signaling
        let endpoint = self
            .config
            .endpoint(&session.room_id, &session.user_id)
            .map_err(|e| CallError::InvalidEndpoint(e.to_string()))?;
        let (transport, mut transport_rx) = self.transports.open(&endpoint);
        if !self.shared.attach(generation, |active| {
            active.transport = Some(Arc::clone(&transport))
        }) {
            transport.close();
            return Err(CallError::Cancelled);
        }
        self.wait_for_open(&mut transport_rx, &mut cancel).await?;

        // 4. Offer
        let mut negotiation =
            NegotiationEngine::new(session.role, Arc::clone(&peer), Arc::clone(&transport));
        if session.role == CallRole::Initiator {
            negotiation.send_offer().await?;
            self.shared.set_state(generation, negotiation.state());
        }

        // 5. Driver
        let driver = SessionDriver {
            shared: Arc::clone(&self.shared),
            capture: Arc::clone(&self.capture),
            generation,
            negotiation,
            transport_rx,
            peer_rx,
        };
        let handle = tokio::spawn(driver.run());
        if !self
            .shared
            .attach(generation, |active| active.driver = Some(handle))
        {
            // Die Session ist schon abgebaut; der Driver endet mit dem Transport
            return Err(CallError::Cancelled);
        }

        tracing::info!(session = %session.id, "Call started");
        Ok(local)
    }

    async fn wait_for_open(
        &self,
        events: &mut mpsc::UnboundedReceiver<TransportEvent>,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), CallError> {
        let timeout = self.config.open_timeout;

        let opened = async {
            loop {
                match events.recv().await {
                    Some(TransportEvent::Opened) => return Ok(()),
                    Some(TransportEvent::Error(TransportError::MalformedMessage(detail))) => {
                        tracing::warn!("Dropping malformed signaling message: {}", detail);
                    }
                    Some(TransportEvent::Error(e)) => return Err(CallError::Transport(e)),
                    Some(TransportEvent::Closed(reason)) => {
                        return Err(CallError::Transport(TransportError::ConnectFailed(reason)))
                    }
                    Some(TransportEvent::MessageReceived(message)) => {
                        tracing::warn!("Message before transport opened: {}", message.kind());
                    }
                    None => {
                        return Err(CallError::Transport(TransportError::ConnectFailed(
                            "transport went away".to_string(),
                        )))
                    }
                }
            }
        };

        tokio::select! {
            result = tokio::time::timeout(timeout, opened) => match result {
                Ok(opened) => opened,
                Err(_) => {
                    tracing::warn!("Signaling transport did not open within {:?}", timeout);
                    Err(CallError::TransportTimeout(timeout))
                }
            },
            _ = raised(cancel) => Err(CallError::Cancelled),
        }
    }

    /// Fehler in `start()`: Abbau, dann melden
    async fn abort_start(&self, generation: u64, error: CallError) -> CallError {
        // Kein Zugriff aufs Gerät: die Session verlässt nie `Idle`
        let outcome = match error {
            CallError::Capture(_) => CallState::Idle,
            _ => CallState::Failed,
        };

        if finish(
            &self.shared,
            self.capture.as_ref(),
            generation,
            outcome,
            true,
            Some(&error),
        )
        .await
        {
            tracing::error!("Call failed to start: {}", error);
            error
        } else {
            tracing::info!("Call start cancelled by hangup");
            CallError::Cancelled
        }
    }

    /// Legt auf. Idempotent und aus jedem Zustand erlaubt.
    ///
    /// Baut der Driver die Session gerade selbst ab, wartet `end()` darauf.
    pub async fn end(&self) {
        let Some((mut active, done)) = self.shared.take(None) else {
            match self.shared.releasing() {
                Some(mut released) => {
                    tracing::debug!("Waiting for running teardown");
                    raised(&mut released).await;
                }
                None => tracing::debug!("No active call to end"),
            }
            return;
        };
        tracing::info!(session = %active.session.id, "Ending call");
        let generation = active.generation;

        if let Some(driver) = active.driver.take() {
            driver.abort();
            let _ = driver.await;
        }

        release(self.capture.as_ref(), active, true).await;
        if self.shared.settle(generation, CallState::Closed) {
            self.shared.publish(CallEvent::StateChanged(CallState::Closed));
        }
        self.shared.released(generation, done);
    }
}

impl std::fmt::Debug for CallEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallEngine")
            .field("state", &self.state())
            .field("session", &self.session())
            .finish()
    }
}

// ============================================================================
// SESSION DRIVER
// ============================================================================

enum Exit {
    Closed(String),
    Failed(NegotiationError),
}

/// Arbeitet Transport- und Peer-Events einer Session der Reihe nach ab
struct SessionDriver {
    shared: Arc<Shared>,
    capture: Arc<dyn MediaCapture>,
    generation: u64,
    negotiation: NegotiationEngine,
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    peer_rx: mpsc::UnboundedReceiver<PeerEvent>,
}

impl SessionDriver {
    async fn run(mut self) {
        let exit = self.drive().await;
        self.negotiation.close();

        match exit {
            Exit::Closed(reason) => {
                // Gegenseite ist schon weg: kein Bye
                tracing::info!("Call closed: {}", reason);
                finish(
                    &self.shared,
                    self.capture.as_ref(),
                    self.generation,
                    CallState::Closed,
                    false,
                    None,
                )
                .await;
            }
            Exit::Failed(error) => {
                let error = CallError::Negotiation(error);
                tracing::error!("Call failed: {}", error);
                finish(
                    &self.shared,
                    self.capture.as_ref(),
                    self.generation,
                    CallState::Failed,
                    true,
                    Some(&error),
                )
                .await;
            }
        }
    }

    async fn drive(&mut self) -> Exit {
        let mut peer_open = true;

        loop {
            tokio::select! {
                event = self.transport_rx.recv() => match event {
                    Some(TransportEvent::MessageReceived(message)) => {
                        if let Some(exit) = self.on_message(message).await {
                            return exit;
                        }
                    }
                    Some(TransportEvent::Closed(reason)) => return Exit::Closed(reason),
                    Some(TransportEvent::Error(TransportError::MalformedMessage(detail))) => {
                        tracing::warn!("Dropping malformed signaling message: {}", detail);
                    }
                    Some(TransportEvent::Error(e)) => {
                        tracing::warn!("Signaling transport error: {}", e);
                    }
                    Some(TransportEvent::Opened) => {}
                    None => return Exit::Closed("signaling transport gone".to_string()),
                },
                event = self.peer_rx.recv(), if peer_open => match event {
                    Some(PeerEvent::LocalCandidate(candidate)) => {
                        self.negotiation.on_local_candidate(candidate);
                    }
                    Some(PeerEvent::RemoteTrack(track)) => {
                        self.shared.attach_remote_track(self.generation, track);
                    }
                    Some(PeerEvent::ConnectionState(state)) => {
                        if let Err(e) = self.negotiation.on_connection_state(state) {
                            return Exit::Failed(e);
                        }
                    }
                    None => peer_open = false,
                },
            }

            self.shared
                .set_state(self.generation, self.negotiation.state());
        }
    }

    async fn on_message(&mut self, message: SignalingMessage) -> Option<Exit> {
        let result = match message {
            SignalingMessage::Offer(offer) => self.negotiation.apply_remote_offer(offer).await,
            SignalingMessage::Answer(answer) => {
                self.negotiation.apply_remote_answer(answer).await
            }
            SignalingMessage::IceCandidate(candidate) => {
                self.negotiation.add_remote_candidate(candidate).await;
                Ok(())
            }
            SignalingMessage::Bye => return Some(Exit::Closed("remote hung up".to_string())),
        };

        match result {
            Err(e) if e.is_fatal() => Some(Exit::Failed(e)),
            _ => None,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_engine::testing::{Connectivity, FakeCapture, FakePeerFactory};
    use crate::signaling::MemoryHub;
    use tokio::sync::Notify;

    struct Party {
        engine: Arc<CallEngine>,
        capture: Arc<FakeCapture>,
        peers: Arc<FakePeerFactory>,
        events: broadcast::Receiver<CallEvent>,
    }

    fn config(role: CallRole) -> CallConfig {
        CallConfig {
            signaling_url: "memory://hub/signal".to_string(),
            open_timeout: Duration::from_millis(200),
            video: true,
            role,
            ..CallConfig::default()
        }
    }

    fn party_with(
        hub: &MemoryHub,
        role: CallRole,
        capture: FakeCapture,
        connectivity: Connectivity,
    ) -> Party {
        party_from(
            hub,
            config(role),
            capture,
            FakePeerFactory::new(connectivity),
        )
    }

    fn party_from(
        hub: &MemoryHub,
        config: CallConfig,
        capture: FakeCapture,
        peers: FakePeerFactory,
    ) -> Party {
        let capture = Arc::new(capture);
        let peers = Arc::new(peers);
        let engine = Arc::new(CallEngine::new(
            config,
            capture.clone(),
            Arc::new(hub.clone()),
            peers.clone(),
        ));
        let events = engine.subscribe();
        Party {
            engine,
            capture,
            peers,
            events,
        }
    }

    fn party(hub: &MemoryHub, role: CallRole) -> Party {
        party_with(hub, role, FakeCapture::new(), Connectivity::Connects)
    }

    async fn wait_for_state(engine: &CallEngine, state: CallState) {
        let reached = tokio::time::timeout(Duration::from_secs(2), async {
            while engine.state() != state {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(
            reached.is_ok(),
            "expected {:?}, still {:?}",
            state,
            engine.state()
        );
    }

    fn drain(events: &mut broadcast::Receiver<CallEvent>) -> Vec<CallEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    fn states(events: &[CallEvent]) -> Vec<CallState> {
        events
            .iter()
            .filter_map(|e| match e {
                CallEvent::StateChanged(state) => Some(*state),
                _ => None,
            })
            .collect()
    }

    fn error_kinds(events: &[CallEvent]) -> Vec<CallErrorKind> {
        events
            .iter()
            .filter_map(|e| match e {
                CallEvent::Error { kind, .. } => Some(*kind),
                _ => None,
            })
            .collect()
    }

    /// Lässt die Relay-Tasks des Hubs gepufferte Nachrichten zustellen
    async fn flush_hub() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    fn sent_by(hub: &MemoryHub, user: &str) -> Vec<SignalingMessage> {
        hub.wire_log("room1")
            .into_iter()
            .filter(|(from, _)| from == user)
            .map(|(_, message)| message)
            .collect()
    }

    /// Baut einen verbundenen Anruf alice (Initiator) <-> bob (Responder) auf
    async fn connected_pair(hub: &MemoryHub) -> (Party, Party) {
        let bob = party(hub, CallRole::Responder);
        bob.engine.start("room1", "bob").await.unwrap();
        let alice = party(hub, CallRole::Initiator);
        alice.engine.start("room1", "alice").await.unwrap();

        wait_for_state(&alice.engine, CallState::Connected).await;
        wait_for_state(&bob.engine, CallState::Connected).await;
        (alice, bob)
    }

    #[tokio::test]
    async fn test_offer_answer_exchange_with_early_candidates() {
        let hub = MemoryHub::new();

        let mut bob = party(&hub, CallRole::Responder);
        bob.engine.start("room1", "bob").await.unwrap();
        assert_eq!(bob.engine.state(), CallState::Negotiating);

        // Drei Candidates vor dem Offer
        for c in ["r1", "r2", "r3"] {
            hub.inject(
                "room1",
                "bob",
                &format!(r#"{{"type":"ice-candidate","payload":{{"candidate":"{}"}}}}"#, c),
            );
        }

        let mut alice = party(&hub, CallRole::Initiator);
        let local = alice.engine.start("room1", "alice").await.unwrap();
        assert_eq!(local.tracks().len(), 2);

        wait_for_state(&alice.engine, CallState::Connected).await;
        wait_for_state(&bob.engine, CallState::Connected).await;

        assert_eq!(sent_by(&hub, "alice")[0].kind(), "offer");
        assert_eq!(sent_by(&hub, "bob")[0].kind(), "answer");

        let bob_peer = &bob.peers.created()[0];
        let applied = bob_peer.applied_candidates();
        assert_eq!(&applied[..3], &["r1", "r2", "r3"]);
        let calls = bob_peer.calls();
        let set_remote = calls.iter().position(|c| c == "set_remote:offer").unwrap();
        let first = calls.iter().position(|c| c == "candidate:r1").unwrap();
        assert!(set_remote < first);

        let alice_events = drain(&mut alice.events);
        assert_eq!(
            states(&alice_events),
            vec![
                CallState::Negotiating,
                CallState::HaveLocalOffer,
                CallState::HaveRemoteDescription,
                CallState::Connected,
            ]
        );
        assert!(alice_events
            .iter()
            .any(|e| matches!(e, CallEvent::RemoteStreamAvailable(_))));
        assert!(alice.engine.remote_stream().is_some());

        assert_eq!(
            states(&drain(&mut bob.events)),
            vec![
                CallState::Negotiating,
                CallState::HaveRemoteDescription,
                CallState::Connected,
            ]
        );
    }

    #[tokio::test]
    async fn test_capture_denied_opens_nothing() {
        let hub = MemoryHub::new();
        let mut alice = party_with(
            &hub,
            CallRole::Initiator,
            FakeCapture::failing(CaptureError::PermissionDenied),
            Connectivity::Connects,
        );

        let result = alice.engine.start("room1", "alice").await;

        assert_eq!(
            result.unwrap_err(),
            CallError::Capture(CaptureError::PermissionDenied)
        );
        assert_eq!(hub.members("room1"), 0);
        assert!(hub.wire_log("room1").is_empty());
        assert!(alice.peers.created().is_empty());
        assert_eq!(alice.engine.state(), CallState::Idle);
        assert!(alice.engine.session().is_none());

        let events = drain(&mut alice.events);
        assert_eq!(events.len(), 1);
        assert_eq!(error_kinds(&events), vec![CallErrorKind::Capture]);
    }

    #[tokio::test]
    async fn test_end_twice_tears_down_once() {
        let hub = MemoryHub::new();
        let mut alice = party(&hub, CallRole::Initiator);
        let local = alice.engine.start("room1", "alice").await.unwrap();

        alice.engine.end().await;
        alice.engine.end().await;
        flush_hub().await;

        assert_eq!(alice.engine.state(), CallState::Closed);
        assert!(!local.is_active());
        assert!(local.tracks().iter().all(|t| !t.is_enabled()));
        assert_eq!(alice.peers.created()[0].close_count(), 1);
        assert_eq!(hub.members("room1"), 0);

        let byes = sent_by(&hub, "alice")
            .into_iter()
            .filter(|m| *m == SignalingMessage::Bye)
            .count();
        assert_eq!(byes, 1);

        let closed = states(&drain(&mut alice.events))
            .into_iter()
            .filter(|s| *s == CallState::Closed)
            .count();
        assert_eq!(closed, 1);
        assert!(alice.engine.local_stream().is_none());
    }

    #[tokio::test]
    async fn test_end_before_capture_resolves_releases_stream() {
        let hub = MemoryHub::new();
        let gate = Arc::new(Notify::new());
        let alice = party_with(
            &hub,
            CallRole::Initiator,
            FakeCapture::gated(gate.clone()),
            Connectivity::Connects,
        );

        let engine = alice.engine.clone();
        let start = tokio::spawn(async move { engine.start("room1", "alice").await });
        while alice.engine.session().is_none() {
            tokio::task::yield_now().await;
        }

        alice.engine.end().await;
        gate.notify_one();

        let result = start.await.unwrap();
        assert_eq!(result.unwrap_err(), CallError::Cancelled);

        let acquired = alice.capture.acquired();
        assert_eq!(acquired.len(), 1);
        assert!(!acquired[0].is_active());
        assert!(acquired[0].tracks().iter().all(|t| !t.is_enabled()));
        assert!(alice.peers.created().is_empty());
        assert_eq!(hub.members("room1"), 0);
        assert!(alice.engine.local_stream().is_none());
    }

    #[tokio::test]
    async fn test_transport_drop_while_connected_closes_once() {
        let hub = MemoryHub::new();
        let (mut alice, _bob) = connected_pair(&hub).await;
        let local = alice.engine.local_stream().unwrap();
        drain(&mut alice.events);

        hub.drop_member("room1", "alice");
        wait_for_state(&alice.engine, CallState::Closed).await;

        assert!(!local.is_active());
        assert_eq!(alice.peers.created()[0].close_count(), 1);

        // Ein später end() ändert nichts mehr
        alice.engine.end().await;
        assert_eq!(
            states(&drain(&mut alice.events)),
            vec![CallState::Closed]
        );
        assert!(!sent_by(&hub, "alice").contains(&SignalingMessage::Bye));
    }

    #[tokio::test]
    async fn test_end_waits_for_running_teardown() {
        let hub = MemoryHub::new();
        let bob = party(&hub, CallRole::Responder);
        bob.engine.start("room1", "bob").await.unwrap();
        let mut alice = party_from(
            &hub,
            config(CallRole::Initiator),
            FakeCapture::new(),
            FakePeerFactory::new(Connectivity::Connects)
                .with_close_delay(Duration::from_millis(300)),
        );
        alice.engine.start("room1", "alice").await.unwrap();
        wait_for_state(&alice.engine, CallState::Connected).await;
        drain(&mut alice.events);

        // Das Bye von bob lässt alices Driver abbauen; close() hängt 300 ms
        bob.engine.end().await;
        tokio::time::timeout(Duration::from_secs(2), async {
            while alice.engine.session().is_some() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(
            alice.engine.start("room2", "alice").await.unwrap_err(),
            CallError::AlreadyInCall
        );

        alice.engine.end().await;
        assert_eq!(alice.engine.state(), CallState::Closed);
        assert_eq!(alice.peers.created()[0].close_count(), 1);

        alice.engine.start("room2", "alice").await.unwrap();
        flush_hub().await;

        assert_eq!(
            states(&drain(&mut alice.events)),
            vec![
                CallState::Closed,
                CallState::Negotiating,
                CallState::HaveLocalOffer,
            ]
        );
        assert_eq!(alice.engine.state(), CallState::HaveLocalOffer);
        assert_eq!(alice.engine.session().unwrap().room_id, "room2");
    }

    #[tokio::test]
    async fn test_end_cancels_waiting_for_transport() {
        let hub = MemoryHub::unresponsive();
        let alice = party_from(
            &hub,
            CallConfig {
                open_timeout: Duration::from_secs(30),
                ..config(CallRole::Initiator)
            },
            FakeCapture::new(),
            FakePeerFactory::new(Connectivity::Connects),
        );

        let engine = alice.engine.clone();
        let start = tokio::spawn(async move { engine.start("room1", "alice").await });
        while alice.peers.created().is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let begun = tokio::time::Instant::now();
        alice.engine.end().await;
        let result = tokio::time::timeout(Duration::from_secs(2), start)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(result.unwrap_err(), CallError::Cancelled);
        assert!(begun.elapsed() < Duration::from_secs(2));
        assert_eq!(alice.engine.state(), CallState::Closed);
        assert!(!alice.capture.acquired()[0].is_active());
        assert_eq!(alice.peers.created()[0].close_count(), 1);
        assert!(alice.engine.local_stream().is_none());
    }

    #[tokio::test]
    async fn test_open_timeout_tears_down() {
        let hub = MemoryHub::unresponsive();
        let mut alice = party(&hub, CallRole::Initiator);

        let result = alice.engine.start("room1", "alice").await;

        assert_eq!(
            result.unwrap_err(),
            CallError::TransportTimeout(Duration::from_millis(200))
        );
        assert_eq!(alice.engine.state(), CallState::Failed);
        assert!(!alice.capture.acquired()[0].is_active());
        assert_eq!(alice.peers.created()[0].close_count(), 1);

        let events = drain(&mut alice.events);
        assert_eq!(
            states(&events),
            vec![CallState::Negotiating, CallState::Failed]
        );
        assert_eq!(error_kinds(&events), vec![CallErrorKind::TransportTimeout]);
        assert!(matches!(events.last(), Some(CallEvent::Error { .. })));
    }

    #[tokio::test]
    async fn test_remote_bye_closes_call() {
        let hub = MemoryHub::new();
        let (mut alice, bob) = connected_pair(&hub).await;
        drain(&mut alice.events);

        bob.engine.end().await;
        wait_for_state(&alice.engine, CallState::Closed).await;

        assert_eq!(states(&drain(&mut alice.events)), vec![CallState::Closed]);
        assert!(alice.engine.local_stream().is_none());
        assert_eq!(alice.peers.created()[0].close_count(), 1);
        assert!(!sent_by(&hub, "alice").contains(&SignalingMessage::Bye));
    }

    #[tokio::test]
    async fn test_malformed_message_is_dropped() {
        let hub = MemoryHub::new();
        let mut bob = party(&hub, CallRole::Responder);
        bob.engine.start("room1", "bob").await.unwrap();

        hub.inject("room1", "bob", "{not json");
        hub.inject("room1", "bob", r#"{"type":"dance","payload":{}}"#);

        let alice = party(&hub, CallRole::Initiator);
        alice.engine.start("room1", "alice").await.unwrap();
        wait_for_state(&bob.engine, CallState::Connected).await;

        assert!(error_kinds(&drain(&mut bob.events)).is_empty());
    }

    #[tokio::test]
    async fn test_invalid_sdp_fails_call() {
        let hub = MemoryHub::new();
        let mut bob = party(&hub, CallRole::Responder);
        let local = bob.engine.start("room1", "bob").await.unwrap();

        hub.inject(
            "room1",
            "bob",
            r#"{"type":"offer","payload":{"type":"offer","sdp":"garbage"}}"#,
        );
        wait_for_state(&bob.engine, CallState::Failed).await;
        flush_hub().await;

        let events = drain(&mut bob.events);
        assert_eq!(
            states(&events),
            vec![CallState::Negotiating, CallState::Failed]
        );
        assert_eq!(error_kinds(&events), vec![CallErrorKind::Negotiation]);
        assert!(matches!(events.last(), Some(CallEvent::Error { .. })));
        assert!(!local.is_active());
        assert!(sent_by(&hub, "bob").contains(&SignalingMessage::Bye));
    }

    #[tokio::test]
    async fn test_ice_failure_fails_call() {
        let hub = MemoryHub::new();
        let bob = party_with(
            &hub,
            CallRole::Responder,
            FakeCapture::new(),
            Connectivity::Silent,
        );
        bob.engine.start("room1", "bob").await.unwrap();
        let mut alice = party_with(
            &hub,
            CallRole::Initiator,
            FakeCapture::new(),
            Connectivity::Fails,
        );
        alice.engine.start("room1", "alice").await.unwrap();

        wait_for_state(&alice.engine, CallState::Failed).await;

        let events = drain(&mut alice.events);
        assert_eq!(error_kinds(&events), vec![CallErrorKind::Negotiation]);
        assert!(events.iter().any(|e| matches!(
            e,
            CallEvent::Error { detail, .. } if detail.contains("ICE")
        )));
    }

    #[tokio::test]
    async fn test_second_start_rejected() {
        let hub = MemoryHub::new();
        let alice = party(&hub, CallRole::Initiator);
        alice.engine.start("room1", "alice").await.unwrap();

        let result = alice.engine.start("room2", "alice").await;
        assert_eq!(result.unwrap_err(), CallError::AlreadyInCall);
        assert_eq!(alice.engine.session().unwrap().room_id, "room1");

        // Nach dem Auflegen geht es wieder
        alice.engine.end().await;
        alice.engine.start("room2", "alice").await.unwrap();
        assert_eq!(alice.engine.session().unwrap().room_id, "room2");
    }

    #[tokio::test]
    async fn test_mute_and_video_toggles() {
        let hub = MemoryHub::new();
        let alice = party(&hub, CallRole::Initiator);

        // Ohne Anruf passiert nichts
        alice.engine.set_muted(true);
        assert!(!alice.engine.is_muted());

        let local = alice.engine.start("room1", "alice").await.unwrap();
        assert!(!alice.engine.is_muted());

        alice.engine.set_muted(true);
        assert!(alice.engine.is_muted());
        assert!(!local.tracks_of(TrackKind::Audio)[0].is_enabled());
        assert!(local.tracks_of(TrackKind::Video)[0].is_enabled());

        alice.engine.set_video_enabled(false);
        assert!(!local.tracks_of(TrackKind::Video)[0].is_enabled());

        alice.engine.set_muted(false);
        assert!(!alice.engine.is_muted());
        assert!(local.tracks_of(TrackKind::Audio)[0].is_enabled());
    }
}
