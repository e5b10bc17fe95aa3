//! Negotiation Engine - Offer/Answer/ICE
//!
//! Besitzt die Peer Connection eines Anrufs und übersetzt eingehende
//! Signaling-Nachrichten in Aktionen auf der Verbindung. Ausgehende
//! Nachrichten (Offer, Answer, Candidates) gehen direkt über den Transport.
//!
//! Remote Candidates, die vor der Remote Description ankommen, werden
//! gepuffert und in Ankunftsreihenfolge angewendet, sobald die
//! Description gesetzt ist.

use super::peer::{PeerConnection, PeerConnectionState};
use super::session::{CallRole, CallState};
use crate::signaling::{IceCandidate, SessionDescription, SignalingMessage, SignalingTransport};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("Invalid session description: {0}")]
    InvalidDescription(String),

    #[error("ICE connectivity failed")]
    IceFailure,

    #[error("Not allowed in current state: {0}")]
    InvalidState(String),

    #[error("Peer connection error: {0}")]
    PeerConnection(String),
}

impl NegotiationError {
    /// Protokollverletzungen werden verworfen, alles andere beendet den Anruf
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::InvalidState(_))
    }
}

// ============================================================================
// NEGOTIATION ENGINE
// ============================================================================

pub struct NegotiationEngine {
    role: CallRole,
    state: CallState,
    peer: Arc<dyn PeerConnection>,
    transport: Arc<dyn SignalingTransport>,
    /// Candidates, die vor der Remote Description ankamen
    pending: VecDeque<IceCandidate>,
    seen: HashSet<IceCandidate>,
    has_remote: bool,
}

impl NegotiationEngine {
    pub fn new(
        role: CallRole,
        peer: Arc<dyn PeerConnection>,
        transport: Arc<dyn SignalingTransport>,
    ) -> Self {
        Self {
            role,
            state: CallState::Negotiating,
            peer,
            transport,
            pending: VecDeque::new(),
            seen: HashSet::new(),
            has_remote: false,
        }
    }

    pub fn role(&self) -> CallRole {
        self.role
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    /// Anzahl noch gepufferter Remote Candidates
    pub fn pending_candidates(&self) -> usize {
        self.pending.len()
    }

    /// Erstellt das Offer und sendet es (nur Initiator)
    pub async fn send_offer(&mut self) -> Result<(), NegotiationError> {
        if self.state.is_terminal() {
            return Ok(());
        }
        if self.role != CallRole::Initiator || self.state != CallState::Negotiating {
            return Err(self.reject("offer can only be created once by the initiator"));
        }

        let offer = match self.peer.create_offer().await {
            Ok(offer) => offer,
            Err(e) => return Err(self.fail(e)),
        };
        if self.state.is_terminal() {
            return Ok(());
        }

        self.transport.send(SignalingMessage::Offer(offer));
        self.state = CallState::HaveLocalOffer;
        tracing::debug!("Offer sent, waiting for answer");
        Ok(())
    }

    /// Wendet ein Remote Offer an und antwortet (nur Responder)
    pub async fn apply_remote_offer(
        &mut self,
        offer: SessionDescription,
    ) -> Result<(), NegotiationError> {
        if self.state.is_terminal() {
            return Ok(());
        }
        if self.role != CallRole::Responder || self.has_remote {
            return Err(self.reject("unexpected offer"));
        }

        if let Err(e) = self.peer.set_remote_description(offer).await {
            return Err(self.fail(e));
        }
        self.has_remote = true;

        let answer = match self.peer.create_answer().await {
            Ok(answer) => answer,
            Err(e) => return Err(self.fail(e)),
        };

        self.state = CallState::HaveRemoteDescription;
        self.transport.send(SignalingMessage::Answer(answer));
        tracing::debug!("Remote offer applied, answer sent");

        self.drain_pending().await;
        Ok(())
    }

    /// Wendet das Remote Answer an (nur Initiator nach dem Offer)
    pub async fn apply_remote_answer(
        &mut self,
        answer: SessionDescription,
    ) -> Result<(), NegotiationError> {
        if self.state.is_terminal() {
            return Ok(());
        }
        if self.role != CallRole::Initiator || self.state != CallState::HaveLocalOffer {
            return Err(self.reject("unexpected answer"));
        }

        if let Err(e) = self.peer.set_remote_description(answer).await {
            return Err(self.fail(e));
        }
        self.has_remote = true;
        self.state = CallState::HaveRemoteDescription;
        tracing::debug!("Remote answer applied");

        self.drain_pending().await;
        Ok(())
    }

    /// Remote Candidate anwenden oder puffern
    ///
    /// Duplikate werden übersprungen. Fehler beim Anwenden werden nur
    /// geloggt, ein einzelner kaputter Candidate beendet keinen Anruf.
    pub async fn add_remote_candidate(&mut self, candidate: IceCandidate) {
        if self.state.is_terminal() {
            return;
        }
        if !self.seen.insert(candidate.clone()) {
            tracing::debug!("Skipping duplicate ICE candidate");
            return;
        }

        if self.has_remote {
            self.apply_candidate(candidate).await;
        } else {
            self.pending.push_back(candidate);
            tracing::debug!(
                "Queued ICE candidate until remote description is set ({} pending)",
                self.pending.len()
            );
        }
    }

    /// Lokaler Candidate: genau eine Nachricht pro Candidate
    pub fn on_local_candidate(&mut self, candidate: IceCandidate) {
        if self.state.is_terminal() {
            return;
        }
        self.transport.send(SignalingMessage::IceCandidate(candidate));
    }

    /// Statuswechsel der Peer Connection
    pub fn on_connection_state(
        &mut self,
        state: PeerConnectionState,
    ) -> Result<(), NegotiationError> {
        if self.state.is_terminal() {
            return Ok(());
        }

        match state {
            PeerConnectionState::Connected => {
                if self.state == CallState::HaveRemoteDescription {
                    self.state = CallState::Connected;
                    tracing::info!("Peer connection established");
                } else {
                    tracing::debug!("Ignoring connected state in {:?}", self.state);
                }
                Ok(())
            }
            PeerConnectionState::Failed => Err(self.fail(NegotiationError::IceFailure)),
            PeerConnectionState::Disconnected => {
                tracing::warn!("Peer connection disconnected, waiting for ICE to recover");
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Beendet die Negotiation ohne Fehler
    pub fn close(&mut self) {
        if !self.state.is_terminal() {
            self.state = CallState::Closed;
        }
        self.pending.clear();
    }

    async fn drain_pending(&mut self) {
        if !self.pending.is_empty() {
            tracing::debug!("Applying {} queued ICE candidate(s)", self.pending.len());
        }
        while let Some(candidate) = self.pending.pop_front() {
            self.apply_candidate(candidate).await;
        }
    }

    async fn apply_candidate(&self, candidate: IceCandidate) {
        if let Err(e) = self.peer.add_ice_candidate(candidate).await {
            tracing::warn!("Failed to add ICE candidate: {}", e);
        }
    }

    fn reject(&self, reason: &str) -> NegotiationError {
        tracing::warn!(
            "Dropping signaling message: {} (role {:?}, state {:?})",
            reason,
            self.role,
            self.state
        );
        NegotiationError::InvalidState(reason.to_string())
    }

    fn fail(&mut self, error: NegotiationError) -> NegotiationError {
        if error.is_fatal() {
            tracing::error!("Negotiation failed: {}", error);
            self.state = CallState::Failed;
            self.pending.clear();
        }
        error
    }
}

impl std::fmt::Debug for NegotiationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NegotiationEngine")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("pending", &self.pending.len())
            .field("has_remote", &self.has_remote)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
