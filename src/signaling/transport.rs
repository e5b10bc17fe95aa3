//! Transport-Abstraktion für den Signaling-Kanal
//!
//! Ein Transport ist genau einer Verbindung zum Rendezvous-Server
//! zugeordnet. Er wird einmal geöffnet, einmal geschlossen und nie
//! wiederverwendet: ein neuer Anruf braucht einen neuen Transport.

use super::messages::SignalingMessage;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use url::Url;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Signaling connection failed: {0}")]
    ConnectFailed(String),

    #[error("Signaling connection dropped: {0}")]
    Dropped(String),

    #[error("Malformed signaling message: {0}")]
    MalformedMessage(String),
}

// ============================================================================
// TRANSPORT EVENTS
// ============================================================================

/// Events, die ein Transport auf seinem Event-Kanal ausliefert
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Verbindung steht, ab jetzt wird gesendet
    Opened,

    /// Verbindung ist endgültig zu (wird genau einmal gemeldet)
    Closed(String),

    /// Fehler; `MalformedMessage` ist nicht fatal
    Error(TransportError),

    /// Eingehende Signaling-Nachricht
    MessageReceived(SignalingMessage),
}

/// Verbindungsstatus eines Transports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Connecting,
    Open,
    Closed,
}

// ============================================================================
// TRAITS
// ============================================================================

/// Eine offene (oder sich öffnende) Signaling-Verbindung
pub trait SignalingTransport: Send + Sync {
    /// Aktueller Verbindungsstatus
    fn state(&self) -> TransportState;

    /// Best-effort Versand. Blockiert nie und schlägt nie fehl; ist der
    /// Transport nicht offen, wird die Nachricht verworfen.
    ///
    /// Gibt zurück, ob die Nachricht an die Leitung übergeben wurde.
    fn send(&self, message: SignalingMessage) -> bool;

    /// Schließt den Transport. Idempotent und endgültig.
    fn close(&self);
}

/// Erzeugt für jeden Anruf einen frischen Transport
pub trait TransportFactory: Send + Sync {
    /// Beginnt den Verbindungsaufbau. Der Aufbau läuft asynchron, der
    /// Erfolg wird als [`TransportEvent::Opened`] gemeldet.
    fn open(
        &self,
        endpoint: &Url,
    ) -> (
        Arc<dyn SignalingTransport>,
        mpsc::UnboundedReceiver<TransportEvent>,
    );
}

// ============================================================================
// TRANSPORT CORE
// ============================================================================

/// Gemeinsamer Zustandsautomat aller Transport-Implementierungen
///
/// Kapselt Verbindungsstatus, Verwerfen beim Senden im falschen Zustand,
/// den JSON-Codec und die einmalige `Closed`-Meldung. Die konkrete
/// Leitung (WebSocket, In-Process) liefert nur noch Text.
pub(crate) struct TransportCore {
    label: String,
    state: Mutex<CoreState>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
}

struct CoreState {
    status: TransportState,
    wire: Option<mpsc::UnboundedSender<String>>,
}

impl TransportCore {
    pub(crate) fn new(label: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let core = Self {
            label: label.into(),
            state: Mutex::new(CoreState {
                status: TransportState::Connecting,
                wire: None,
            }),
            event_tx,
        };
        (core, event_rx)
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn state(&self) -> TransportState {
        self.state.lock().status
    }

    /// Verbindung steht; `wire` nimmt ab jetzt ausgehenden Text entgegen
    pub(crate) fn mark_open(&self, wire: mpsc::UnboundedSender<String>) -> bool {
        {
            let mut state = self.state.lock();
            if state.status != TransportState::Connecting {
                return false;
            }
            state.status = TransportState::Open;
            state.wire = Some(wire);
        }
        tracing::debug!("[{}] signaling transport opened", self.label);
        let _ = self.event_tx.send(TransportEvent::Opened);
        true
    }

    /// Übergang nach `Closed`. Nur der erste Aufruf meldet `Closed`.
    pub(crate) fn mark_closed(&self, reason: impl Into<String>) -> bool {
        {
            let mut state = self.state.lock();
            if state.status == TransportState::Closed {
                return false;
            }
            state.status = TransportState::Closed;
            state.wire = None;
        }
        let reason = reason.into();
        tracing::debug!("[{}] signaling transport closed: {}", self.label, reason);
        let _ = self.event_tx.send(TransportEvent::Closed(reason));
        true
    }

    /// Meldet einen Fehler auf dem Event-Kanal
    pub(crate) fn report(&self, error: TransportError) {
        if self.state() == TransportState::Closed {
            return;
        }
        let _ = self.event_tx.send(TransportEvent::Error(error));
    }

    /// Kodiert und übergibt eine Nachricht an die Leitung
    pub(crate) fn send(&self, message: &SignalingMessage) -> bool {
        let state = self.state.lock();
        let wire = match (state.status, state.wire.as_ref()) {
            (TransportState::Open, Some(wire)) => wire,
            (status, _) => {
                tracing::debug!(
                    "[{}] dropping '{}' message, transport is {:?}",
                    self.label,
                    message.kind(),
                    status
                );
                return false;
            }
        };

        let text = match message.encode() {
            Ok(text) => text,
            Err(e) => {
                tracing::error!("[{}] failed to encode '{}': {}", self.label, message.kind(), e);
                return false;
            }
        };

        if wire.send(text).is_err() {
            tracing::debug!(
                "[{}] dropping '{}' message, writer is gone",
                self.label,
                message.kind()
            );
            return false;
        }
        true
    }

    /// Verarbeitet eingehenden Text; fehlerhafte Nachrichten werden
    /// verworfen und als nicht-fataler Fehler gemeldet
    pub(crate) fn deliver(&self, text: &str) {
        if self.state() != TransportState::Open {
            tracing::debug!("[{}] ignoring inbound message, transport not open", self.label);
            return;
        }

        match SignalingMessage::decode(text) {
            Ok(message) => {
                tracing::trace!("[{}] received '{}'", self.label, message.kind());
                let _ = self.event_tx.send(TransportEvent::MessageReceived(message));
            }
            Err(error) => {
                tracing::warn!("[{}] dropping inbound message: {}", self.label, error);
                let _ = self.event_tx.send(TransportEvent::Error(error));
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
