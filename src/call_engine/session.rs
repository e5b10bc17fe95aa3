//! Call Session und Status

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// CALL ROLE
// ============================================================================

/// Wer das Offer erstellt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallRole {
    /// Erstellt und sendet das Offer
    Initiator,
    /// Wartet auf das Offer und antwortet
    Responder,
}

impl FromStr for CallRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "initiator" | "caller" => Ok(Self::Initiator),
            "responder" | "callee" => Ok(Self::Responder),
            other => Err(format!("unknown call role '{}'", other)),
        }
    }
}

// ============================================================================
// CALL STATE
// ============================================================================

/// Aktueller Status eines Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallState {
    /// Kein aktiver Anruf
    Idle,
    /// Lokale Medien sind da, die Verbindung wird aufgebaut
    Negotiating,
    /// Offer ist gesendet, warte auf Answer
    HaveLocalOffer,
    /// Remote Description ist gesetzt, ICE läuft
    HaveRemoteDescription,
    /// Anruf aktiv
    Connected,
    /// Abgebrochen wegen Fehler
    Failed,
    /// Anruf beendet
    Closed,
}

impl CallState {
    /// `Failed` und `Closed` werden nie wieder verlassen
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

// ============================================================================
// CALL SESSION
// ============================================================================

/// Ein einzelner Anruf vom `start()` bis zum Ende
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSession {
    pub id: Uuid,
    pub room_id: String,
    pub user_id: String,
    pub role: CallRole,
    pub started_at: DateTime<Utc>,
}

impl CallSession {
    pub fn new(room_id: impl Into<String>, user_id: impl Into<String>, role: CallRole) -> Self {
        Self {
            id: Uuid::new_v4(),
            room_id: room_id.into(),
            user_id: user_id.into(),
            role,
            started_at: Utc::now(),
        }
    }
}
