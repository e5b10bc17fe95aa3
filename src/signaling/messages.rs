//! Message Types für das Signaling-Protokoll
//!
//! Jede Nachricht auf dem Draht ist ein JSON-Objekt der Form
//! `{ "type": "offer" | "answer" | "ice-candidate" | "bye", "payload": ... }`.
//! SDP und Candidates werden unverändert durchgereicht.

use super::transport::TransportError;
use serde::{Deserialize, Serialize};

// ============================================================================
// PAYLOAD TYPES
// ============================================================================

/// Art einer Session Description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Session Description im Format von `RTCSessionDescriptionInit`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE Candidate im Format von `RTCIceCandidateInit`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    /// Candidate ohne Media-Zuordnung
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

// ============================================================================
// SIGNALING MESSAGE
// ============================================================================

/// Alle Nachrichten, die zwischen den beiden Peers ausgetauscht werden
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingMessage {
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidate),
    Bye,
}

/// Umschlag auf dem Draht
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    payload: serde_json::Value,
}

impl SignalingMessage {
    /// Wert des `type`-Diskriminators
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::Offer(_) => "offer",
            SignalingMessage::Answer(_) => "answer",
            SignalingMessage::IceCandidate(_) => "ice-candidate",
            SignalingMessage::Bye => "bye",
        }
    }

    /// Serialisiert die Nachricht als JSON-Text
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        let payload = match self {
            SignalingMessage::Offer(desc) | SignalingMessage::Answer(desc) => {
                serde_json::to_value(desc)?
            }
            SignalingMessage::IceCandidate(candidate) => serde_json::to_value(candidate)?,
            SignalingMessage::Bye => serde_json::Value::Null,
        };

        serde_json::to_string(&Envelope {
            kind: self.kind().to_string(),
            payload,
        })
    }

    /// Parst eine Nachricht vom Draht
    pub fn decode(text: &str) -> Result<Self, TransportError> {
        let envelope: Envelope = serde_json::from_str(text)
            .map_err(|e| TransportError::MalformedMessage(e.to_string()))?;

        let malformed = |e: serde_json::Error| {
            TransportError::MalformedMessage(format!("{} payload: {}", envelope.kind, e))
        };

        match envelope.kind.as_str() {
            "offer" => {
                let desc: SessionDescription =
                    serde_json::from_value(envelope.payload.clone()).map_err(malformed)?;
                expect_kind(&desc, SdpKind::Offer)?;
                Ok(SignalingMessage::Offer(desc))
            }
            "answer" => {
                let desc: SessionDescription =
                    serde_json::from_value(envelope.payload.clone()).map_err(malformed)?;
                expect_kind(&desc, SdpKind::Answer)?;
                Ok(SignalingMessage::Answer(desc))
            }
            "ice-candidate" => serde_json::from_value(envelope.payload.clone())
                .map(SignalingMessage::IceCandidate)
                .map_err(malformed),
            "bye" => Ok(SignalingMessage::Bye),
            other => Err(TransportError::MalformedMessage(format!(
                "unknown message type '{}'",
                other
            ))),
        }
    }
}

fn expect_kind(desc: &SessionDescription, expected: SdpKind) -> Result<(), TransportError> {
    if desc.kind == expected {
        Ok(())
    } else {
        Err(TransportError::MalformedMessage(format!(
            "description of type {:?} in {:?} message",
            desc.kind, expected
        )))
    }
}

// ============================================================================
// TESTS
// ============================================================================
