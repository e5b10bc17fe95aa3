//! Access Call - Peer-to-Peer Anruf-Kern
//!
//! Signaling und Lebenszyklus eines Zwei-Parteien-Anrufs:
//! - Signaling-Transport (WebSocket oder In-Process) mit JSON-Nachrichten
//! - WebRTC Negotiation mit gepufferten ICE Candidates
//! - Lokale Medien über cpal
//! - Untertitel-Spur für Transkripte

pub mod call_engine;
pub mod config;
pub mod signaling;
pub mod transcript;

pub use call_engine::{
    CallEngine, CallError, CallErrorKind, CallEvent, CallRole, CallSession, CallState,
    MediaStreamHandle,
};
pub use config::{CallConfig, ConfigError};

/// Log-Filter, wenn `RUST_LOG` nicht gesetzt ist
pub const DEFAULT_LOG_FILTER: &str = "access_call_lib=debug,access_call=debug,webrtc=warn";

/// Initialisiert das Logging (einmalig, weitere Aufrufe sind No-ops)
///
/// `RUST_LOG` überschreibt [`DEFAULT_LOG_FILTER`].
pub fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER));

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
