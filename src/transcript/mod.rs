//! Transcript Module - Untertitel zur Wiedergabezeit
//!
//! Unabhängig vom Anruf: ordnet Transkript-Zeilen der aktuellen
//! Wiedergabezeit zu.

mod parser;
mod track;

pub use parser::{parse_transcript, CaptionSegment};
pub use track::CaptionTrack;
