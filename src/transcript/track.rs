//! Untertitel-Spur mit Zeitabgleich

use super::parser::{parse_transcript, CaptionSegment};
use tokio::sync::watch;

/// Hält die Segmente eines Transkripts und das aktuell sichtbare Segment
pub struct CaptionTrack {
    segments: Vec<CaptionSegment>,
    /// Wiedergabezeit inklusive Offset
    current_time: f64,
    playback_time: f64,
    time_offset: f64,
    current_tx: watch::Sender<Option<CaptionSegment>>,
}

impl Default for CaptionTrack {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptionTrack {
    pub fn new() -> Self {
        let (current_tx, _) = watch::channel(None);
        Self {
            segments: Vec::new(),
            current_time: 0.0,
            playback_time: 0.0,
            time_offset: 0.0,
            current_tx,
        }
    }

    /// Ersetzt das Transkript und setzt den Offset zurück
    pub fn set_transcript(&mut self, transcript: &str) {
        self.segments = parse_transcript(transcript);
        self.time_offset = 0.0;
        self.current_time = self.playback_time;
        tracing::debug!("Loaded transcript with {} segment(s)", self.segments.len());
        self.notify();
    }

    /// Neue Wiedergabezeit in Sekunden
    pub fn update_time(&mut self, time: f64) {
        self.playback_time = time;
        self.current_time = time + self.time_offset;
        self.notify();
    }

    /// Verschiebt die Untertitel gegenüber dem Video (Sekunden)
    pub fn set_time_offset(&mut self, offset: f64) {
        self.time_offset = offset;
        self.current_time = self.playback_time + offset;
        self.notify();
    }

    pub fn time_offset(&self) -> f64 {
        self.time_offset
    }

    pub fn current_segment(&self) -> Option<&CaptionSegment> {
        self.segments.iter().find(|s| s.contains(self.current_time))
    }

    pub fn next_segment(&self) -> Option<&CaptionSegment> {
        self.segments.iter().find(|s| self.current_time < s.start)
    }

    pub fn previous_segment(&self) -> Option<&CaptionSegment> {
        self.segments.iter().rev().find(|s| self.current_time > s.end)
    }

    pub fn segments(&self) -> &[CaptionSegment] {
        &self.segments
    }

    /// Empfänger, der sich nur bei einem Wechsel des Segments ändert
    pub fn subscribe(&self) -> watch::Receiver<Option<CaptionSegment>> {
        self.current_tx.subscribe()
    }

    fn notify(&self) {
        let current = self.current_segment().cloned();
        self.current_tx.send_if_modified(|shown| {
            if *shown == current {
                return false;
            }
            *shown = current;
            true
        });
    }
}

impl std::fmt::Debug for CaptionTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptionTrack")
            .field("segments", &self.segments.len())
            .field("current_time", &self.current_time)
            .field("time_offset", &self.time_offset)
            .finish()
    }
}
