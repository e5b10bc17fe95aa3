//! Media Streams und Capture-Abstraktion
//!
//! Ein [`MediaStreamHandle`] ist eine billig klonbare Referenz auf eine
//! Menge von Tracks. Das Ein-/Ausschalten eines Tracks wirkt sofort und
//! synchron; das Stoppen ist endgültig und idempotent.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("Capture device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Permission to capture media was denied")]
    PermissionDenied,
}

// ============================================================================
// TRACKS
// ============================================================================

/// Art eines Tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

type StopHook = Box<dyn FnOnce() + Send>;

/// Ein einzelner Audio- oder Video-Track
pub struct MediaTrack {
    id: String,
    kind: TrackKind,
    label: String,
    enabled: Arc<AtomicBool>,
    ended: AtomicBool,
    /// Pegel (0.0 - 1.0) als f32-Bits
    level: Arc<AtomicU32>,
    on_stop: Mutex<Option<StopHook>>,
}

impl MediaTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            label: label.into(),
            enabled: Arc::new(AtomicBool::new(true)),
            ended: AtomicBool::new(false),
            level: Arc::new(AtomicU32::new(0)),
            on_stop: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    /// Aktueller Eingangspegel
    pub fn level(&self) -> f32 {
        f32::from_bits(self.level.load(Ordering::Relaxed))
    }

    /// Flag, das die Capture-Quelle pro Callback prüft
    pub(crate) fn enabled_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.enabled)
    }

    pub(crate) fn level_cell(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.level)
    }

    /// Registriert, was beim Stoppen freigegeben werden muss
    pub(crate) fn on_stop(&self, hook: impl FnOnce() + Send + 'static) {
        let mut slot = self.on_stop.lock();
        if self.is_ended() {
            drop(slot);
            hook();
            return;
        }
        *slot = Some(Box::new(hook));
    }

    /// Stoppt den Track. Gibt `true` zurück, wenn er dadurch beendet wurde.
    pub fn stop(&self) -> bool {
        if self.ended.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.set_enabled(false);
        self.level.store(0, Ordering::Relaxed);
        if let Some(hook) = self.on_stop.lock().take() {
            hook();
        }
        true
    }
}

impl std::fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .field("ended", &self.is_ended())
            .finish()
    }
}

// ============================================================================
// STREAM HANDLE
// ============================================================================

struct StreamInner {
    id: String,
    tracks: RwLock<Vec<Arc<MediaTrack>>>,
}

/// Opake Referenz auf einen lokalen oder entfernten Stream
#[derive(Clone)]
pub struct MediaStreamHandle {
    inner: Arc<StreamInner>,
}

impl MediaStreamHandle {
    pub fn new(id: impl Into<String>, tracks: Vec<Arc<MediaTrack>>) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                id: id.into(),
                tracks: RwLock::new(tracks),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.inner.tracks.read().clone()
    }

    pub fn tracks_of(&self, kind: TrackKind) -> Vec<Arc<MediaTrack>> {
        self.inner
            .tracks
            .read()
            .iter()
            .filter(|t| t.kind() == kind)
            .cloned()
            .collect()
    }

    /// Fügt einen Track hinzu, sofern die ID noch nicht vorhanden ist
    pub(crate) fn add_track(&self, track: Arc<MediaTrack>) -> bool {
        let mut tracks = self.inner.tracks.write();
        if tracks.iter().any(|t| t.id() == track.id()) {
            return false;
        }
        tracks.push(track);
        true
    }

    /// Schaltet alle Tracks einer Art ein oder aus
    pub fn set_enabled(&self, kind: TrackKind, enabled: bool) {
        for track in self.tracks_of(kind) {
            if !track.is_ended() {
                track.set_enabled(enabled);
            }
        }
    }

    /// Stoppt alle Tracks; gibt die Anzahl neu gestoppter Tracks zurück
    pub fn stop(&self) -> usize {
        self.tracks().iter().filter(|t| t.stop()).count()
    }

    /// Mindestens ein Track läuft noch
    pub fn is_active(&self) -> bool {
        self.inner.tracks.read().iter().any(|t| !t.is_ended())
    }
}

impl std::fmt::Debug for MediaStreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaStreamHandle")
            .field("id", &self.inner.id)
            .field("tracks", &*self.inner.tracks.read())
            .finish()
    }
}

// ============================================================================
// CAPTURE
// ============================================================================

/// Welche Geräte angefragt werden
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

/// Plattform-Schnittstelle für lokale Aufnahmegeräte
#[async_trait]
pub trait MediaCapture: Send + Sync {
    /// Öffnet die angefragten Geräte. Kann auf eine Berechtigungsabfrage warten.
    async fn acquire(
        &self,
        constraints: CaptureConstraints,
    ) -> Result<MediaStreamHandle, CaptureError>;

    /// Stoppt alle Tracks des Streams. Mehrfacher Aufruf ist ein No-op.
    fn release(&self, stream: &MediaStreamHandle) {
        let stopped = stream.stop();
        if stopped > 0 {
            tracing::info!("Released {} local track(s) of stream {}", stopped, stream.id());
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
