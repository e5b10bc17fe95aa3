//! Audio Capture - Mikrofon über cpal
//!
//! Der cpal-Stream ist nicht `Send`. Jede Aufnahme läuft deshalb auf einem
//! eigenen Thread, der den Stream besitzt, bis der Track gestoppt wird.
//! cpal kennt keine Kameras: eine Video-Anfrage schlägt fehl.

use super::media::{
    CaptureConstraints, CaptureError, MediaCapture, MediaStreamHandle, MediaTrack, TrackKind,
};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig, SupportedStreamConfigRange};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use tokio::sync::oneshot;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate (48kHz ist der Standard für beste Qualität)
pub const SAMPLE_RATE: u32 = 48000;

/// Channels (Mono für Voice)
pub const CHANNELS: u16 = 1;

// ============================================================================
// CPAL CAPTURE
// ============================================================================

/// Mikrofon-Capture über das Standard-Eingabegerät
#[derive(Debug, Default, Clone)]
pub struct CpalCapture;

impl CpalCapture {
    pub fn new() -> Self {
        Self
    }

    /// Öffnet den Input-Stream auf einem eigenen Thread
    async fn open_microphone(track: &MediaTrack) -> Result<(), CaptureError> {
        let enabled = track.enabled_flag();
        let level = track.level_cell();
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), CaptureError>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        std::thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || match open_input_stream(enabled, level) {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    // Hält den Stream am Leben, bis der Track gestoppt wird
                    let _ = stop_rx.recv();
                    drop(stream);
                    tracing::info!("Audio capture stopped");
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?;

        ready_rx.await.map_err(|_| {
            CaptureError::DeviceUnavailable("audio capture thread exited".to_string())
        })??;

        track.on_stop(move || {
            let _ = stop_tx.send(());
        });
        Ok(())
    }
}

#[async_trait]
impl MediaCapture for CpalCapture {
    async fn acquire(
        &self,
        constraints: CaptureConstraints,
    ) -> Result<MediaStreamHandle, CaptureError> {
        if constraints.video {
            return Err(CaptureError::DeviceUnavailable(
                "no video capture backend available".to_string(),
            ));
        }

        let mut tracks = Vec::new();
        if constraints.audio {
            let track = Arc::new(MediaTrack::new(
                uuid::Uuid::new_v4().to_string(),
                TrackKind::Audio,
                default_input_name(),
            ));
            Self::open_microphone(&track).await?;
            tracks.push(track);
        }

        if tracks.is_empty() {
            return Err(CaptureError::DeviceUnavailable(
                "no media kind requested".to_string(),
            ));
        }

        Ok(MediaStreamHandle::new(uuid::Uuid::new_v4().to_string(), tracks))
    }
}

fn default_input_name() -> String {
    cpal::default_host()
        .default_input_device()
        .and_then(|d| d.name().ok())
        .unwrap_or_else(|| "microphone".to_string())
}

/// Baut und startet den Input-Stream
///
/// Deaktivierte Tracks verwerfen ihre Samples, der Pegel wird als RMS
/// pro Callback aktualisiert.
fn open_input_stream(
    enabled: Arc<AtomicBool>,
    level: Arc<AtomicU32>,
) -> Result<Stream, CaptureError> {
    let host = cpal::default_host();
    let device = host.default_input_device().ok_or_else(|| {
        tracing::warn!("No audio input device found");
        CaptureError::DeviceUnavailable("no audio input device found".to_string())
    })?;

    let config = find_best_input_config(&device)?;

    tracing::info!(
        "Starting audio capture: {} Hz, {} channels",
        config.sample_rate.0,
        config.channels
    );

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                if !enabled.load(Ordering::Relaxed) || data.is_empty() {
                    level.store(0f32.to_bits(), Ordering::Relaxed);
                    return;
                }

                // Audio Level berechnen (RMS)
                let rms: f32 =
                    (data.iter().map(|s| s * s).sum::<f32>() / data.len() as f32).sqrt();
                level.store(rms.min(1.0).to_bits(), Ordering::Relaxed);
            },
            |err| {
                tracing::error!("Audio capture error: {}", err);
            },
            None,
        )
        .map_err(map_build_error)?;

    stream
        .play()
        .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?;

    Ok(stream)
}

fn map_build_error(error: cpal::BuildStreamError) -> CaptureError {
    match error {
        cpal::BuildStreamError::DeviceNotAvailable => {
            CaptureError::DeviceUnavailable("audio input device not available".to_string())
        }
        cpal::BuildStreamError::BackendSpecific { err }
            if err.description.to_lowercase().contains("permission") =>
        {
            CaptureError::PermissionDenied
        }
        other => CaptureError::DeviceUnavailable(other.to_string()),
    }
}

/// Findet die beste Input-Konfiguration
fn find_best_input_config(device: &Device) -> Result<StreamConfig, CaptureError> {
    let configs = device
        .supported_input_configs()
        .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?;

    select_best_config(configs.collect())
}

/// Wählt die beste f32-Konfiguration aus einer Liste
///
/// Priorität: 48kHz vor der höchsten verfügbaren Rate, Mono vor Stereo.
fn select_best_config(
    configs: Vec<SupportedStreamConfigRange>,
) -> Result<StreamConfig, CaptureError> {
    let target_rate = cpal::SampleRate(SAMPLE_RATE);

    let mut candidates: Vec<&SupportedStreamConfigRange> = configs
        .iter()
        .filter(|c| c.sample_format() == SampleFormat::F32)
        .collect();
    candidates.sort_by_key(|c| (c.channels() != CHANNELS, c.channels()));

    // Versuche exakt 48kHz zu finden
    if let Some(config) = candidates
        .iter()
        .find(|c| c.min_sample_rate() <= target_rate && c.max_sample_rate() >= target_rate)
    {
        return Ok((*config).clone().with_sample_rate(target_rate).into());
    }

    // Fallback auf die höchste Rate
    if let Some(config) = candidates.first() {
        return Ok((*config).clone().with_max_sample_rate().into());
    }

    Err(CaptureError::DeviceUnavailable(
        "No suitable audio configuration found".to_string(),
    ))
}

// ============================================================================
// TESTS
// ============================================================================
