//! Kommandozeilen-Client: tritt einem Raum bei und telefoniert mit dem
//! Mikrofon, bis Ctrl-C gedrückt wird.

use access_call_lib::call_engine::TrackKind;
use access_call_lib::{init_logging, CallConfig, CallEngine, CallEvent, CallRole};
use anyhow::Context;
use clap::Parser;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser)]
#[command(name = "access-call")]
#[command(version)]
#[command(about = "Joins a call room over WebSocket signaling and talks over WebRTC.", long_about = None)]
struct Cli {
    /// Room to join
    room: String,
    /// Own user id in the room
    user: String,
    /// initiator or responder (default: CALL_ROLE or initiator)
    #[arg(short, long)]
    role: Option<CallRole>,
    /// Signaling server base URL (default: SIGNALING_URL)
    #[arg(short, long)]
    signaling_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging();

    let mut config = CallConfig::from_env().context("invalid configuration")?;
    if let Some(role) = cli.role {
        config.role = role;
    }
    if let Some(url) = cli.signaling_url {
        config.signaling_url = url;
    }

    let engine = CallEngine::native(config);
    let mut events = engine.subscribe();

    let local = engine
        .start(&cli.room, &cli.user)
        .await
        .context("failed to start call")?;
    tracing::info!(
        "Joined room '{}' as '{}' ({} local track(s))",
        cli.room,
        cli.user,
        local.tracks().len()
    );

    let mut level_timer = tokio::time::interval(Duration::from_secs(5));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Hanging up");
                break;
            }
            _ = level_timer.tick() => {
                if let Some(mic) = local.tracks_of(TrackKind::Audio).first() {
                    tracing::debug!("Microphone level: {:.3}", mic.level());
                }
            }
            event = events.recv() => match event {
                Ok(CallEvent::StateChanged(state)) => {
                    tracing::info!("Call state changed: {:?}", state);
                    if state.is_terminal() {
                        break;
                    }
                }
                Ok(CallEvent::RemoteStreamAvailable(remote)) => {
                    tracing::info!(
                        "Receiving remote stream {} ({} track(s))",
                        remote.id(),
                        remote.tracks().len()
                    );
                }
                Ok(CallEvent::Error { kind, detail }) => {
                    tracing::error!("Call error ({:?}): {}", kind, detail);
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Missed {} call event(s)", skipped);
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    engine.end().await;
    Ok(())
}
