//! WebSocket Transport für den Signaling-Server
//!
//! Verwaltet die WebSocket-Verbindung zum Rendezvous-Server:
//! - Asynchroner Verbindungsaufbau
//! - Getrennte Read- und Write-Tasks
//! - Ping-Keepalive gegen Idle-Timeouts
//! - Close-Frame beim Schließen

use super::messages::SignalingMessage;
use super::transport::{
    SignalingTransport, TransportCore, TransportError, TransportEvent, TransportFactory,
    TransportState,
};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

/// Standard-Intervall für WebSocket-Pings
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(25);

// ============================================================================
// FACTORY
// ============================================================================

/// Öffnet für jeden Anruf eine neue WebSocket-Verbindung
#[derive(Debug, Clone)]
pub struct WebSocketTransportFactory {
    keepalive: Duration,
}

impl WebSocketTransportFactory {
    pub fn new(keepalive: Duration) -> Self {
        Self { keepalive }
    }
}

impl Default for WebSocketTransportFactory {
    fn default() -> Self {
        Self::new(DEFAULT_KEEPALIVE)
    }
}

impl TransportFactory for WebSocketTransportFactory {
    fn open(
        &self,
        endpoint: &Url,
    ) -> (
        Arc<dyn SignalingTransport>,
        mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let (transport, events) = WebSocketTransport::open(endpoint.clone(), self.keepalive);
        (transport, events)
    }
}

// ============================================================================
// WEBSOCKET TRANSPORT
// ============================================================================

/// WebSocket-Verbindung zum Signaling-Server
pub struct WebSocketTransport {
    core: Arc<TransportCore>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WebSocketTransport {
    /// Startet den Verbindungsaufbau im Hintergrund
    pub fn open(
        endpoint: Url,
        keepalive: Duration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (core, events) = TransportCore::new(endpoint.host_str().unwrap_or("signaling"));
        let core = Arc::new(core);

        let transport = Arc::new(Self {
            core: Arc::clone(&core),
            tasks: Mutex::new(Vec::new()),
        });

        let connect = tokio::spawn(Self::run(core, endpoint, keepalive));
        transport.tasks.lock().push(connect);

        (transport, events)
    }

    /// Verbindet, startet den Write-Task und liest bis zum Ende der Verbindung
    async fn run(
        core: Arc<TransportCore>,
        endpoint: Url,
        keepalive: Duration,
    ) {
        tracing::info!("Connecting to signaling server: {}", endpoint);

        let ws_stream = match connect_async(endpoint.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                tracing::error!("WebSocket connection failed: {}", e);
                core.report(TransportError::ConnectFailed(e.to_string()));
                core.mark_closed(format!("connect failed: {}", e));
                return;
            }
        };

        let (write, mut read) = ws_stream.split();

        // Ausgehender Text vom Core
        let (wire_tx, wire_rx) = mpsc::unbounded_channel::<String>();
        let writer = tokio::spawn(Self::write_loop(Arc::clone(&core), write, wire_rx, keepalive));

        if !core.mark_open(wire_tx) {
            // close() kam dem Verbindungsaufbau zuvor
            writer.abort();
            return;
        }

        let mut writer = writer;
        let read_loop = async {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => core.deliver(&text),
                    Ok(Message::Close(frame)) => {
                        tracing::info!("WebSocket closed by server");
                        let reason = frame
                            .map(|f| f.reason.to_string())
                            .filter(|r| !r.is_empty())
                            .unwrap_or_else(|| "closed by server".to_string());
                        core.mark_closed(reason);
                        break;
                    }
                    Ok(Message::Binary(_)) => {
                        core.report(TransportError::MalformedMessage(
                            "binary frames are not part of the protocol".to_string(),
                        ));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        core.report(TransportError::Dropped(e.to_string()));
                        core.mark_closed(format!("connection dropped: {}", e));
                        break;
                    }
                }
            }
        };

        tokio::select! {
            _ = read_loop => writer.abort(),
            // Writer endet nach lokalem close() oder einem Schreibfehler
            _ = &mut writer => {}
        }

        core.mark_closed("connection ended");
    }

    /// Schreibt ausgehende Nachrichten und Pings auf den Socket
    ///
    /// Endet, sobald der Core seinen Sender verwirft (lokales `close()`):
    /// bereits übergebene Nachrichten wie `Bye` gehen noch raus, danach
    /// folgt der Close-Frame.
    async fn write_loop<S>(
        core: Arc<TransportCore>,
        mut write: S,
        mut wire_rx: mpsc::UnboundedReceiver<String>,
        keepalive: Duration,
    ) where
        S: futures::Sink<Message> + Unpin,
        S::Error: std::fmt::Display,
    {
        let mut interval = tokio::time::interval(keepalive.max(Duration::from_secs(1)));
        // Der erste Tick kommt sofort
        interval.tick().await;

        loop {
            tokio::select! {
                msg = wire_rx.recv() => {
                    let Some(text) = msg else {
                        let _ = write.send(Message::Close(None)).await;
                        return;
                    };
                    if let Err(e) = write.send(Message::Text(text)).await {
                        tracing::error!("Failed to send WebSocket message: {}", e);
                        core.report(TransportError::Dropped(e.to_string()));
                        core.mark_closed(format!("write failed: {}", e));
                        return;
                    }
                }
                _ = interval.tick() => {
                    if let Err(e) = write.send(Message::Ping(Vec::new())).await {
                        tracing::warn!("Failed to send keepalive ping: {}", e);
                    }
                }
            }
        }
    }
}

impl SignalingTransport for WebSocketTransport {
    fn state(&self) -> TransportState {
        self.core.state()
    }

    fn send(&self, message: SignalingMessage) -> bool {
        self.core.send(&message)
    }

    fn close(&self) {
        let was_open = self.core.state() == TransportState::Open;
        if !self.core.mark_closed("closed locally") {
            return;
        }

        // Offen: der Writer schickt noch ausstehende Nachrichten und den
        // Close-Frame und beendet dann die Verbindung selbst
        if !was_open {
            for task in self.tasks.lock().drain(..) {
                task.abort();
            }
        }
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("endpoint", &self.core.label())
            .field("state", &self.core.state())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
