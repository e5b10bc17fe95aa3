//! In-Process Rendezvous für Signaling
//!
//! Verbindet alle Transports desselben Raums innerhalb eines Prozesses.
//! Nachrichten eines Mitglieds gehen in Sendereihenfolge an alle anderen
//! Mitglieder des Raums. Wird für lokale Loopback-Anrufe und Tests genutzt.

use super::messages::SignalingMessage;
use super::transport::{
    SignalingTransport, TransportCore, TransportEvent, TransportFactory, TransportState,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use url::Url;

// ============================================================================
// HUB
// ============================================================================

#[derive(Default)]
struct HubState {
    rooms: HashMap<String, Vec<Member>>,
    /// Alles, was je über die Leitung ging: (Raum, Absender, Text)
    wire_log: Vec<(String, String, String)>,
    /// Neue Transports bleiben für immer in `Connecting`
    unresponsive: bool,
}

struct Member {
    user: String,
    core: Weak<TransportCore>,
}

/// In-Process Signaling-Server
#[derive(Clone, Default)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hub, der Verbindungen annimmt, aber nie öffnet
    pub fn unresponsive() -> Self {
        let hub = Self::default();
        hub.state.lock().unresponsive = true;
        hub
    }

    /// Anzahl verbundener Mitglieder eines Raums
    pub fn members(&self, room: &str) -> usize {
        let mut state = self.state.lock();
        match state.rooms.get_mut(room) {
            Some(members) => {
                members.retain(|m| {
                    m.core
                        .upgrade()
                        .is_some_and(|core| core.state() != TransportState::Closed)
                });
                members.len()
            }
            None => 0,
        }
    }

    /// Alle Nachrichten, die in einem Raum über die Leitung gingen
    pub fn wire_log(&self, room: &str) -> Vec<(String, SignalingMessage)> {
        self.state
            .lock()
            .wire_log
            .iter()
            .filter(|(r, _, _)| r == room)
            .filter_map(|(_, user, text)| {
                SignalingMessage::decode(text)
                    .ok()
                    .map(|msg| (user.clone(), msg))
            })
            .collect()
    }

    /// Trennt ein Mitglied serverseitig (simuliert einen Verbindungsabbruch)
    pub fn drop_member(&self, room: &str, user: &str) {
        let cores: Vec<Arc<TransportCore>> = {
            let mut state = self.state.lock();
            let Some(members) = state.rooms.get_mut(room) else {
                return;
            };
            let (dropped, kept): (Vec<Member>, Vec<Member>) =
                members.drain(..).partition(|m| m.user == user);
            *members = kept;
            dropped.into_iter().filter_map(|m| m.core.upgrade()).collect()
        };

        for core in cores {
            core.mark_closed("dropped by server");
        }
    }

    /// Stellt einem Mitglied rohen Text zu, als käme er vom Server
    pub fn inject(&self, room: &str, user: &str, text: &str) {
        let cores: Vec<Arc<TransportCore>> = {
            let state = self.state.lock();
            state
                .rooms
                .get(room)
                .map(|members| {
                    members
                        .iter()
                        .filter(|m| m.user == user)
                        .filter_map(|m| m.core.upgrade())
                        .collect()
                })
                .unwrap_or_default()
        };

        for core in cores {
            core.deliver(text);
        }
    }

    /// Leitet Text eines Absenders an alle anderen Mitglieder weiter
    fn relay(&self, room: &str, from: &str, text: String) {
        let targets: Vec<Arc<TransportCore>> = {
            let mut state = self.state.lock();
            state
                .wire_log
                .push((room.to_string(), from.to_string(), text.clone()));
            state
                .rooms
                .get(room)
                .map(|members| {
                    members
                        .iter()
                        .filter(|m| m.user != from)
                        .filter_map(|m| m.core.upgrade())
                        .collect()
                })
                .unwrap_or_default()
        };

        for core in targets {
            core.deliver(&text);
        }
    }

    fn leave(&self, room: &str, core: &Arc<TransportCore>) {
        let mut state = self.state.lock();
        if let Some(members) = state.rooms.get_mut(room) {
            members.retain(|m| {
                m.core
                    .upgrade()
                    .is_some_and(|other| !Arc::ptr_eq(&other, core))
            });
        }
    }
}

impl std::fmt::Debug for MemoryHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryHub")
            .field("rooms", &state.rooms.len())
            .field("unresponsive", &state.unresponsive)
            .finish()
    }
}

/// Liest Raum und Benutzer aus `.../rooms/{room}?user={user}`
///
/// Der Raum wird in seiner URL-kodierten Form verglichen.
fn parse_endpoint(endpoint: &Url) -> (String, String) {
    let room = endpoint
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .unwrap_or_default()
        .to_string();
    let user = endpoint
        .query_pairs()
        .find(|(key, _)| key == "user")
        .map(|(_, value)| value.into_owned())
        .unwrap_or_default();
    (room, user)
}

impl TransportFactory for MemoryHub {
    fn open(
        &self,
        endpoint: &Url,
    ) -> (
        Arc<dyn SignalingTransport>,
        mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let (room, user) = parse_endpoint(endpoint);
        let (core, events) = TransportCore::new(format!("memory:{}/{}", room, user));
        let core = Arc::new(core);

        let (wire_tx, mut wire_rx) = mpsc::unbounded_channel::<String>();
        let unresponsive = {
            let mut state = self.state.lock();
            if !state.unresponsive {
                state.rooms.entry(room.clone()).or_default().push(Member {
                    user: user.clone(),
                    core: Arc::downgrade(&core),
                });
            }
            state.unresponsive
        };

        if !unresponsive {
            core.mark_open(wire_tx);

            // Relay-Task: leitet in Sendereihenfolge weiter
            let hub = self.clone();
            let (relay_room, relay_user) = (room.clone(), user.clone());
            tokio::spawn(async move {
                while let Some(text) = wire_rx.recv().await {
                    hub.relay(&relay_room, &relay_user, text);
                }
            });
        }

        let transport = Arc::new(MemoryTransport {
            hub: self.clone(),
            room,
            core,
        });
        (transport, events)
    }
}

// ============================================================================
// MEMORY TRANSPORT
// ============================================================================

/// Transport eines Mitglieds im [`MemoryHub`]
pub struct MemoryTransport {
    hub: MemoryHub,
    room: String,
    core: Arc<TransportCore>,
}

impl SignalingTransport for MemoryTransport {
    fn state(&self) -> TransportState {
        self.core.state()
    }

    fn send(&self, message: SignalingMessage) -> bool {
        self.core.send(&message)
    }

    fn close(&self) {
        if self.core.mark_closed("closed locally") {
            self.hub.leave(&self.room, &self.core);
        }
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.close();
    }
}

// ============================================================================
// TESTS
// ============================================================================
