//! Konfiguration des Call Clients
//!
//! Standardwerte plus Überschreibung per Umgebungsvariablen.

use crate::call_engine::{default_ice_servers, CallRole, IceServer};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Standard Signaling Server
pub const DEFAULT_SIGNALING_URL: &str = "ws://localhost:8080/signal";

/// Wie lange `start()` auf die Signaling-Verbindung wartet
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid URL in {var}: {source}")]
    InvalidUrl {
        var: &'static str,
        #[source]
        source: url::ParseError,
    },

    #[error("Invalid value for {var}: '{value}'")]
    InvalidValue { var: &'static str, value: String },

    #[error("Invalid ICE server list: {0}")]
    InvalidIceServers(#[from] serde_json::Error),

    #[error("Signaling URL cannot carry a room path: {0}")]
    NotABase(String),
}

// ============================================================================
// CALL CONFIG
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct CallConfig {
    /// Basis-URL des Rendezvous-Servers
    pub signaling_url: String,
    pub ice_servers: Vec<IceServer>,
    pub open_timeout: Duration,
    /// Ping-Intervall der WebSocket-Verbindung
    pub keepalive: Duration,
    /// Kamera anfragen (cpal kann nur Audio)
    pub video: bool,
    /// Rolle für `CallEngine::start`
    pub role: CallRole,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            ice_servers: default_ice_servers(),
            open_timeout: DEFAULT_OPEN_TIMEOUT,
            keepalive: crate::signaling::DEFAULT_KEEPALIVE,
            video: false,
            role: CallRole::Initiator,
        }
    }
}

impl CallConfig {
    /// Lädt die Konfiguration aus den Umgebungsvariablen
    ///
    /// - `SIGNALING_URL`
    /// - `ICE_SERVERS`: JSON-Liste oder kommagetrennte URLs
    /// - `TURN_URL`, `TURN_USERNAME`, `TURN_CREDENTIAL`
    /// - `SIGNALING_OPEN_TIMEOUT_MS`, `SIGNALING_KEEPALIVE_SECS`
    /// - `CALL_VIDEO`, `CALL_ROLE`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(value) = lookup("SIGNALING_URL") {
            parse_url(&value)?;
            config.signaling_url = value;
        }

        if let Some(value) = lookup("ICE_SERVERS") {
            config.ice_servers = parse_ice_servers(&value)?;
        }

        if let Some(url) = lookup("TURN_URL") {
            config.add_turn_server(
                url,
                lookup("TURN_USERNAME").unwrap_or_default(),
                lookup("TURN_CREDENTIAL").unwrap_or_default(),
            );
        }

        if let Some(value) = lookup("SIGNALING_OPEN_TIMEOUT_MS") {
            config.open_timeout =
                Duration::from_millis(parse_number("SIGNALING_OPEN_TIMEOUT_MS", &value)?);
        }

        if let Some(value) = lookup("SIGNALING_KEEPALIVE_SECS") {
            config.keepalive =
                Duration::from_secs(parse_number("SIGNALING_KEEPALIVE_SECS", &value)?);
        }

        if let Some(value) = lookup("CALL_VIDEO") {
            config.video = parse_flag("CALL_VIDEO", &value)?;
        }

        if let Some(value) = lookup("CALL_ROLE") {
            config.role = value.parse().map_err(|_| ConfigError::InvalidValue {
                var: "CALL_ROLE",
                value,
            })?;
        }

        Ok(config)
    }

    /// Fügt einen TURN-Server mit Credentials hinzu
    pub fn add_turn_server(&mut self, url: String, username: String, credential: String) {
        self.ice_servers.push(IceServer {
            urls: vec![url],
            username,
            credential,
        });
    }

    /// Signaling-Endpunkt eines Raums: `{signaling_url}/rooms/{room}?user={user}`
    pub fn endpoint(&self, room_id: &str, user_id: &str) -> Result<Url, ConfigError> {
        let mut url = parse_url(&self.signaling_url)?;
        url.path_segments_mut()
            .map_err(|_| ConfigError::NotABase(self.signaling_url.clone()))?
            .pop_if_empty()
            .push("rooms")
            .push(room_id);
        url.query_pairs_mut().clear().append_pair("user", user_id);
        Ok(url)
    }
}

fn parse_url(value: &str) -> Result<Url, ConfigError> {
    Url::parse(value).map_err(|source| ConfigError::InvalidUrl {
        var: "SIGNALING_URL",
        source,
    })
}

fn parse_ice_servers(value: &str) -> Result<Vec<IceServer>, ConfigError> {
    let value = value.trim();
    if value.starts_with('[') {
        return Ok(serde_json::from_str(value)?);
    }

    let urls: Vec<String> = value
        .split(',')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(str::to_string)
        .collect();
    if urls.is_empty() {
        return Ok(Vec::new());
    }
    Ok(vec![IceServer {
        urls,
        ..Default::default()
    }])
}

fn parse_number(var: &'static str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        var,
        value: value.to_string(),
    })
}

fn parse_flag(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            var,
            value: value.to_string(),
        }),
    }
}

// ============================================================================
// TESTS
// ============================================================================
