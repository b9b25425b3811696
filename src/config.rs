// Session configuration.
// Logging is on by default only in debug builds.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true;

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false;

/// Default negotiation deadline, measured from `ChannelConnecting`
pub const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a transient disconnect may last before the session fails
pub const GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Chunk payload size used when the data channel limit is not configured
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024;

/// Upper bound on a single reassembled inbound payload
pub const DEFAULT_MAX_REASSEMBLY_BYTES: usize = 64 * 1024 * 1024;

/// ICE server entry
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub id: String,
    pub r#type: String, // 'stun' or 'turn'
    pub url: String,
    pub username: Option<String>,
    pub credential: Option<String>,
}

/// Logging switches, see [`crate::logger::init_logging`]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub enabled: bool,
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: LOGGING_ENABLED,
            level: "info".into(),
        }
    }
}

/// Everything a negotiation session needs besides its collaborators
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct NegotiatorConfig {
    /// WebSocket signaling relay (ws:// or wss://)
    pub signaling_url: String,

    pub ice_servers: Vec<ServerConfig>,

    /// Deadline from `ChannelConnecting` to `Connected`
    #[serde(with = "duration_secs")]
    pub negotiation_timeout: Duration,

    /// Transient `Disconnected` tolerance once connected
    #[serde(with = "duration_secs")]
    pub disconnect_grace_period: Duration,

    /// Label of the data channel the initiator opens; `None` disables it
    pub data_channel_label: Option<String>,

    /// Track id of an Opus audio track to attach; `None` for data only
    pub audio_track: Option<String>,

    /// Largest chunk payload per data-channel message; `None` sends unchunked
    pub max_message_size: Option<usize>,

    /// Cap on the bytes buffered for one inbound payload
    pub max_reassembly_bytes: usize,

    pub logging: LoggingConfig,
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self {
            signaling_url: "ws://127.0.0.1:8080".into(),
            ice_servers: default_ice_servers(),
            negotiation_timeout: NEGOTIATION_TIMEOUT,
            disconnect_grace_period: GRACE_PERIOD,
            data_channel_label: Some("payload".into()),
            audio_track: None,
            max_message_size: Some(DEFAULT_MAX_MESSAGE_SIZE),
            max_reassembly_bytes: DEFAULT_MAX_REASSEMBLY_BYTES,
            logging: LoggingConfig::default(),
        }
    }
}

impl NegotiatorConfig {
    /// Rejects settings the session cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.signaling_url.is_empty() {
            return Err(Error::InvalidConfig("signaling URL cannot be empty".into()));
        }
        if self.max_message_size == Some(0) {
            return Err(Error::InvalidConfig("max_message_size must be non-zero".into()));
        }
        if self.negotiation_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "negotiation_timeout must be non-zero".into(),
            ));
        }
        validate_ice_servers(&self.ice_servers)
    }
}

/// Google STUN servers used when nothing else is configured
pub fn default_ice_servers() -> Vec<ServerConfig> {
    vec![
        ServerConfig {
            id: "default-stun".into(),
            r#type: "stun".into(),
            url: "stun:stun.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
        ServerConfig {
            id: "default-stun-1".into(),
            r#type: "stun".into(),
            url: "stun:stun1.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
    ]
}

pub fn validate_ice_servers(servers: &[ServerConfig]) -> Result<()> {
    for server in servers {
        if server.url.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "ICE server {} has an empty URL",
                server.id
            )));
        }

        match server.r#type.as_str() {
            "stun" => {}
            "turn" => {
                if server.username.is_none() || server.credential.is_none() {
                    return Err(Error::InvalidConfig(format!(
                        "TURN server {} requires username and credential",
                        server.id
                    )));
                }
            }
            other => {
                return Err(Error::InvalidConfig(format!(
                    "ICE server {} has unknown type '{}'",
                    server.id, other
                )))
            }
        }
    }
    Ok(())
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
