//! Konfiguration
//!
//! Standardwerte, Builder-Setter und Overrides über Umgebungsvariablen.

use crate::signaling::{DEFAULT_DEGRADED_AFTER, DEFAULT_POLL_INTERVAL};
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const ENV_RELAY_URL: &str = "CLASSROOM_RELAY_URL";
pub const ENV_RELAY_TOKEN: &str = "CLASSROOM_RELAY_TOKEN";
pub const ENV_POLL_INTERVAL_MS: &str = "CLASSROOM_POLL_INTERVAL_MS";
pub const ENV_NEGOTIATION_TIMEOUT_MS: &str = "CLASSROOM_NEGOTIATION_TIMEOUT_MS";
pub const ENV_CAPTURE_POLICY: &str = "CLASSROOM_CAPTURE_POLICY";
pub const ENV_TURN_URL: &str = "CLASSROOM_TURN_URL";
pub const ENV_TURN_USERNAME: &str = "CLASSROOM_TURN_USERNAME";
pub const ENV_TURN_CREDENTIAL: &str = "CLASSROOM_TURN_CREDENTIAL";

/// Standard Relay URL für lokale Entwicklung
pub const DEFAULT_RELAY_URL: &str = "http://127.0.0.1:8787/";

/// Negotiation Timeout
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },

    #[error("Invalid relay URL: {0}")]
    InvalidUrl(String),
}

// ============================================================================
// TYPES
// ============================================================================

/// Verhalten wenn kein Mikrofon/keine Kamera verfügbar ist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CapturePolicy {
    /// `join` schlägt fehl
    #[default]
    RequireMedia,

    /// Beitritt ohne lokale Tracks
    ReceiveOnly,
}

impl CapturePolicy {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "require" | "require-media" => Some(Self::RequireMedia),
            "receive-only" | "receiveonly" => Some(Self::ReceiveOnly),
            _ => None,
        }
    }
}

/// Ein STUN/TURN Server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

/// Standard ICE Server (Google STUN)
pub fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![IceServerConfig {
        urls: vec![
            "stun:stun.l.google.com:19302".to_string(),
            "stun:stun1.l.google.com:19302".to_string(),
            "stun:stun2.l.google.com:19302".to_string(),
        ],
        username: None,
        credential: None,
    }]
}

// ============================================================================
// CLASSROOM CONFIG
// ============================================================================

#[derive(Debug, Clone)]
pub struct ClassroomConfig {
    pub relay_url: String,

    /// Bearer Token der einbettenden Anwendung
    pub bearer_token: Option<String>,

    pub poll_interval: Duration,

    /// Fehlgeschlagene Abrufe in Folge bis zum Degraded-Signal
    pub degraded_after: u32,

    /// `None` deaktiviert den Timeout
    pub negotiation_timeout: Option<Duration>,

    pub capture_policy: CapturePolicy,
    pub capture_video: bool,
    pub ice_servers: Vec<IceServerConfig>,
}

impl Default for ClassroomConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            bearer_token: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            degraded_after: DEFAULT_DEGRADED_AFTER,
            negotiation_timeout: Some(DEFAULT_NEGOTIATION_TIMEOUT),
            capture_policy: CapturePolicy::default(),
            capture_video: true,
            ice_servers: default_ice_servers(),
        }
    }
}

impl ClassroomConfig {
    pub fn new(relay_url: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            ..Default::default()
        }
    }

    /// Standardwerte, überschrieben durch `CLASSROOM_*` Umgebungsvariablen
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = lookup(ENV_RELAY_URL) {
            self.relay_url = url;
        }
        if let Some(token) = lookup(ENV_RELAY_TOKEN) {
            self.bearer_token = Some(token);
        }
        if let Some(value) = lookup(ENV_POLL_INTERVAL_MS) {
            let millis = parse_millis(ENV_POLL_INTERVAL_MS, &value)?;
            if millis == 0 {
                return Err(ConfigError::InvalidValue {
                    key: ENV_POLL_INTERVAL_MS,
                    value,
                });
            }
            self.poll_interval = Duration::from_millis(millis);
        }
        if let Some(value) = lookup(ENV_NEGOTIATION_TIMEOUT_MS) {
            self.negotiation_timeout = match parse_millis(ENV_NEGOTIATION_TIMEOUT_MS, &value)? {
                0 => None,
                millis => Some(Duration::from_millis(millis)),
            };
        }
        if let Some(value) = lookup(ENV_CAPTURE_POLICY) {
            self.capture_policy =
                CapturePolicy::parse(&value).ok_or(ConfigError::InvalidValue {
                    key: ENV_CAPTURE_POLICY,
                    value,
                })?;
        }
        if let Some(url) = lookup(ENV_TURN_URL) {
            self.ice_servers.push(IceServerConfig {
                urls: vec![url],
                username: lookup(ENV_TURN_USERNAME),
                credential: lookup(ENV_TURN_CREDENTIAL),
            });
        }

        tracing::debug!(relay_url = %self.relay_url, "Loaded classroom config");
        Ok(self)
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_degraded_after(mut self, failures: u32) -> Self {
        self.degraded_after = failures;
        self
    }

    pub fn with_negotiation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.negotiation_timeout = timeout;
        self
    }

    pub fn with_capture_policy(mut self, policy: CapturePolicy) -> Self {
        self.capture_policy = policy;
        self
    }

    pub fn with_video(mut self, enabled: bool) -> Self {
        self.capture_video = enabled;
        self
    }

    pub fn with_ice_servers(mut self, servers: Vec<IceServerConfig>) -> Self {
        self.ice_servers = servers;
        self
    }

    /// Fügt einen TURN Server hinzu (für Peers hinter symmetrischem NAT)
    pub fn with_turn_server(
        mut self,
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        self.ice_servers.push(IceServerConfig {
            urls: vec![url.into()],
            username: Some(username.into()),
            credential: Some(credential.into()),
        });
        self
    }

    pub fn relay_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.relay_url).map_err(|e| ConfigError::InvalidUrl(format!("{}: {}", self.relay_url, e)))
    }
}

fn parse_millis(key: &'static str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
    })
}

// ============================================================================
// TESTS
// ============================================================================
