//! HTTP Relay für Signaling-Nachrichten
//!
//! Das Deployment bietet keinen persistenten Socket, daher laufen alle
//! Signale über zwei REST-Endpunkte der externen API:
//! - `POST /signal` legt ein Signal für einen Teilnehmer ab
//! - `GET /signals/{meetingId}/{userId}` holt alle wartenden Signale ab

use super::messages::{PostSignalRequest, RelaySignal, SignalsResponse};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;
use url::Url;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("unexpected http status {0}")]
    HttpStatus(StatusCode),

    #[error("invalid relay url: {0}")]
    InvalidUrl(String),

    #[error("relay unavailable: {0}")]
    Unavailable(String),
}

// ============================================================================
// RELAY TRAIT
// ============================================================================

/// Grenze zur externen Signaling-API
#[async_trait]
pub trait SignalingRelay: Send + Sync {
    /// Legt ein Signal für `request.to_user_id` ab
    async fn post_signal(&self, request: &PostSignalRequest) -> Result<(), RelayError>;

    /// Holt alle Signale, die seit dem letzten Abruf für `user_id` anliegen
    async fn fetch_signals(
        &self,
        meeting_id: &str,
        user_id: &str,
    ) -> Result<Vec<RelaySignal>, RelayError>;
}

// ============================================================================
// HTTP RELAY
// ============================================================================

/// `reqwest`-basierte Implementierung mit Bearer-Token
pub struct HttpRelay {
    client: reqwest::Client,
    base_url: Url,
    bearer_token: Option<String>,
}

impl HttpRelay {
    /// Erstellt einen neuen Relay-Client
    pub fn new(base_url: Url, bearer_token: Option<String>) -> Result<Self, RelayError> {
        if base_url.cannot_be_a_base() {
            return Err(RelayError::InvalidUrl(base_url.to_string()));
        }
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(8))
            .build()?;
        Ok(Self {
            client,
            base_url,
            bearer_token,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Hängt Pfadsegmente an die Basis-URL an (IDs werden escaped)
    fn endpoint(&self, segments: &[&str]) -> Result<Url, RelayError> {
        let mut url = self.base_url.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| RelayError::InvalidUrl(self.base_url.to_string()))?;
            path.pop_if_empty();
            path.extend(segments);
        }
        Ok(url)
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.bearer_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

#[async_trait]
impl SignalingRelay for HttpRelay {
    async fn post_signal(&self, request: &PostSignalRequest) -> Result<(), RelayError> {
        let endpoint = self.endpoint(&["signal"])?;
        let response = self
            .authorize(self.client.post(endpoint))
            .json(request)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(RelayError::HttpStatus(response.status()));
        }
        Ok(())
    }

    async fn fetch_signals(
        &self,
        meeting_id: &str,
        user_id: &str,
    ) -> Result<Vec<RelaySignal>, RelayError> {
        let endpoint = self.endpoint(&["signals", meeting_id, user_id])?;
        let response = self.authorize(self.client.get(endpoint)).send().await?;
        if !response.status().is_success() {
            return Err(RelayError::HttpStatus(response.status()));
        }
        let payload = response.json::<SignalsResponse>().await?;
        Ok(payload.signals)
    }
}

impl std::fmt::Debug for HttpRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRelay")
            .field("base_url", &self.base_url.as_str())
            .field("has_token", &self.bearer_token.is_some())
            .finish()
    }
}
