//! Message Types für das Signaling-Protokoll
//!
//! Diese Strukturen spiegeln das JSON-Format der Relay-API wider
//! (`POST /signal`, `GET /signals/{meetingId}/{userId}`) und trennen
//! das Wire-Format vom typisierten [`SignalingEnvelope`].

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

// ============================================================================
// SIGNAL PAYLOADS
// ============================================================================

/// Art eines Signaling-Envelopes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    #[serde(rename = "ice-candidate")]
    Candidate,
}

/// ICE Candidate im Browser-kompatiblen `RTCIceCandidateInit` Format
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// Inhalt eines Signals (`signal` Feld auf dem Wire)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalPayload {
    Offer { sdp: String },
    Answer { sdp: String },
    IceCandidate { candidate: IceCandidate },
}

impl SignalPayload {
    pub fn kind(&self) -> SignalKind {
        match self {
            SignalPayload::Offer { .. } => SignalKind::Offer,
            SignalPayload::Answer { .. } => SignalKind::Answer,
            SignalPayload::IceCandidate { .. } => SignalKind::Candidate,
        }
    }

    /// Stabiler Fingerprint für Duplikat-Erkennung.
    ///
    /// Ohne Zeitstempel: das Relay kann dasselbe Signal mit anderem
    /// `createdAt` erneut ausliefern.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

// ============================================================================
// ENVELOPE
// ============================================================================

/// Ein typisiertes Signaling-Envelope zwischen zwei Teilnehmern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingEnvelope {
    pub from: String,
    pub to: String,
    pub meeting_id: String,
    pub payload: SignalPayload,
    pub sent_at: DateTime<Utc>,
}

impl SignalingEnvelope {
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        meeting_id: impl Into<String>,
        payload: SignalPayload,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            meeting_id: meeting_id.into(),
            payload,
            sent_at: Utc::now(),
        }
    }

    pub fn kind(&self) -> SignalKind {
        self.payload.kind()
    }
}

// ============================================================================
// CLIENT → RELAY
// ============================================================================

/// Body für `POST /signal`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostSignalRequest {
    pub meeting_id: String,
    pub from_user_id: String,
    pub to_user_id: String,
    pub signal: SignalPayload,
}

// ============================================================================
// RELAY → CLIENT
// ============================================================================

/// Ein vom Relay gespeichertes Signal.
///
/// `signal` bleibt hier untypisiert, damit ein einzelnes fehlerhaftes
/// Signal nicht die ganze Antwort unbrauchbar macht.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelaySignal {
    pub meeting_id: String,
    pub from_user_id: String,
    pub to_user_id: String,
    pub signal: Value,
    #[serde(default, alias = "sentAt", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<Value>,
}

impl RelaySignal {
    pub fn from_request(request: &PostSignalRequest, created_at: DateTime<Utc>) -> Self {
        Self {
            meeting_id: request.meeting_id.clone(),
            from_user_id: request.from_user_id.clone(),
            to_user_id: request.to_user_id.clone(),
            signal: serde_json::to_value(&request.signal).unwrap_or(Value::Null),
            created_at: Some(Value::String(created_at.to_rfc3339())),
        }
    }

    /// Wandelt das Wire-Format in ein [`SignalingEnvelope`] um.
    ///
    /// Fehlt ein lesbarer Zeitstempel, wird `received_at` verwendet.
    pub fn into_envelope(
        self,
        received_at: DateTime<Utc>,
    ) -> Result<SignalingEnvelope, serde_json::Error> {
        let payload: SignalPayload = serde_json::from_value(self.signal)?;
        let sent_at = self
            .created_at
            .as_ref()
            .and_then(parse_timestamp)
            .unwrap_or(received_at);

        Ok(SignalingEnvelope {
            from: self.from_user_id,
            to: self.to_user_id,
            meeting_id: self.meeting_id,
            payload,
            sent_at,
        })
    }
}

/// Antwort von `GET /signals/{meetingId}/{userId}`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignalsResponse {
    #[serde(default)]
    pub signals: Vec<RelaySignal>,
}

/// Akzeptiert RFC 3339 Strings und Unix-Millisekunden
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
        _ => None,
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_wire_tags() {
        let offer = serde_json::to_value(SignalPayload::Offer { sdp: "v=0".into() }).unwrap();
        assert_eq!(offer, json!({ "type": "offer", "sdp": "v=0" }));

        let candidate = serde_json::to_value(SignalPayload::IceCandidate {
            candidate: IceCandidate {
                candidate: "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            },
        })
        .unwrap();
        assert_eq!(candidate["type"], "ice-candidate");
        assert_eq!(candidate["candidate"]["sdpMid"], "0");
        assert_eq!(candidate["candidate"]["sdpMLineIndex"], 0);
        assert!(candidate["candidate"].get("usernameFragment").is_none());
    }

    #[test]
    fn test_post_request_matches_relay_contract() {
        let request = PostSignalRequest {
            meeting_id: "m1".into(),
            from_user_id: "alice".into(),
            to_user_id: "bob".into(),
            signal: SignalPayload::Answer { sdp: "v=0".into() },
        };
        let body = serde_json::to_value(&request).unwrap();
        assert_eq!(
            body,
            json!({
                "meetingId": "m1",
                "fromUserId": "alice",
                "toUserId": "bob",
                "signal": { "type": "answer", "sdp": "v=0" }
            })
        );
    }

    #[test]
    fn test_relay_signal_into_envelope() {
        let raw = json!({
            "meetingId": "m1",
            "fromUserId": "bob",
            "toUserId": "alice",
            "signal": { "type": "ice-candidate", "candidate": { "candidate": "c1" } },
            "sentAt": 1_700_000_000_000i64
        });
        let signal: RelaySignal = serde_json::from_value(raw).unwrap();
        let envelope = signal.into_envelope(Utc::now()).unwrap();

        assert_eq!(envelope.from, "bob");
        assert_eq!(envelope.kind(), SignalKind::Candidate);
        assert_eq!(envelope.sent_at.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn test_unknown_signal_type_is_rejected() {
        let signal = RelaySignal {
            meeting_id: "m1".into(),
            from_user_id: "bob".into(),
            to_user_id: "alice".into(),
            signal: json!({ "type": "hangup" }),
            created_at: None,
        };
        assert!(signal.into_envelope(Utc::now()).is_err());
    }

    #[test]
    fn test_fingerprint_ignores_timestamp() {
        let payload = SignalPayload::Offer { sdp: "v=0".into() };
        let first = SignalingEnvelope::new("bob", "alice", "m1", payload.clone());
        let mut second = first.clone();
        second.sent_at = first.sent_at + chrono::Duration::seconds(2);

        assert_eq!(first.payload.fingerprint(), second.payload.fingerprint());
        assert_ne!(
            payload.fingerprint(),
            SignalPayload::Answer { sdp: "v=0".into() }.fingerprint()
        );
    }
}
