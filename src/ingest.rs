//! Inbound event types validated at the ingestion boundary
//!
//! Webhook bodies are parsed into [`InboundEvent`] before anything touches
//! the pipeline, so the state machine only ever sees a well-formed text or
//! audio event.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Where the bytes of a voice note can be fetched from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum AudioSource {
    /// Directly downloadable URL
    Url { url: String },
    /// `WhatsApp` Cloud API media id, resolved through the Graph API
    WhatsappMedia { media_id: String },
}

/// Reference to a voice note
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioRef {
    #[serde(flatten)]
    pub source: AudioSource,
    /// MIME type reported by the platform, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Message body, tagged by kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum InboundPayload {
    Text { body: String },
    Audio(AudioRef),
}

impl InboundPayload {
    /// Storage identifier of the payload kind
    #[must_use]
    pub const fn kind_str(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Audio(_) => "audio",
        }
    }
}

/// A validated inbound event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    /// Platform message id, globally unique
    pub external_id: String,
    /// Platform sender id (phone number, user id)
    pub sender_id: String,
    pub payload: InboundPayload,
    /// Time the platform reports the message was sent
    pub timestamp: DateTime<Utc>,
}

impl InboundEvent {
    /// Build a text event
    #[must_use]
    pub fn text(external_id: impl Into<String>, sender_id: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            external_id: external_id.into(),
            sender_id: sender_id.into(),
            payload: InboundPayload::Text { body: body.into() },
            timestamp: Utc::now(),
        }
    }

    /// Build an audio event
    #[must_use]
    pub fn audio(external_id: impl Into<String>, sender_id: impl Into<String>, audio: AudioRef) -> Self {
        Self {
            external_id: external_id.into(),
            sender_id: sender_id.into(),
            payload: InboundPayload::Audio(audio),
            timestamp: Utc::now(),
        }
    }
}

/// Timestamp as either unix seconds or an RFC 3339 string
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum WebhookTimestamp {
    Unix(i64),
    Text(String),
}

/// Generic webhook body
///
/// ```json
/// {"external_id": "m1", "sender_id": "u1", "kind": "text",
///  "payload_url_or_text": "hello", "timestamp": 1700000000}
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub external_id: String,
    pub sender_id: String,
    pub kind: String,
    pub payload_url_or_text: String,
    pub timestamp: WebhookTimestamp,
    /// Optional MIME type hint for audio
    #[serde(default)]
    pub mime_type: Option<String>,
}

impl WebhookEvent {
    /// Validate the body into an [`InboundEvent`]
    ///
    /// # Errors
    ///
    /// Returns `InvalidPayload` for empty ids, unknown kinds, empty text,
    /// non-http audio URLs, or unparseable timestamps
    pub fn validate(self) -> Result<InboundEvent> {
        let external_id = self.external_id.trim();
        if external_id.is_empty() {
            return Err(Error::InvalidPayload("external_id is empty".to_string()));
        }
        let sender_id = self.sender_id.trim();
        if sender_id.is_empty() {
            return Err(Error::InvalidPayload("sender_id is empty".to_string()));
        }

        let payload = match self.kind.as_str() {
            "text" => {
                if self.payload_url_or_text.trim().is_empty() {
                    return Err(Error::InvalidPayload("text body is empty".to_string()));
                }
                InboundPayload::Text {
                    body: self.payload_url_or_text,
                }
            }
            "audio" => {
                let parsed = url::Url::parse(self.payload_url_or_text.trim())
                    .map_err(|e| Error::InvalidPayload(format!("audio URL: {e}")))?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(Error::InvalidPayload(format!(
                        "audio URL scheme not supported: {}",
                        parsed.scheme()
                    )));
                }
                InboundPayload::Audio(AudioRef {
                    source: AudioSource::Url {
                        url: parsed.to_string(),
                    },
                    mime_type: self.mime_type,
                })
            }
            other => {
                return Err(Error::InvalidPayload(format!("unknown kind: {other}")));
            }
        };

        let timestamp = parse_timestamp(&self.timestamp)?;

        Ok(InboundEvent {
            external_id: external_id.to_string(),
            sender_id: sender_id.to_string(),
            payload,
            timestamp,
        })
    }
}

fn parse_timestamp(ts: &WebhookTimestamp) -> Result<DateTime<Utc>> {
    match ts {
        WebhookTimestamp::Unix(secs) => Utc
            .timestamp_opt(*secs, 0)
            .single()
            .ok_or_else(|| Error::InvalidPayload(format!("timestamp out of range: {secs}"))),
        WebhookTimestamp::Text(s) => {
            if let Ok(secs) = s.parse::<i64>() {
                return parse_timestamp(&WebhookTimestamp::Unix(secs));
            }
            DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| Error::InvalidPayload(format!("timestamp: {e}")))
        }
    }
}
