//! `WhatsApp` Cloud API adapter
//!
//! Inbound messages arrive through the webhook (see `api::webhooks`) and are
//! converted to [`InboundEvent`]s here. Replies go out through the Graph API
//! `/{phone_number_id}/messages` endpoint.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use governor::clock::{Clock, DefaultClock};
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use super::{DeliveryReceipt, DispatchError, Dispatcher};
use crate::ingest::{AudioRef, AudioSource, InboundEvent};
use crate::pipeline::retry::parse_retry_after;

/// Error codes meaning the recipient cannot be messaged
///
/// 131026 undeliverable, 131047 outside the 24h window, 131051 unsupported
/// message type for the recipient.
const RECIPIENT_ERROR_CODES: [i64; 3] = [131_026, 131_047, 131_051];

/// Object type of Cloud API webhook envelopes
pub const WHATSAPP_OBJECT: &str = "whatsapp_business_account";

type SendLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// `WhatsApp` reply dispatcher
pub struct WhatsAppDispatcher {
    client: Client,
    /// Graph API root including version
    graph_url: String,
    access_token: SecretString,
    phone_number_id: String,
    limiter: Arc<SendLimiter>,
    clock: DefaultClock,
}

impl WhatsAppDispatcher {
    /// Create a dispatcher
    ///
    /// # Arguments
    ///
    /// * `graph_url` - Graph API root including version, e.g. `https://graph.facebook.com/v21.0`
    /// * `access_token` - Cloud API access token
    /// * `phone_number_id` - Phone number ID registered with `WhatsApp` Business
    /// * `messages_per_second` - Outbound send budget
    #[must_use]
    pub fn new(
        client: Client,
        graph_url: impl Into<String>,
        access_token: SecretString,
        phone_number_id: impl Into<String>,
        messages_per_second: u32,
    ) -> Self {
        let rate = NonZeroU32::new(messages_per_second).unwrap_or(NonZeroU32::MIN);
        Self {
            client,
            graph_url: graph_url.into().trim_end_matches('/').to_string(),
            access_token,
            phone_number_id: phone_number_id.into(),
            limiter: Arc::new(RateLimiter::direct(Quota::per_second(rate))),
            clock: DefaultClock::default(),
        }
    }

    fn throttle(&self) -> Result<(), DispatchError> {
        self.limiter.check().map_err(|not_until| {
            let wait = not_until.wait_time_from(self.clock.now());
            tracing::debug!(wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX), "outbound throttled");
            DispatchError::RateLimited {
                retry_after: Some(wait),
            }
        })
    }
}

#[derive(Deserialize)]
struct SendResponse {
    #[serde(default)]
    messages: Vec<SentMessage>,
}

#[derive(Deserialize)]
struct SentMessage {
    id: String,
}

#[derive(Deserialize)]
struct GraphErrorEnvelope {
    error: GraphError,
}

#[derive(Deserialize)]
struct GraphError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

/// Map a transport error to a dispatch error
///
/// Only a failed connection proves the request never reached the platform.
/// Timeouts and broken responses may follow an accepted send.
fn classify_transport(e: reqwest::Error) -> DispatchError {
    if e.is_connect() || e.is_builder() {
        DispatchError::Unavailable(format!("WhatsApp API unreachable: {e}"))
    } else {
        DispatchError::Ambiguous(format!("WhatsApp API error: {e}"))
    }
}

/// Map a failed send to a dispatch error
fn classify_failure(status: StatusCode, retry_after: Option<Duration>, body: &str) -> DispatchError {
    let graph = serde_json::from_str::<GraphErrorEnvelope>(body).ok().map(|e| e.error);

    if let Some(ref err) = graph {
        if RECIPIENT_ERROR_CODES.contains(&err.code) {
            return DispatchError::RecipientUnreachable(format!("{}: {}", err.code, err.message));
        }
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        return DispatchError::RateLimited { retry_after };
    }
    if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        return DispatchError::Unavailable(format!("{status}"));
    }

    let detail = graph.map_or_else(|| format!("{status}"), |e| format!("{status} {}: {}", e.code, e.message));
    DispatchError::RecipientUnreachable(detail)
}

#[async_trait]
impl Dispatcher for WhatsAppDispatcher {
    fn name(&self) -> &'static str {
        "whatsapp"
    }

    async fn send(
        &self,
        recipient: &str,
        text: &str,
        idempotency_key: &str,
    ) -> Result<DeliveryReceipt, DispatchError> {
        self.throttle()?;

        let url = format!("{}/{}/messages", self.graph_url, self.phone_number_id);

        let body = serde_json::json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": recipient,
            "type": "text",
            "text": {
                "body": text,
                "preview_url": false
            },
            "biz_opaque_callback_data": idempotency_key
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(self.access_token.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = %status, "WhatsApp send failed");
            return Err(classify_failure(status, retry_after, &body));
        }

        // Accepted by the platform from here on
        let sent: SendResponse = response
            .json()
            .await
            .map_err(|e| DispatchError::Ambiguous(format!("unreadable WhatsApp response: {e}")))?;
        let provider_message_id = sent
            .messages
            .into_iter()
            .next()
            .map(|m| m.id)
            .ok_or_else(|| DispatchError::Ambiguous("WhatsApp response had no message id".to_string()))?;

        tracing::debug!(idempotency_key, provider_message_id = %provider_message_id, "WhatsApp message sent");

        Ok(DeliveryReceipt {
            provider_message_id,
            idempotency_key: idempotency_key.to_string(),
            replayed: false,
        })
    }
}

/// `WhatsApp` webhook payload from Cloud API
#[derive(Debug, Deserialize)]
pub struct WhatsAppWebhook {
    /// Always `whatsapp_business_account` for Cloud API callbacks
    pub object: String,
    /// Webhook entries
    #[serde(default)]
    pub entry: Vec<WhatsAppWebhookEntry>,
}

/// `WhatsApp` webhook entry
#[derive(Debug, Deserialize)]
pub struct WhatsAppWebhookEntry {
    /// Changes in this entry
    #[serde(default)]
    pub changes: Vec<WhatsAppWebhookChange>,
}

/// `WhatsApp` webhook change
#[derive(Debug, Deserialize)]
pub struct WhatsAppWebhookChange {
    /// The change value
    pub value: WhatsAppWebhookValue,
}

/// `WhatsApp` webhook value containing messages
#[derive(Debug, Deserialize)]
pub struct WhatsAppWebhookValue {
    /// Incoming messages (absent for status callbacks)
    pub messages: Option<Vec<WhatsAppMessage>>,
}

/// `WhatsApp` message
#[derive(Debug, Deserialize)]
pub struct WhatsAppMessage {
    /// Sender phone number
    pub from: String,
    /// Message ID
    pub id: String,
    /// Unix timestamp in seconds, as a string
    pub timestamp: String,
    /// Message type
    #[serde(rename = "type")]
    pub message_type: String,
    /// Text content (for text messages)
    pub text: Option<WhatsAppTextContent>,
    /// Audio content (voice notes and audio files)
    pub audio: Option<WhatsAppMedia>,
}

/// `WhatsApp` media object
#[derive(Debug, Deserialize)]
pub struct WhatsAppMedia {
    /// Media ID (use to fetch URL)
    pub id: String,
    /// MIME type
    pub mime_type: Option<String>,
}

/// `WhatsApp` text message content
#[derive(Debug, Deserialize)]
pub struct WhatsAppTextContent {
    /// Message body
    pub body: String,
}

impl WhatsAppWebhook {
    /// Whether this is a Cloud API envelope
    #[must_use]
    pub fn is_whatsapp(&self) -> bool {
        self.object == WHATSAPP_OBJECT
    }

    /// Convert the supported messages to inbound events
    ///
    /// Text and audio messages are kept; other types (images, reactions,
    /// stickers) and empty texts are skipped.
    #[must_use]
    pub fn into_events(self) -> Vec<InboundEvent> {
        self.entry
            .into_iter()
            .flat_map(|entry| entry.changes)
            .filter_map(|change| change.value.messages)
            .flatten()
            .filter_map(WhatsAppMessage::into_event)
            .collect()
    }
}

impl WhatsAppMessage {
    fn into_event(self) -> Option<InboundEvent> {
        let mut event = match self.message_type.as_str() {
            "text" => {
                let body = self.text?.body;
                if body.trim().is_empty() {
                    return None;
                }
                InboundEvent::text(self.id, self.from, body)
            }
            "audio" => {
                let audio = self.audio?;
                InboundEvent::audio(
                    self.id,
                    self.from,
                    AudioRef {
                        source: AudioSource::WhatsappMedia { media_id: audio.id },
                        mime_type: audio.mime_type,
                    },
                )
            }
            other => {
                tracing::debug!(message_type = other, "ignoring unsupported WhatsApp message type");
                return None;
            }
        };

        if let Some(ts) = self
            .timestamp
            .parse::<i64>()
            .ok()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        {
            event.timestamp = ts;
        }
        Some(event)
    }
}
