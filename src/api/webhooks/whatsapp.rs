//! `WhatsApp` Cloud API webhook

use std::sync::Arc;

use axum::{Json, body::Bytes, extract::State, http::StatusCode};
use serde::Serialize;

use crate::api::ApiState;
use crate::channels::WhatsAppWebhook;

/// `WhatsApp` webhook response
#[derive(Debug, Default, Serialize)]
pub struct WebhookResponse {
    pub received: usize,
    pub duplicates: usize,
}

/// Handle a Cloud API callback
///
/// Status-only callbacks and unsupported message types are acknowledged.
/// Non-`WhatsApp` envelopes get 404 so misrouted senders notice.
pub async fn handle_webhook(State(state): State<Arc<ApiState>>, body: Bytes) -> (StatusCode, Json<WebhookResponse>) {
    let webhook: WhatsAppWebhook = match serde_json::from_slice(&body) {
        Ok(webhook) => webhook,
        Err(e) => {
            tracing::warn!(error = %e, "malformed WhatsApp webhook");
            return (StatusCode::BAD_REQUEST, Json(WebhookResponse::default()));
        }
    };

    if !webhook.is_whatsapp() {
        tracing::debug!(object = %webhook.object, "ignoring non-WhatsApp webhook");
        return (StatusCode::NOT_FOUND, Json(WebhookResponse::default()));
    }

    let mut response = WebhookResponse::default();
    for event in webhook.into_events() {
        match super::accept(&state, &event).await {
            Ok(recorded) if recorded.is_new => response.received += 1,
            Ok(_) => response.duplicates += 1,
            Err(e) => {
                // 5xx makes the platform redeliver; recorded events dedup
                tracing::error!(external_id = %event.external_id, error = %e, "failed to record event");
                return (StatusCode::INTERNAL_SERVER_ERROR, Json(response));
            }
        }
    }

    tracing::debug!(received = response.received, duplicates = response.duplicates, "WhatsApp webhook handled");
    (StatusCode::OK, Json(response))
}
