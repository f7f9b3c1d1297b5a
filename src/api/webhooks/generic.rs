//! Platform-neutral webhook
//!
//! Accepts `{external_id, sender_id, kind, payload_url_or_text, timestamp}`.

use std::sync::Arc;

use axum::{Json, body::Bytes, extract::State, http::StatusCode};
use serde::Serialize;

use crate::api::ApiState;
use crate::ingest::WebhookEvent;

/// Generic webhook response
#[derive(Debug, Serialize)]
pub struct EventResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EventResponse {
    fn error(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            ok: false,
            external_id: None,
            status: None,
            error: Some(message.into()),
        })
    }
}

/// Handle a generic inbound event
///
/// 200 for a new event, 409 for an `external_id` already recorded, 400 for
/// a malformed body.
pub async fn handle_event(State(state): State<Arc<ApiState>>, body: Bytes) -> (StatusCode, Json<EventResponse>) {
    let event = match serde_json::from_slice::<WebhookEvent>(&body)
        .map_err(|e| crate::Error::InvalidPayload(e.to_string()))
        .and_then(WebhookEvent::validate)
    {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!(error = %e, "rejected webhook body");
            return (StatusCode::BAD_REQUEST, EventResponse::error(e.to_string()));
        }
    };

    match super::accept(&state, &event).await {
        Ok(recorded) => {
            let code = if recorded.is_new {
                StatusCode::OK
            } else {
                StatusCode::CONFLICT
            };
            (
                code,
                Json(EventResponse {
                    ok: recorded.is_new,
                    external_id: Some(event.external_id),
                    status: Some(recorded.message.status.to_string()),
                    error: None,
                }),
            )
        }
        Err(e) => {
            tracing::error!(external_id = %event.external_id, error = %e, "failed to record event");
            (StatusCode::INTERNAL_SERVER_ERROR, EventResponse::error("storage unavailable"))
        }
    }
}
