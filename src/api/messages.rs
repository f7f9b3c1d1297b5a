//! Message status lookup for monitoring

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::get,
};
use serde::Serialize;

use super::ApiState;
use crate::db::{DeliveryAttempt, Message};
use crate::pipeline::{fallback_key, reply_key};

/// Status of an inbound message and everything sent in answer to it
#[derive(Debug, Serialize)]
pub struct MessageStatusResponse {
    pub external_id: String,
    pub conversation_id: String,
    pub kind: &'static str,
    pub status: String,
    pub has_transcript: bool,
    pub created_at: String,
    pub updated_at: String,
    pub attempts: Vec<AttemptView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply: Option<OutboundView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback: Option<OutboundView>,
}

/// An outbound message
#[derive(Debug, Serialize)]
pub struct OutboundView {
    pub external_id: String,
    pub status: String,
    pub attempts: Vec<AttemptView>,
}

/// One recorded adapter call
#[derive(Debug, Serialize)]
pub struct AttemptView {
    pub stage: &'static str,
    pub attempt: u32,
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    pub delay_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_ref: Option<String>,
    pub timestamp: String,
}

impl From<DeliveryAttempt> for AttemptView {
    fn from(a: DeliveryAttempt) -> Self {
        Self {
            stage: a.stage.as_str(),
            attempt: a.attempt_number,
            outcome: a.outcome.as_str(),
            error_kind: a.error_kind,
            error_detail: a.error_detail,
            delay_ms: u64::try_from(a.delay.as_millis()).unwrap_or(u64::MAX),
            provider_ref: a.provider_ref,
            timestamp: a.timestamp.to_rfc3339(),
        }
    }
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn internal(e: &crate::Error) -> ApiError {
    tracing::error!(error = %e, "message lookup failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: "storage unavailable".to_string(),
        }),
    )
}

fn attempts_for(state: &ApiState, message_id: &str) -> crate::Result<Vec<AttemptView>> {
    Ok(state
        .attempts
        .list(message_id)?
        .into_iter()
        .map(AttemptView::from)
        .collect())
}

fn outbound_view(state: &ApiState, message: Option<Message>) -> crate::Result<Option<OutboundView>> {
    message
        .map(|m| {
            Ok(OutboundView {
                attempts: attempts_for(state, &m.id)?,
                external_id: m.external_id,
                status: m.status.to_string(),
            })
        })
        .transpose()
}

fn lookup(state: &ApiState, external_id: &str) -> crate::Result<Option<MessageStatusResponse>> {
    let Some(message) = state.messages.find_by_external_id(external_id)? else {
        return Ok(None);
    };

    let reply = outbound_view(state, state.messages.find_by_external_id(&reply_key(external_id))?)?;
    let fallback = outbound_view(state, state.messages.find_by_external_id(&fallback_key(external_id))?)?;

    Ok(Some(MessageStatusResponse {
        attempts: attempts_for(state, &message.id)?,
        external_id: message.external_id,
        conversation_id: message.conversation_id,
        kind: message.kind.as_str(),
        status: message.status.to_string(),
        has_transcript: message.transcript.is_some(),
        created_at: message.created_at.to_rfc3339(),
        updated_at: message.updated_at.to_rfc3339(),
        reply,
        fallback,
    }))
}

/// Get the pipeline status of an inbound message
async fn get_message(
    State(state): State<Arc<ApiState>>,
    Path(external_id): Path<String>,
) -> Result<Json<MessageStatusResponse>, ApiError> {
    match lookup(&state, &external_id) {
        Ok(Some(response)) => Ok(Json(response)),
        Ok(None) => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("message {external_id} not found"),
            }),
        )),
        Err(e) => Err(internal(&e)),
    }
}

/// Build messages router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/{external_id}", get(get_message))
        .with_state(state)
}
