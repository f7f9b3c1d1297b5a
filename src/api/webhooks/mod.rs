//! Webhook endpoints for inbound messages
//!
//! Handlers only validate and durably record events, then wake the worker;
//! the pipeline runs after the response is sent.

use std::sync::Arc;

use axum::{
    Router,
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
};
use secrecy::ExposeSecret;
use serde::Deserialize;

use super::ApiState;

pub mod generic;
pub mod whatsapp;

/// Build webhooks router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/webhook", get(verify).post(generic::handle_event))
        .route("/webhook/whatsapp", get(verify).post(whatsapp::handle_webhook))
        .with_state(state)
}

/// Subscription handshake parameters
#[derive(Debug, Deserialize)]
pub struct VerifyParams {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    pub verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
}

/// Answer the platform's subscription handshake
async fn verify(State(state): State<Arc<ApiState>>, Query(params): Query<VerifyParams>) -> (StatusCode, String) {
    let (Some(mode), Some(token), Some(challenge)) = (params.mode, params.verify_token, params.challenge) else {
        return (StatusCode::BAD_REQUEST, "missing hub parameters".to_string());
    };

    let expected = state.verify_token.as_ref().map(|t| t.expose_secret());
    if mode == "subscribe" && expected == Some(token.as_str()) {
        tracing::info!("webhook verified");
        (StatusCode::OK, challenge)
    } else {
        tracing::warn!(mode = %mode, "webhook verification rejected");
        (StatusCode::FORBIDDEN, "verification failed".to_string())
    }
}

/// Record one validated event and wake its conversation if it is new
pub(crate) async fn accept(state: &ApiState, event: &crate::ingest::InboundEvent) -> crate::Result<crate::db::Recorded> {
    let recorded = state.orchestrator.ingest(event)?;
    if recorded.is_new && !state.worker.wake(&recorded.message.conversation_id).await {
        tracing::warn!(external_id = %event.external_id, "worker stopped, message left for resume");
    }
    Ok(recorded)
}
