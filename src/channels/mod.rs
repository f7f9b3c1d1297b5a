//! Outbound delivery to messaging platforms
//!
//! Each platform implements the [`Dispatcher`] trait. Every send carries an
//! idempotency key (the outbound message's `external_id`) so that a retry
//! after an ambiguous failure never reaches the participant twice.

mod dedup;
mod whatsapp;

use std::time::Duration;

use async_trait::async_trait;

pub use dedup::{IdempotentDispatcher, ReceiptCache};
pub use whatsapp::{
    WhatsAppDispatcher, WhatsAppMessage, WhatsAppWebhook, WhatsAppWebhookChange, WhatsAppWebhookEntry,
    WhatsAppWebhookValue,
};

use crate::error::Retryable;

/// Proof that the platform accepted a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    /// Platform-assigned message id
    pub provider_message_id: String,
    /// Key the send was made with
    pub idempotency_key: String,
    /// True when the receipt came from an earlier send of the same key
    pub replayed: bool,
}

/// Delivery failure
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Too many sends; wait before retrying
    #[error("rate limited")]
    RateLimited {
        /// Platform or local limiter hint
        retry_after: Option<Duration>,
    },

    /// The recipient cannot receive messages; never retried
    #[error("recipient unreachable: {0}")]
    RecipientUnreachable(String),

    /// Network failure or platform outage before the platform saw the request
    #[error("dispatch unavailable: {0}")]
    Unavailable(String),

    /// The request may have been accepted but no acknowledgement arrived
    ///
    /// Never retried: a resend could reach the participant twice.
    #[error("delivery outcome unknown: {0}")]
    Ambiguous(String),
}

impl Retryable for DispatchError {
    fn is_transient(&self) -> bool {
        !matches!(self, Self::RecipientUnreachable(_) | Self::Ambiguous(_))
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Trait for outbound messaging adapters
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Platform name for logging
    fn name(&self) -> &'static str;

    /// Send a text message to a participant
    ///
    /// # Errors
    ///
    /// Returns `RateLimited` or `Unavailable` for transient failures,
    /// `RecipientUnreachable` when the recipient cannot be reached and
    /// `Ambiguous` when the request may have been accepted without a reply
    async fn send(
        &self,
        recipient: &str,
        text: &str,
        idempotency_key: &str,
    ) -> Result<DeliveryReceipt, DispatchError>;
}
