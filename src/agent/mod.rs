//! Reply generation
//!
//! The pipeline talks to the language model through [`CompletionProvider`].
//! Context windows are bounded by the caller; a provider refuses an
//! oversized context instead of cutting it down.

mod openai;

use async_trait::async_trait;

pub use openai::{DEFAULT_MAX_CONTEXT_CHARS, OpenAiCompletion};

use crate::context::PromptContext;
use crate::error::Retryable;

/// Completion failure
#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    /// Upstream outage or rate limit
    #[error("completion unavailable: {0}")]
    Unavailable(String),

    /// The model provider refused the content
    #[error("content policy rejected: {0}")]
    ContentPolicyRejected(String),

    /// The prompt exceeds what the provider accepts
    #[error("context too large: {chars} characters (limit {limit})")]
    ContextTooLarge { chars: usize, limit: usize },

    /// Any other permanent refusal (auth, bad request)
    #[error("completion rejected: {0}")]
    Rejected(String),
}

impl Retryable for CompletionError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Language model backend
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Generate a reply for the given context
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` for transient failures and
    /// `ContentPolicyRejected`, `ContextTooLarge` or `Rejected` otherwise
    async fn complete(&self, context: &PromptContext) -> Result<String, CompletionError>;
}
