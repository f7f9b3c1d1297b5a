//! `OpenAI` chat completions backend

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::{CompletionError, CompletionProvider};
use crate::context::PromptContext;
use crate::pipeline::retry::is_recoverable_status;

/// Default ceiling on prompt characters accepted by the provider
pub const DEFAULT_MAX_CONTEXT_CHARS: usize = 48_000;

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ApiError,
}

#[derive(Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: Option<String>,
}

/// Generates replies with the chat completions API
pub struct OpenAiCompletion {
    client: Client,
    base_url: String,
    api_key: SecretString,
    model: String,
    temperature: f32,
    max_context_chars: usize,
}

impl OpenAiCompletion {
    /// Create a completion backend
    ///
    /// `base_url` is the API root, e.g. `https://api.openai.com/v1`.
    #[must_use]
    pub fn new(client: Client, base_url: impl Into<String>, api_key: SecretString, model: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
            temperature: 0.7,
            max_context_chars: DEFAULT_MAX_CONTEXT_CHARS,
        }
    }

    /// Set the sampling temperature
    #[must_use]
    pub const fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Set the largest prompt the backend will send
    #[must_use]
    pub const fn with_max_context_chars(mut self, max_context_chars: usize) -> Self {
        self.max_context_chars = max_context_chars;
        self
    }

    fn build_request<'a>(&'a self, context: &'a PromptContext) -> ChatRequest<'a> {
        let mut messages = Vec::with_capacity(context.turns.len() + 1);
        if let Some(system) = context.system_prompt.as_deref() {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        messages.extend(context.turns.iter().map(|turn| ChatMessage {
            role: turn.role.as_str(),
            content: &turn.content,
        }));

        ChatRequest {
            model: &self.model,
            messages,
            temperature: self.temperature,
        }
    }
}

/// Map a non-success response to a completion error
fn classify_failure(status: StatusCode, body: &str) -> CompletionError {
    if is_recoverable_status(status.as_u16()) {
        return CompletionError::Unavailable(format!("{status}"));
    }

    let (message, code) = serde_json::from_str::<ErrorEnvelope>(body)
        .map(|e| (e.error.message, e.error.code.unwrap_or_default()))
        .unwrap_or_default();

    match code.as_str() {
        "context_length_exceeded" => CompletionError::ContextTooLarge { chars: 0, limit: 0 },
        "content_policy_violation" | "content_filter" => CompletionError::ContentPolicyRejected(message),
        _ => CompletionError::Rejected(format!("{status}: {message}")),
    }
}

#[async_trait]
impl CompletionProvider for OpenAiCompletion {
    async fn complete(&self, context: &PromptContext) -> Result<String, CompletionError> {
        let chars = context.char_count()
            + context
                .system_prompt
                .as_deref()
                .map_or(0, |s| s.chars().count());
        if chars > self.max_context_chars {
            return Err(CompletionError::ContextTooLarge {
                chars,
                limit: self.max_context_chars,
            });
        }

        let request = self.build_request(context);
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, "completion request failed");
                CompletionError::Unavailable(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = %status, "completion API error");
            return Err(classify_failure(status, &body));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| CompletionError::Unavailable(format!("invalid completion response: {e}")))?;

        let Some(choice) = chat.choices.into_iter().next() else {
            return Err(CompletionError::Unavailable("no choices returned".to_string()));
        };

        if choice.finish_reason.as_deref() == Some("content_filter") {
            return Err(CompletionError::ContentPolicyRejected(
                "response withheld by content filter".to_string(),
            ));
        }

        let reply = choice.message.content.unwrap_or_default().trim().to_string();
        if reply.is_empty() {
            return Err(CompletionError::Unavailable("empty completion".to_string()));
        }

        tracing::debug!(model = %self.model, chars = reply.chars().count(), "completion received");
        Ok(reply)
    }
}
