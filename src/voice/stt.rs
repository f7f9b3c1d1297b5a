//! `OpenAI` Whisper speech-to-text

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use super::{Transcriber, TranscriptionError};
use crate::ingest::AudioRef;
use crate::media::{MediaFetcher, extension_for_mime, is_supported_audio};
use crate::pipeline::retry::is_recoverable_status;

/// Response from the transcription endpoint
#[derive(Deserialize)]
struct WhisperResponse {
    text: String,
}

/// Transcribes voice notes with the Whisper API
pub struct WhisperTranscriber {
    client: Client,
    base_url: String,
    api_key: SecretString,
    model: String,
    language: Option<String>,
    fetcher: MediaFetcher,
}

impl WhisperTranscriber {
    /// Create a Whisper transcriber
    ///
    /// `base_url` is the API root, e.g. `https://api.openai.com/v1`.
    #[must_use]
    pub fn new(
        client: Client,
        base_url: impl Into<String>,
        api_key: SecretString,
        model: impl Into<String>,
        fetcher: MediaFetcher,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
            language: None,
            fetcher,
        }
    }

    /// Send an ISO-639-1 language hint with every request
    #[must_use]
    pub fn with_language(mut self, language: Option<String>) -> Self {
        self.language = language.filter(|l| !l.is_empty());
        self
    }

    async fn transcribe_bytes(&self, bytes: Vec<u8>, mime_type: &str) -> Result<String, TranscriptionError> {
        let filename = format!("audio.{}", extension_for_mime(mime_type));
        let part = Part::bytes(bytes)
            .file_name(filename)
            .mime_str(mime_type)
            .map_err(|e| TranscriptionError::UnsupportedAudioFormat(format!("{mime_type}: {e}")))?;

        let mut form = Form::new().text("model", self.model.clone()).part("file", part);
        if let Some(ref lang) = self.language {
            form = form.text("language", lang.clone());
        }

        let response = self
            .client
            .post(format!("{}/audio/transcriptions", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, "Whisper request failed");
                TranscriptionError::Unavailable(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = %status, "Whisper API error");
            return Err(classify_failure(status, &body));
        }

        let result: WhisperResponse = response
            .json()
            .await
            .map_err(|e| TranscriptionError::Unavailable(format!("invalid Whisper response: {e}")))?;

        let text = result.text.trim().to_string();
        if text.is_empty() {
            return Err(TranscriptionError::Rejected("empty transcript".to_string()));
        }
        Ok(text)
    }
}

/// Map a non-success Whisper status to a transcription error
fn classify_failure(status: StatusCode, body: &str) -> TranscriptionError {
    if is_recoverable_status(status.as_u16()) {
        return TranscriptionError::Unavailable(format!("{status}"));
    }

    let lower = body.to_lowercase();
    if status == StatusCode::BAD_REQUEST && (lower.contains("file format") || lower.contains("invalid file")) {
        return TranscriptionError::UnsupportedAudioFormat(format!("{status}"));
    }

    TranscriptionError::Rejected(format!("{status}"))
}

#[async_trait]
impl Transcriber for WhisperTranscriber {
    async fn transcribe(&self, audio: &AudioRef) -> Result<String, TranscriptionError> {
        if let Some(hint) = audio.mime_type.as_deref() {
            if !is_supported_audio(hint) {
                return Err(TranscriptionError::UnsupportedAudioFormat(hint.to_string()));
            }
        }

        let clip = self.fetcher.fetch(audio).await?;
        if !is_supported_audio(&clip.mime_type) {
            return Err(TranscriptionError::UnsupportedAudioFormat(clip.mime_type));
        }

        tracing::debug!(audio_bytes = clip.bytes.len(), mime_type = %clip.mime_type, "starting Whisper transcription");
        let text = self.transcribe_bytes(clip.bytes, &clip.mime_type).await?;
        tracing::debug!(chars = text.chars().count(), "transcription complete");
        Ok(text)
    }
}
