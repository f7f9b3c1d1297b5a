//! Voice note transcription
//!
//! The pipeline only sees the [`Transcriber`] trait; [`WhisperTranscriber`]
//! is the production backend.

mod stt;

use async_trait::async_trait;

pub use stt::WhisperTranscriber;

use crate::error::Retryable;
use crate::ingest::AudioRef;
use crate::media::MediaError;

/// Transcription failure
#[derive(Debug, thiserror::Error)]
pub enum TranscriptionError {
    /// Upstream outage, rate limit, or the audio could not be downloaded
    #[error("transcription unavailable: {0}")]
    Unavailable(String),

    /// The audio format is not accepted by the backend
    #[error("unsupported audio format: {0}")]
    UnsupportedAudioFormat(String),

    /// The backend refused the request or produced nothing usable
    #[error("transcription rejected: {0}")]
    Rejected(String),
}

impl Retryable for TranscriptionError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<MediaError> for TranscriptionError {
    fn from(err: MediaError) -> Self {
        Self::Unavailable(err.to_string())
    }
}

/// Speech-to-text backend
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe a voice note to text
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` for transient failures and
    /// `UnsupportedAudioFormat` or `Rejected` for permanent ones
    async fn transcribe(&self, audio: &AudioRef) -> Result<String, TranscriptionError>;
}
