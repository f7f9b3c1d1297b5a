//! Voice note retrieval
//!
//! Resolves an [`AudioRef`](crate::ingest::AudioRef) to audio bytes and a
//! normalized MIME type the transcription backend accepts.

mod fetch;

pub use fetch::MediaFetcher;

/// Maximum audio size accepted for transcription (25MB)
pub const MAX_AUDIO_BYTES: usize = 25 * 1024 * 1024;

/// Downloaded audio ready for transcription
#[derive(Debug, Clone)]
pub struct AudioClip {
    pub bytes: Vec<u8>,
    /// Normalized MIME type, e.g. `audio/ogg`
    pub mime_type: String,
}

/// Media retrieval failure
#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    /// Network failure or upstream error status
    #[error("media unavailable: {0}")]
    Unavailable(String),

    /// Media id or URL no longer resolves
    #[error("media missing: {0}")]
    Missing(String),

    /// Download exceeds the size limit
    #[error("media too large: {size} bytes (limit {limit})")]
    TooLarge { size: usize, limit: usize },
}

/// Lowercase a MIME type and strip parameters such as `; codecs=opus`
#[must_use]
pub fn normalize_mime(mime_type: &str) -> String {
    mime_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Check if a MIME type is a supported audio format
///
/// Accepts raw values; parameters are ignored.
#[must_use]
pub fn is_supported_audio(mime_type: &str) -> bool {
    matches!(
        normalize_mime(mime_type).as_str(),
        "audio/ogg"
            | "audio/opus"
            | "audio/mpeg"
            | "audio/mp3"
            | "audio/mp4"
            | "audio/m4a"
            | "audio/x-m4a"
            | "audio/aac"
            | "audio/wav"
            | "audio/x-wav"
            | "audio/webm"
            | "audio/flac"
    )
}

/// File extension for an audio MIME type
#[must_use]
pub fn extension_for_mime(mime_type: &str) -> &'static str {
    match normalize_mime(mime_type).as_str() {
        "audio/mpeg" | "audio/mp3" => "mp3",
        "audio/mp4" | "audio/m4a" | "audio/x-m4a" | "audio/aac" => "m4a",
        "audio/wav" | "audio/x-wav" => "wav",
        "audio/webm" => "webm",
        "audio/flac" => "flac",
        _ => "ogg",
    }
}
