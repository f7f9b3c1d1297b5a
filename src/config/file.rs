//! TOML configuration file loading
//!
//! Supports `~/.config/herald/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::Result;

/// Environment variable that points at an alternative config file
pub const CONFIG_PATH_ENV: &str = "HERALD_CONFIG";

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeraldConfigFile {
    #[serde(default)]
    pub server: ServerFileConfig,

    #[serde(default)]
    pub database: DatabaseFileConfig,

    #[serde(default)]
    pub whatsapp: WhatsAppFileConfig,

    #[serde(default)]
    pub openai: OpenAiFileConfig,

    #[serde(default)]
    pub pipeline: PipelineFileConfig,

    #[serde(default)]
    pub context: ContextFileConfig,

    #[serde(default)]
    pub conversations: ConversationsFileConfig,
}

/// HTTP server configuration
#[derive(Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    /// API server port
    pub port: Option<u16>,

    /// Token expected in the webhook verification handshake
    pub verify_token: Option<String>,

    /// Webhook requests per second (0 disables the limit)
    pub requests_per_second: Option<u32>,

    /// Seconds before shutdown warns about in-flight pipelines
    pub shutdown_grace_secs: Option<u64>,
}

/// Database configuration
#[derive(Debug, Default, Deserialize)]
pub struct DatabaseFileConfig {
    /// Path to the `SQLite` file
    pub path: Option<String>,
}

/// `WhatsApp` Cloud API configuration
#[derive(Debug, Default, Deserialize)]
pub struct WhatsAppFileConfig {
    pub access_token: Option<String>,
    pub phone_number_id: Option<String>,
    /// Graph API version (e.g. "v21.0")
    pub api_version: Option<String>,
    pub api_base_url: Option<String>,
    /// Outbound messages per second
    pub messages_per_second: Option<u32>,
}

/// `OpenAI` configuration (transcription and completion)
#[derive(Debug, Default, Deserialize)]
pub struct OpenAiFileConfig {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    /// STT model (e.g. "whisper-1")
    pub stt_model: Option<String>,
    /// Completion model (e.g. "gpt-4o-mini")
    pub model: Option<String>,
    /// ISO-639-1 transcription language hint
    pub language: Option<String>,
    pub temperature: Option<f32>,
    /// Prompt size the completion backend accepts before refusing
    pub max_context_chars: Option<usize>,
}

/// Retry and fallback configuration
#[derive(Debug, Default, Deserialize)]
pub struct PipelineFileConfig {
    pub max_attempts: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub backoff_factor: Option<f64>,
    pub jitter: Option<f64>,
    pub max_delay_ms: Option<u64>,
    /// Apology after a failed voice-note transcription ("" disables)
    pub fallback_transcription: Option<String>,
    /// Apology after any other failure ("" disables)
    pub fallback_generic: Option<String>,
}

/// Prompt context configuration
#[derive(Debug, Default, Deserialize)]
pub struct ContextFileConfig {
    pub max_turns: Option<usize>,
    pub max_chars: Option<usize>,
    pub system_prompt: Option<String>,
}

/// Conversation archival configuration
#[derive(Debug, Default, Deserialize)]
pub struct ConversationsFileConfig {
    /// Archive conversations idle longer than this many minutes
    pub idle_timeout_mins: Option<u64>,
    /// Minutes between archive sweeps
    pub sweep_interval_mins: Option<u64>,
}

/// Parse a config file body
///
/// # Errors
///
/// Returns error if the TOML is malformed or has unknown keys
pub fn parse_config_file(content: &str) -> Result<HeraldConfigFile> {
    Ok(toml::from_str(content)?)
}

/// Load the TOML config file from `path`
///
/// Returns `HeraldConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file_from(path: &Path) -> HeraldConfigFile {
    if !path.exists() {
        return HeraldConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match parse_config_file(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                HeraldConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            HeraldConfigFile::default()
        }
    }
}

/// Return the config file path: `$HERALD_CONFIG` or `~/.config/herald/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        return Some(PathBuf::from(path));
    }
    directories::BaseDirs::new().map(|d| d.config_dir().join("herald").join("config.toml"))
}
