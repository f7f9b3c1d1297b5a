//! Configuration management for Herald gateway
//!
//! Values resolve as env > TOML file > default.

pub mod file;

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::agent::DEFAULT_MAX_CONTEXT_CHARS;
use crate::context::ContextConfig;
use crate::pipeline::{FallbackReplies, RetryPolicy};
use crate::{Error, Result};

use file::HeraldConfigFile;

/// Default API server port
pub const DEFAULT_PORT: u16 = 18790;

/// Default Graph API root
pub const DEFAULT_GRAPH_BASE_URL: &str = "https://graph.facebook.com";

/// Default Graph API version
pub const DEFAULT_GRAPH_API_VERSION: &str = "v21.0";

/// Default `OpenAI` API root
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Herald gateway configuration
#[derive(Debug)]
pub struct Config {
    /// HTTP API server configuration
    pub server: ServerConfig,

    /// Path to the `SQLite` database
    pub database_path: PathBuf,

    /// `WhatsApp` Cloud API configuration
    pub whatsapp: WhatsAppConfig,

    /// Transcription and completion configuration
    pub openai: OpenAiConfig,

    /// Retry policy for adapter calls
    pub retry: RetryPolicy,

    /// Apology texts after terminal failures
    pub fallback: FallbackReplies,

    /// Prompt context window
    pub context: ContextConfig,

    /// Conversation archival
    pub conversations: ConversationsConfig,
}

/// HTTP API server configuration
#[derive(Debug)]
pub struct ServerConfig {
    /// Port to listen on
    pub port: u16,

    /// Token for the webhook verification handshake
    pub verify_token: Option<SecretString>,

    /// Webhook requests per second; 0 disables the limit
    pub requests_per_second: u32,

    /// How long in-flight pipelines run after shutdown before a warning
    pub shutdown_grace: Duration,
}

/// `WhatsApp` Cloud API configuration
#[derive(Debug)]
pub struct WhatsAppConfig {
    /// Cloud API access token
    pub access_token: Option<SecretString>,

    /// Phone number ID registered with `WhatsApp` Business
    pub phone_number_id: Option<String>,

    /// Graph API version (e.g. "v21.0")
    pub api_version: String,

    /// Graph API root without version
    pub api_base_url: String,

    /// Outbound messages per second
    pub messages_per_second: u32,
}

impl WhatsAppConfig {
    /// Graph API root including the version
    #[must_use]
    pub fn graph_url(&self) -> String {
        format!("{}/{}", self.api_base_url.trim_end_matches('/'), self.api_version)
    }
}

/// `OpenAI` configuration
#[derive(Debug)]
pub struct OpenAiConfig {
    /// API key for Whisper and chat completions
    pub api_key: Option<SecretString>,

    /// API root (e.g. `https://api.openai.com/v1`)
    pub base_url: String,

    /// STT model (e.g. "whisper-1")
    pub stt_model: String,

    /// Completion model (e.g. "gpt-4o-mini")
    pub model: String,

    /// ISO-639-1 transcription language hint
    pub language: Option<String>,

    /// Sampling temperature
    pub temperature: f32,

    /// Prompt characters the completion backend accepts (`ContextTooLarge` above)
    pub max_context_chars: usize,
}

/// Conversation archival configuration
#[derive(Debug, Clone)]
pub struct ConversationsConfig {
    /// Archive conversations idle longer than this
    pub idle_timeout: Duration,

    /// Time between archive sweeps
    pub sweep_interval: Duration,
}

impl Config {
    /// Load configuration from the environment and the config file
    ///
    /// # Errors
    ///
    /// Returns error if a value is out of range
    pub fn load() -> Result<Self> {
        let fc = file::config_file_path()
            .map(|path| file::load_config_file_from(&path))
            .unwrap_or_default();
        Self::from_sources(fc, |key| std::env::var(key).ok())
    }

    /// Build configuration from a parsed file and an env lookup
    ///
    /// # Errors
    ///
    /// Returns error if a value is out of range
    pub fn from_sources(fc: HeraldConfigFile, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        // Server config (env > toml > default)
        let server = ServerConfig {
            port: env_parse(&env, "HERALD_PORT")
                .or_else(|| env_parse(&env, "PORT"))
                .or(fc.server.port)
                .unwrap_or(DEFAULT_PORT),
            verify_token: env("HERALD_VERIFY_TOKEN")
                .or(fc.server.verify_token)
                .filter(|t| !t.is_empty())
                .map(SecretString::from),
            requests_per_second: env_parse(&env, "HERALD_REQUESTS_PER_SECOND")
                .or(fc.server.requests_per_second)
                .unwrap_or(50),
            shutdown_grace: Duration::from_secs(
                env_parse(&env, "HERALD_SHUTDOWN_GRACE_SECS")
                    .or(fc.server.shutdown_grace_secs)
                    .unwrap_or(30),
            ),
        };

        // Database lives in the platform data dir (~/.local/share/herald on Linux)
        let database_path = env("HERALD_DB_PATH")
            .or(fc.database.path)
            .map_or_else(default_database_path, PathBuf::from);

        let whatsapp = WhatsAppConfig {
            access_token: env("WHATSAPP_ACCESS_TOKEN")
                .or(fc.whatsapp.access_token)
                .filter(|t| !t.is_empty())
                .map(SecretString::from),
            phone_number_id: env("WHATSAPP_PHONE_NUMBER_ID").or(fc.whatsapp.phone_number_id),
            api_version: env("WHATSAPP_API_VERSION")
                .or(fc.whatsapp.api_version)
                .unwrap_or_else(|| DEFAULT_GRAPH_API_VERSION.to_string()),
            api_base_url: env("WHATSAPP_API_BASE_URL")
                .or(fc.whatsapp.api_base_url)
                .unwrap_or_else(|| DEFAULT_GRAPH_BASE_URL.to_string()),
            messages_per_second: env_parse(&env, "WHATSAPP_MESSAGES_PER_SECOND")
                .or(fc.whatsapp.messages_per_second)
                .unwrap_or(20),
        };

        let openai = OpenAiConfig {
            api_key: env("OPENAI_API_KEY")
                .or(fc.openai.api_key)
                .filter(|k| !k.is_empty())
                .map(SecretString::from),
            base_url: env("OPENAI_BASE_URL")
                .or(fc.openai.base_url)
                .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string()),
            stt_model: env("HERALD_STT_MODEL")
                .or(fc.openai.stt_model)
                .unwrap_or_else(|| "whisper-1".to_string()),
            model: env("HERALD_MODEL")
                .or(fc.openai.model)
                .unwrap_or_else(|| "gpt-4o-mini".to_string()),
            language: env("HERALD_STT_LANGUAGE").or(fc.openai.language),
            temperature: env_parse(&env, "HERALD_TEMPERATURE")
                .or(fc.openai.temperature)
                .unwrap_or(0.7),
            max_context_chars: env_parse(&env, "HERALD_MAX_CONTEXT_CHARS")
                .or(fc.openai.max_context_chars)
                .unwrap_or(DEFAULT_MAX_CONTEXT_CHARS),
        };

        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_attempts: env_parse(&env, "HERALD_MAX_ATTEMPTS")
                .or(fc.pipeline.max_attempts)
                .unwrap_or(defaults.max_attempts),
            base_delay: env_parse(&env, "HERALD_BASE_DELAY_MS")
                .or(fc.pipeline.base_delay_ms)
                .map_or(defaults.base_delay, Duration::from_millis),
            factor: fc.pipeline.backoff_factor.unwrap_or(defaults.factor),
            jitter: fc.pipeline.jitter.unwrap_or(defaults.jitter),
            max_delay: env_parse(&env, "HERALD_MAX_DELAY_MS")
                .or(fc.pipeline.max_delay_ms)
                .map_or(defaults.max_delay, Duration::from_millis),
        };
        validate_retry(&retry)?;

        let fallback_defaults = FallbackReplies::default();
        let fallback = FallbackReplies {
            transcription: env("HERALD_FALLBACK_TRANSCRIPTION")
                .or(fc.pipeline.fallback_transcription)
                .unwrap_or(fallback_defaults.transcription),
            generic: env("HERALD_FALLBACK_GENERIC")
                .or(fc.pipeline.fallback_generic)
                .unwrap_or(fallback_defaults.generic),
        };

        let context_defaults = ContextConfig::default();
        let context = ContextConfig {
            max_turns: env_parse(&env, "HERALD_MAX_TURNS")
                .or(fc.context.max_turns)
                .unwrap_or(context_defaults.max_turns),
            max_chars: env_parse(&env, "HERALD_MAX_CHARS")
                .or(fc.context.max_chars)
                .unwrap_or(context_defaults.max_chars),
            system_prompt: env("HERALD_SYSTEM_PROMPT")
                .or(fc.context.system_prompt)
                .filter(|p| !p.trim().is_empty()),
        };
        if context.max_turns == 0 || context.max_chars == 0 {
            return Err(Error::Config("context max_turns and max_chars must be positive".to_string()));
        }

        let conversations = ConversationsConfig {
            idle_timeout: minutes(
                env_parse(&env, "HERALD_IDLE_TIMEOUT_MINS")
                    .or(fc.conversations.idle_timeout_mins)
                    .unwrap_or(24 * 60),
            ),
            sweep_interval: minutes(
                env_parse(&env, "HERALD_SWEEP_INTERVAL_MINS")
                    .or(fc.conversations.sweep_interval_mins)
                    .unwrap_or(15)
                    .max(1),
            ),
        };

        Ok(Self {
            server,
            database_path,
            whatsapp,
            openai,
            retry,
            fallback,
            context,
            conversations,
        })
    }

    /// `WhatsApp` credentials needed to serve
    ///
    /// # Errors
    ///
    /// Returns error if the access token or phone number id is missing
    pub fn require_whatsapp(&self) -> Result<(&SecretString, &str)> {
        let token = self
            .whatsapp
            .access_token
            .as_ref()
            .ok_or_else(|| Error::Config("WHATSAPP_ACCESS_TOKEN not set".to_string()))?;
        let phone = self
            .whatsapp
            .phone_number_id
            .as_deref()
            .ok_or_else(|| Error::Config("WHATSAPP_PHONE_NUMBER_ID not set".to_string()))?;
        Ok((token, phone))
    }

    /// `OpenAI` key needed to serve
    ///
    /// # Errors
    ///
    /// Returns error if the key is missing
    pub fn require_openai_key(&self) -> Result<&SecretString> {
        self.openai
            .api_key
            .as_ref()
            .ok_or_else(|| Error::Config("OPENAI_API_KEY not set".to_string()))
    }
}

fn env_parse<T: FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = env(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, "ignoring unparseable environment value");
            None
        }
    }
}

const fn minutes(mins: u64) -> Duration {
    Duration::from_secs(mins * 60)
}

fn default_database_path() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from("herald.db"),
        |d| d.data_dir().join("herald").join("herald.db"),
    )
}

fn validate_retry(retry: &RetryPolicy) -> Result<()> {
    if retry.max_attempts == 0 {
        return Err(Error::Config("max_attempts must be at least 1".to_string()));
    }
    if !(1.0..=10.0).contains(&retry.factor) {
        return Err(Error::Config(format!("backoff_factor {} outside 1..=10", retry.factor)));
    }
    if !(0.0..=1.0).contains(&retry.jitter) {
        return Err(Error::Config(format!("jitter {} outside 0..=1", retry.jitter)));
    }
    if retry.base_delay > retry.max_delay {
        return Err(Error::Config("base delay exceeds max delay".to_string()));
    }
    Ok(())
}
