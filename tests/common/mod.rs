//! Shared test utilities

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use herald_gateway::agent::{CompletionError, CompletionProvider};
use herald_gateway::channels::{DeliveryReceipt, DispatchError, Dispatcher};
use herald_gateway::context::PromptContext;
use herald_gateway::ingest::{AudioRef, AudioSource, InboundEvent};
use herald_gateway::pipeline::{Orchestrator, RetryPolicy};
use herald_gateway::voice::{TranscriptionError, Transcriber};
use herald_gateway::{DbPool, db};
use tokio::time::Instant;

/// Set up an in-memory test database
#[must_use]
pub fn setup_test_db() -> DbPool {
    db::init_memory().expect("failed to init test db")
}

/// Audio event referencing a `WhatsApp` media id
pub fn audio_event(external_id: &str, sender: &str) -> InboundEvent {
    InboundEvent::audio(
        external_id,
        sender,
        AudioRef {
            source: AudioSource::WhatsappMedia {
                media_id: format!("media-{external_id}"),
            },
            mime_type: Some("audio/ogg; codecs=opus".to_string()),
        },
    )
}

/// Pop the next scripted result, or fall back to a default
fn next<T>(script: &Mutex<VecDeque<T>>) -> Option<T> {
    script.lock().unwrap_or_else(PoisonError::into_inner).pop_front()
}

/// Transcriber that replays scripted results, then succeeds
#[derive(Default)]
pub struct ScriptedTranscriber {
    script: Mutex<VecDeque<Result<String, TranscriptionError>>>,
    calls: Mutex<Vec<Instant>>,
}

impl ScriptedTranscriber {
    pub fn new(script: Vec<Result<String, TranscriptionError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Instants at which each call started
    pub fn calls(&self) -> Vec<Instant> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl Transcriber for ScriptedTranscriber {
    async fn transcribe(&self, _audio: &AudioRef) -> Result<String, TranscriptionError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Instant::now());
        next(&self.script).unwrap_or_else(|| Ok("transcribed voice note".to_string()))
    }
}

/// Completion provider that replays scripted results, then echoes the latest user turn
#[derive(Default)]
pub struct ScriptedCompletion {
    script: Mutex<VecDeque<Result<String, CompletionError>>>,
    contexts: Mutex<Vec<PromptContext>>,
}

impl ScriptedCompletion {
    pub fn new(script: Vec<Result<String, CompletionError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            contexts: Mutex::new(Vec::new()),
        }
    }

    /// Every context the provider was called with
    pub fn contexts(&self) -> Vec<PromptContext> {
        self.contexts.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn call_count(&self) -> usize {
        self.contexts.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[async_trait]
impl CompletionProvider for ScriptedCompletion {
    async fn complete(&self, context: &PromptContext) -> Result<String, CompletionError> {
        self.contexts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(context.clone());

        // Yield so concurrent conversations can interleave
        tokio::task::yield_now().await;

        next(&self.script).unwrap_or_else(|| {
            Ok(context
                .latest_user_turn()
                .map_or_else(|| "hello".to_string(), |t| format!("re: {}", t.content)))
        })
    }
}

/// A message handed to the dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sent {
    pub recipient: String,
    pub text: String,
    pub key: String,
}

/// Dispatcher that records sends and replays scripted failures
#[derive(Default)]
pub struct RecordingDispatcher {
    script: Mutex<VecDeque<Result<(), DispatchError>>>,
    sent: Mutex<Vec<Sent>>,
    fail_all: Option<fn() -> DispatchError>,
    lost_acks: Mutex<usize>,
}

impl RecordingDispatcher {
    pub fn new(script: Vec<Result<(), DispatchError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Self::default()
        }
    }

    /// Fail every send with the given error
    pub fn failing(error: fn() -> DispatchError) -> Self {
        Self {
            fail_all: Some(error),
            ..Self::default()
        }
    }

    /// Record the next `n` sends as sent, then time out waiting for the reply
    pub fn with_lost_acks(n: usize) -> Self {
        Self {
            lost_acks: Mutex::new(n),
            ..Self::default()
        }
    }

    /// Sends that reached the platform, in order
    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn sent_keys(&self) -> Vec<String> {
        self.sent().into_iter().map(|s| s.key).collect()
    }
}

#[async_trait]
impl Dispatcher for RecordingDispatcher {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn send(&self, recipient: &str, text: &str, idempotency_key: &str) -> Result<DeliveryReceipt, DispatchError> {
        if let Some(error) = self.fail_all {
            return Err(error());
        }
        next(&self.script).unwrap_or(Ok(()))?;

        let mut sent = self.sent.lock().unwrap_or_else(PoisonError::into_inner);
        sent.push(Sent {
            recipient: recipient.to_string(),
            text: text.to_string(),
            key: idempotency_key.to_string(),
        });

        let mut lost_acks = self.lost_acks.lock().unwrap_or_else(PoisonError::into_inner);
        if *lost_acks > 0 {
            *lost_acks -= 1;
            return Err(DispatchError::Ambiguous("timed out awaiting response".to_string()));
        }
        Ok(DeliveryReceipt {
            provider_message_id: format!("wamid.out.{}", sent.len()),
            idempotency_key: idempotency_key.to_string(),
            replayed: false,
        })
    }
}

/// Mock adapters shared between a test and its orchestrator
pub struct Adapters {
    pub transcriber: Arc<ScriptedTranscriber>,
    pub completion: Arc<ScriptedCompletion>,
    pub dispatcher: Arc<RecordingDispatcher>,
}

impl Default for Adapters {
    fn default() -> Self {
        Self::new(
            ScriptedTranscriber::default(),
            ScriptedCompletion::default(),
            RecordingDispatcher::default(),
        )
    }
}

impl Adapters {
    pub fn new(transcriber: ScriptedTranscriber, completion: ScriptedCompletion, dispatcher: RecordingDispatcher) -> Self {
        Self {
            transcriber: Arc::new(transcriber),
            completion: Arc::new(completion),
            dispatcher: Arc::new(dispatcher),
        }
    }

    /// Orchestrator over these adapters with deterministic backoff
    pub fn orchestrator(&self, db: DbPool) -> Orchestrator {
        Orchestrator::new(
            db,
            self.transcriber.clone(),
            self.completion.clone(),
            self.dispatcher.clone(),
        )
        .with_retry_policy(RetryPolicy::default().without_jitter())
    }
}
