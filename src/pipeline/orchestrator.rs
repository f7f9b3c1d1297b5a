//! Drives inbound messages from receipt to reply delivery
//!
//! Every transition is written to the message's status column before the
//! next side effect starts, so a restart picks up at the last checkpoint.
//! Adapter calls run outside any database transaction.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use super::locks::ConversationLocks;
use super::retry::RetryPolicy;
use super::state::PipelineState;
use crate::agent::CompletionProvider;
use crate::channels::{DeliveryReceipt, DispatchError, Dispatcher};
use crate::context::{ContextConfig, ContextManager};
use crate::db::{
    ConversationRepo, DbPool, DeliveryAttemptRepo, DeliveryStage, Message, MessageKind, MessageRepo, NewAttempt,
    Recorded,
};
use crate::error::{ErrorKind, Retryable};
use crate::ingest::{InboundEvent, InboundPayload};
use crate::voice::Transcriber;
use crate::{Error, Result};

/// Apology texts sent after a terminal failure
///
/// An empty text disables the apology for that case.
#[derive(Debug, Clone)]
pub struct FallbackReplies {
    /// Sent when a voice note could not be transcribed
    pub transcription: String,
    /// Sent for every other failure
    pub generic: String,
}

impl Default for FallbackReplies {
    fn default() -> Self {
        Self {
            transcription: "Sorry, I couldn't make out that voice note. Could you send it again or type your message?"
                .to_string(),
            generic: "Sorry, something went wrong on my side and I couldn't reply. Please try again in a moment."
                .to_string(),
        }
    }
}

impl FallbackReplies {
    /// No apologies
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            transcription: String::new(),
            generic: String::new(),
        }
    }

    fn text_for(&self, stage: DeliveryStage) -> &str {
        match stage {
            DeliveryStage::Transcription => &self.transcription,
            _ => &self.generic,
        }
    }
}

/// Where a pipeline run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The reply reached the participant
    Delivered,
    /// The event was a duplicate; nothing ran
    Ignored,
    /// Terminal failure; see the delivery attempts for the cause
    Failed,
    /// Stopped for shutdown at a persisted checkpoint
    Interrupted(PipelineState),
}

impl Outcome {
    const fn from_state(state: PipelineState) -> Self {
        match state {
            PipelineState::Delivered => Self::Delivered,
            PipelineState::Ignored => Self::Ignored,
            PipelineState::Failed => Self::Failed,
            other => Self::Interrupted(other),
        }
    }
}

/// Result of one retried adapter stage
enum StageResult<T, E> {
    Done(T),
    Failed(E),
    Interrupted,
}

/// Idempotency key of the reply to an inbound message
#[must_use]
pub fn reply_key(inbound_external_id: &str) -> String {
    format!("{inbound_external_id}:reply")
}

/// Idempotency key of the apology for an inbound message
#[must_use]
pub fn fallback_key(inbound_external_id: &str) -> String {
    format!("{inbound_external_id}:fallback")
}

/// Pipeline orchestrator
pub struct Orchestrator {
    messages: MessageRepo,
    conversations: ConversationRepo,
    attempts: DeliveryAttemptRepo,
    context: ContextManager,
    transcriber: Arc<dyn Transcriber>,
    completion: Arc<dyn CompletionProvider>,
    dispatcher: Arc<dyn Dispatcher>,
    retry: RetryPolicy,
    fallback: FallbackReplies,
    locks: ConversationLocks,
    shutdown: watch::Receiver<bool>,
}

impl Orchestrator {
    /// Create an orchestrator with default policies
    #[must_use]
    pub fn new(
        pool: DbPool,
        transcriber: Arc<dyn Transcriber>,
        completion: Arc<dyn CompletionProvider>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        let messages = MessageRepo::new(pool.clone());
        let conversations = ConversationRepo::new(pool.clone());
        let context = ContextManager::new(ContextConfig::default(), conversations.clone(), messages.clone());
        // Sender dropped: never signals shutdown
        let (_, shutdown) = watch::channel(false);

        Self {
            messages,
            conversations,
            attempts: DeliveryAttemptRepo::new(pool),
            context,
            transcriber,
            completion,
            dispatcher,
            retry: RetryPolicy::default(),
            fallback: FallbackReplies::default(),
            locks: ConversationLocks::new(),
            shutdown,
        }
    }

    /// Set the retry policy for adapter calls
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the context window configuration
    #[must_use]
    pub fn with_context_config(mut self, config: ContextConfig) -> Self {
        self.context = ContextManager::new(config, self.conversations.clone(), self.messages.clone());
        self
    }

    /// Set the apology texts
    #[must_use]
    pub fn with_fallback(mut self, fallback: FallbackReplies) -> Self {
        self.fallback = fallback;
        self
    }

    /// Stop at the next checkpoint once `shutdown` turns true
    #[must_use]
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Message repository
    #[must_use]
    pub const fn messages(&self) -> &MessageRepo {
        &self.messages
    }

    /// Delivery attempt repository
    #[must_use]
    pub const fn attempts(&self) -> &DeliveryAttemptRepo {
        &self.attempts
    }

    /// Conversation lock table
    #[must_use]
    pub const fn locks(&self) -> &ConversationLocks {
        &self.locks
    }

    /// Whether shutdown has been requested
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Durably record an inbound event
    ///
    /// `is_new == false` is the duplicate signal: the event was seen before
    /// and must not be processed again.
    ///
    /// # Errors
    ///
    /// Returns error if the write fails
    pub fn ingest(&self, event: &InboundEvent) -> Result<Recorded> {
        let recorded = self.messages.record_inbound(event)?;
        if recorded.is_new {
            tracing::info!(
                external_id = %event.external_id,
                kind = event.payload.kind_str(),
                "inbound message recorded"
            );
        } else {
            tracing::info!(
                external_id = %event.external_id,
                status = %recorded.message.status,
                "duplicate ignored"
            );
        }
        Ok(recorded)
    }

    /// Ingest an event and process it to completion
    ///
    /// Earlier unfinished messages of the same conversation are processed
    /// first, in arrival order.
    ///
    /// # Errors
    ///
    /// Returns error on persistence failure
    pub async fn handle(&self, event: &InboundEvent) -> Result<Outcome> {
        let recorded = self.ingest(event)?;
        if !recorded.is_new {
            return Ok(Outcome::Ignored);
        }

        let target = recorded.message;
        let _guard = self.locks.lock(&target.conversation_id).await;

        loop {
            let Some(next) = self.messages.next_pending_inbound(&target.conversation_id)? else {
                // Someone else already finished it
                let status = self
                    .messages
                    .get(&target.id)?
                    .map_or(PipelineState::Failed, |m| m.status);
                return Ok(Outcome::from_state(status));
            };

            let is_target = next.id == target.id;
            let outcome = self.process(next).await?;
            if is_target {
                return Ok(outcome);
            }
            if let Outcome::Interrupted(_) = outcome {
                let status = self
                    .messages
                    .get(&target.id)?
                    .map_or(PipelineState::Received, |m| m.status);
                return Ok(Outcome::Interrupted(status));
            }
        }
    }

    /// Process every unfinished inbound message of a conversation in order
    ///
    /// Returns the number of messages driven to a terminal state.
    ///
    /// # Errors
    ///
    /// Returns error on persistence failure
    pub async fn drive_conversation(&self, conversation_id: &str) -> Result<usize> {
        let _guard = self.locks.lock(conversation_id).await;
        let mut finished = 0;

        while let Some(next) = self.messages.next_pending_inbound(conversation_id)? {
            match self.process(next).await? {
                Outcome::Interrupted(_) => break,
                _ => finished += 1,
            }
        }

        Ok(finished)
    }

    /// Re-drive every conversation with unfinished messages
    ///
    /// # Errors
    ///
    /// Returns error on persistence failure
    pub async fn resume_all(&self) -> Result<usize> {
        let pending = self.messages.conversations_with_pending()?;
        if !pending.is_empty() {
            tracing::info!(conversations = pending.len(), "resuming unfinished messages");
        }

        let mut finished = 0;
        for conversation_id in pending {
            if self.is_shutting_down() {
                break;
            }
            finished += self.drive_conversation(&conversation_id).await?;
        }
        Ok(finished)
    }

    /// Drive one inbound message from its persisted state
    ///
    /// The caller must hold the conversation's lock.
    async fn process(&self, mut message: Message) -> Result<Outcome> {
        let mut state = message.status;
        tracing::debug!(external_id = %message.external_id, state = %state, "processing message");

        loop {
            if state.is_terminal() {
                return Ok(Outcome::from_state(state));
            }
            if self.is_shutting_down() {
                tracing::info!(external_id = %message.external_id, state = %state, "stopping at checkpoint");
                return Ok(Outcome::Interrupted(state));
            }

            state = match state {
                PipelineState::Received => self.advance(&message, state, PipelineState::DedupChecked)?,
                PipelineState::DedupChecked => self.route_by_kind(&mut message).await?,
                PipelineState::Transcribing => match self.transcribe(&mut message).await? {
                    Some(next) => next,
                    None => return Ok(Outcome::Interrupted(state)),
                },
                PipelineState::ContextBuilt => self.advance(&message, state, PipelineState::Completing)?,
                PipelineState::Completing => match self.complete(&message).await? {
                    Some(next) => next,
                    None => return Ok(Outcome::Interrupted(state)),
                },
                PipelineState::Delivering => match self.deliver(&message).await? {
                    Some(next) => next,
                    None => return Ok(Outcome::Interrupted(state)),
                },
                PipelineState::Delivered | PipelineState::Ignored | PipelineState::Failed => state,
            };
            message.status = state;
        }
    }

    fn advance(&self, message: &Message, from: PipelineState, to: PipelineState) -> Result<PipelineState> {
        if !from.can_transition_to(to) {
            return Err(Error::InvalidTransition { from, to });
        }
        self.messages.mark_status(&message.id, to)?;
        tracing::debug!(external_id = %message.external_id, from = %from, to = %to, "transition");
        Ok(to)
    }

    /// Text skips transcription; its transcript is the body itself
    async fn route_by_kind(&self, message: &mut Message) -> Result<PipelineState> {
        match message.payload() {
            Ok(InboundPayload::Text { body }) => {
                self.messages
                    .attach_transcript(&message.id, &body, PipelineState::ContextBuilt)?;
                tracing::debug!(
                    external_id = %message.external_id,
                    from = %PipelineState::DedupChecked,
                    to = %PipelineState::ContextBuilt,
                    "transition"
                );
                message.transcript = Some(body);
                Ok(PipelineState::ContextBuilt)
            }
            Ok(InboundPayload::Audio(_)) => {
                self.advance(message, PipelineState::DedupChecked, PipelineState::Transcribing)
            }
            Err(e) if !e.is_persistence() => {
                let stage = match message.kind {
                    MessageKind::Audio => DeliveryStage::Transcription,
                    MessageKind::Text => DeliveryStage::Completion,
                };
                self.fail(message, stage, ErrorKind::NonRetryable, &e).await
            }
            Err(e) => Err(e),
        }
    }

    async fn transcribe(&self, message: &mut Message) -> Result<Option<PipelineState>> {
        let audio = match message.payload() {
            Ok(InboundPayload::Audio(audio)) => audio,
            Ok(InboundPayload::Text { .. }) => {
                let err = Error::InvalidPayload("text message in transcription".to_string());
                return self
                    .fail(message, DeliveryStage::Transcription, ErrorKind::NonRetryable, &err)
                    .await
                    .map(Some);
            }
            Err(e) => return Err(e),
        };

        let transcriber = &self.transcriber;
        let audio = &audio;
        let result = self
            .with_retry(
                &message.id,
                &message.external_id,
                DeliveryStage::Transcription,
                move || transcriber.transcribe(audio),
                |_| None,
            )
            .await?;

        match result {
            StageResult::Done(text) => {
                self.messages
                    .attach_transcript(&message.id, &text, PipelineState::ContextBuilt)?;
                tracing::debug!(
                    external_id = %message.external_id,
                    chars = text.chars().count(),
                    from = %PipelineState::Transcribing,
                    to = %PipelineState::ContextBuilt,
                    "transition"
                );
                message.transcript = Some(text);
                Ok(Some(PipelineState::ContextBuilt))
            }
            StageResult::Failed(err) => self
                .fail(message, DeliveryStage::Transcription, err.kind(), &err)
                .await
                .map(Some),
            StageResult::Interrupted => Ok(None),
        }
    }

    async fn complete(&self, message: &Message) -> Result<Option<PipelineState>> {
        let context = match self.context.build_context_for(message) {
            Ok(context) => context,
            Err(e) if e.is_persistence() => return Err(e),
            Err(e) => {
                return self
                    .fail(message, DeliveryStage::Completion, ErrorKind::NonRetryable, &e)
                    .await
                    .map(Some);
            }
        };

        tracing::debug!(
            external_id = %message.external_id,
            turns = context.turns.len(),
            chars = context.char_count(),
            "context built"
        );

        let completion = &self.completion;
        let context = &context;
        let result = self
            .with_retry(
                &message.id,
                &message.external_id,
                DeliveryStage::Completion,
                move || completion.complete(context),
                |_| None,
            )
            .await?;

        match result {
            StageResult::Done(reply) => {
                let key = reply_key(&message.external_id);
                self.messages.record_reply(message, &key, &reply)?;
                tracing::debug!(
                    external_id = %message.external_id,
                    from = %PipelineState::Completing,
                    to = %PipelineState::Delivering,
                    "transition"
                );
                Ok(Some(PipelineState::Delivering))
            }
            StageResult::Failed(err) => self
                .fail(message, DeliveryStage::Completion, err.kind(), &err)
                .await
                .map(Some),
            StageResult::Interrupted => Ok(None),
        }
    }

    async fn deliver(&self, message: &Message) -> Result<Option<PipelineState>> {
        let key = reply_key(&message.external_id);
        let Some(reply) = self.messages.find_reply(&message.id, &key)? else {
            let err = Error::NotFound(format!("reply {key}"));
            return self
                .fail(message, DeliveryStage::Delivery, ErrorKind::NonRetryable, &err)
                .await
                .map(Some);
        };

        // Sent before a restart: record the outcome without sending again
        if reply.status == PipelineState::Delivered
            || self.attempts.find_success(&reply.id, DeliveryStage::Delivery)?.is_some()
        {
            self.messages.mark_statuses(&[
                (reply.id.as_str(), PipelineState::Delivered),
                (message.id.as_str(), PipelineState::Delivered),
            ])?;
            tracing::info!(external_id = %message.external_id, "reply already delivered");
            return Ok(Some(PipelineState::Delivered));
        }

        let participant = self.participant_of(message)?;
        let dispatcher = &self.dispatcher;
        let (participant_ref, text, key_ref) = (participant.as_str(), reply.raw_payload.as_str(), key.as_str());
        let result = self
            .with_retry(
                &reply.id,
                &message.external_id,
                DeliveryStage::Delivery,
                move || dispatcher.send(participant_ref, text, key_ref),
                |receipt: &DeliveryReceipt| Some(receipt.provider_message_id.clone()),
            )
            .await?;

        match result {
            StageResult::Done(receipt) => {
                self.messages.mark_statuses(&[
                    (reply.id.as_str(), PipelineState::Delivered),
                    (message.id.as_str(), PipelineState::Delivered),
                ])?;
                tracing::info!(
                    external_id = %message.external_id,
                    provider_message_id = %receipt.provider_message_id,
                    replayed = receipt.replayed,
                    "reply delivered"
                );
                Ok(Some(PipelineState::Delivered))
            }
            // Reply may have arrived: no resend, no apology
            StageResult::Failed(err @ DispatchError::Ambiguous(_)) => {
                self.messages.mark_statuses(&[
                    (reply.id.as_str(), PipelineState::Failed),
                    (message.id.as_str(), PipelineState::Failed),
                ])?;
                tracing::error!(
                    external_id = %message.external_id,
                    error = %err,
                    "delivery outcome unknown, not resending"
                );
                Ok(Some(PipelineState::Failed))
            }
            StageResult::Failed(err) => {
                self.messages.mark_status(&reply.id, PipelineState::Failed)?;
                self.fail(message, DeliveryStage::Delivery, err.kind(), &err)
                    .await
                    .map(Some)
            }
            StageResult::Interrupted => Ok(None),
        }
    }

    fn participant_of(&self, message: &Message) -> Result<String> {
        self.conversations
            .get(&message.conversation_id)?
            .map(|c| c.participant_id)
            .ok_or_else(|| Error::NotFound(format!("conversation {}", message.conversation_id)))
    }

    /// Run an adapter call under the retry policy, recording every attempt
    async fn with_retry<T, E, F, Fut>(
        &self,
        attempt_message_id: &str,
        external_id: &str,
        stage: DeliveryStage,
        mut call: F,
        provider_ref: impl Fn(&T) -> Option<String>,
    ) -> Result<StageResult<T, E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Retryable + Display,
    {
        let mut attempt: u32 = 1;
        let mut retry_after = None;

        loop {
            let delay = self.retry.delay_for_attempt(attempt, retry_after);
            if !delay.is_zero() && !self.backoff(delay).await {
                tracing::info!(external_id, stage = stage.as_str(), "backoff interrupted by shutdown");
                return Ok(StageResult::Interrupted);
            }

            match call().await {
                Ok(value) => {
                    let reference = provider_ref(&value);
                    let mut record = NewAttempt::success(attempt_message_id, stage, delay);
                    if let Some(ref r) = reference {
                        record = record.with_provider_ref(r);
                    }
                    self.attempts.record(&record)?;
                    tracing::debug!(external_id, stage = stage.as_str(), attempt, "attempt succeeded");
                    return Ok(StageResult::Done(value));
                }
                Err(err) => {
                    let kind = err.kind();
                    self.attempts.record(&NewAttempt::failure(
                        attempt_message_id,
                        stage,
                        delay,
                        kind,
                        err.to_string(),
                    ))?;

                    if !err.is_transient() || !self.retry.allows_retry(attempt) {
                        return Ok(StageResult::Failed(err));
                    }

                    tracing::warn!(
                        external_id,
                        stage = stage.as_str(),
                        attempt,
                        error = %err,
                        "transient failure, retrying"
                    );
                    retry_after = err.retry_after();
                    attempt += 1;
                }
            }
        }
    }

    /// Sleep for `delay`; false if shutdown was requested first
    async fn backoff(&self, delay: Duration) -> bool {
        if self.is_shutting_down() {
            return false;
        }
        let mut shutdown = self.shutdown.clone();
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        let stopped = tokio::select! {
            () = &mut sleep => return true,
            changed = shutdown.wait_for(|stop| *stop) => changed.is_ok(),
        };
        if stopped {
            return false;
        }

        // Sender gone: shutdown can no longer be requested
        sleep.await;
        true
    }

    /// Mark a message `FAILED` and send the apology
    async fn fail(
        &self,
        message: &Message,
        stage: DeliveryStage,
        kind: ErrorKind,
        cause: &(dyn Display + Sync),
    ) -> Result<PipelineState> {
        self.messages.mark_status(&message.id, PipelineState::Failed)?;
        tracing::warn!(
            external_id = %message.external_id,
            stage = stage.as_str(),
            error_kind = kind.as_str(),
            error = %cause,
            "pipeline failed"
        );

        if let Err(e) = self.send_fallback(message, stage).await {
            tracing::warn!(external_id = %message.external_id, error = %e, "fallback reply not sent");
        }
        Ok(PipelineState::Failed)
    }

    /// Best-effort apology; a single attempt that never touches the inbound status
    async fn send_fallback(&self, message: &Message, stage: DeliveryStage) -> Result<()> {
        let text = self.fallback.text_for(stage);
        if text.is_empty() {
            return Ok(());
        }

        let key = fallback_key(&message.external_id);
        let apology = self
            .messages
            .append_outbound(&message.conversation_id, &key, text, Some(&message.id))?;
        if apology.status.is_terminal() {
            return Ok(());
        }

        let participant = self.participant_of(message)?;
        match self.dispatcher.send(&participant, text, &key).await {
            Ok(receipt) => {
                self.attempts.record(
                    &NewAttempt::success(&apology.id, DeliveryStage::Fallback, Duration::ZERO)
                        .with_provider_ref(&receipt.provider_message_id),
                )?;
                self.messages.mark_status(&apology.id, PipelineState::Delivered)?;
                tracing::info!(external_id = %message.external_id, "fallback reply sent");
            }
            Err(err) => {
                self.attempts.record(&NewAttempt::failure(
                    &apology.id,
                    DeliveryStage::Fallback,
                    Duration::ZERO,
                    err.kind(),
                    err.to_string(),
                ))?;
                self.messages.mark_status(&apology.id, PipelineState::Failed)?;
                tracing::warn!(external_id = %message.external_id, error = %err, "fallback reply failed");
            }
        }
        Ok(())
    }
}
