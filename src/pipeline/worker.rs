//! Background worker that drives conversations woken by ingestion
//!
//! Webhook handlers record the event and wake the conversation; the worker
//! spawns one task per wake. Tasks of the same conversation serialize on the
//! orchestrator's conversation lock, so a second wake simply waits and finds
//! nothing left to do.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::Instrument;

use super::orchestrator::Orchestrator;

/// Pending wake-ups before senders start waiting
const WAKE_QUEUE_CAPACITY: usize = 1024;

/// Cloneable handle used to wake conversations
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    tx: mpsc::Sender<String>,
}

impl WorkerHandle {
    /// Ask the worker to drive a conversation
    ///
    /// Returns false once the worker has stopped; the message stays in the
    /// store and is picked up by the next resume.
    pub async fn wake(&self, conversation_id: &str) -> bool {
        self.tx.send(conversation_id.to_string()).await.is_ok()
    }
}

/// Conversation worker
pub struct Worker {
    orchestrator: Arc<Orchestrator>,
    rx: mpsc::Receiver<String>,
    shutdown: watch::Receiver<bool>,
    grace: Duration,
}

impl Worker {
    /// Create a worker and the handle that feeds it
    #[must_use]
    pub fn new(orchestrator: Arc<Orchestrator>, shutdown: watch::Receiver<bool>) -> (Self, WorkerHandle) {
        let (tx, rx) = mpsc::channel(WAKE_QUEUE_CAPACITY);
        let worker = Self {
            orchestrator,
            rx,
            shutdown,
            grace: Duration::from_secs(30),
        };
        (worker, WorkerHandle { tx })
    }

    /// How long in-flight pipelines may run after shutdown before a warning
    ///
    /// The worker keeps waiting past it; in-flight sends are never cancelled.
    #[must_use]
    pub const fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Run until shutdown, then wait for every in-flight pipeline
    ///
    /// Unfinished messages from a previous run are resumed first.
    pub async fn run(mut self) {
        let mut tasks = JoinSet::new();

        {
            let orchestrator = Arc::clone(&self.orchestrator);
            tasks.spawn(
                async move {
                    match orchestrator.resume_all().await {
                        Ok(0) => {}
                        Ok(finished) => tracing::info!(finished, "resume complete"),
                        Err(e) => tracing::error!(error = %e, "resume failed"),
                    }
                }
                .instrument(tracing::info_span!("resume")),
            );
        }

        tracing::info!("pipeline worker started");

        let mut shutdown_live = true;
        loop {
            tokio::select! {
                wake = self.rx.recv() => {
                    let Some(conversation_id) = wake else {
                        break;
                    };
                    let orchestrator = Arc::clone(&self.orchestrator);
                    let span = tracing::info_span!("conversation", conversation_id = %conversation_id);
                    tasks.spawn(
                        async move {
                            if let Err(e) = orchestrator.drive_conversation(&conversation_id).await {
                                tracing::error!(error = %e, "pipeline task failed");
                            }
                        }
                        .instrument(span),
                    );
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "pipeline task panicked");
                    }
                }
                changed = self.shutdown.changed(), if shutdown_live => {
                    match changed {
                        Ok(()) if *self.shutdown.borrow() => break,
                        Ok(()) => {}
                        // No sender left: only a closed wake queue stops the worker
                        Err(_) => shutdown_live = false,
                    }
                }
            }
        }

        self.rx.close();
        let in_flight = tasks.len();
        if in_flight > 0 {
            tracing::info!(in_flight, "waiting for pipelines to reach a checkpoint");
        }

        // Shutdown only stops new stages from starting
        let grace = tokio::time::sleep(self.grace);
        tokio::pin!(grace);
        let mut overdue = false;
        loop {
            tokio::select! {
                joined = tasks.join_next() => {
                    let Some(joined) = joined else {
                        break;
                    };
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "pipeline task panicked");
                    }
                }
                () = &mut grace, if !overdue => {
                    overdue = true;
                    tracing::warn!(
                        remaining = tasks.len(),
                        "grace period elapsed, still waiting for in-flight adapter calls"
                    );
                }
            }
        }

        tracing::info!("pipeline worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{CompletionError, CompletionProvider};
    use crate::channels::{DeliveryReceipt, DispatchError, Dispatcher};
    use crate::context::PromptContext;
    use crate::db::init_memory;
    use crate::ingest::{AudioRef, InboundEvent};
    use crate::pipeline::PipelineState;
    use crate::voice::{TranscriptionError, Transcriber};
    use async_trait::async_trait;

    struct NoTranscriber;

    #[async_trait]
    impl Transcriber for NoTranscriber {
        async fn transcribe(&self, _audio: &AudioRef) -> Result<String, TranscriptionError> {
            Err(TranscriptionError::UnsupportedAudioFormat("none".into()))
        }
    }

    struct Echo;

    #[async_trait]
    impl CompletionProvider for Echo {
        async fn complete(&self, context: &PromptContext) -> Result<String, CompletionError> {
            Ok(context
                .latest_user_turn()
                .map(|t| format!("echo: {}", t.content))
                .unwrap_or_default())
        }
    }

    struct Accept;

    #[async_trait]
    impl Dispatcher for Accept {
        fn name(&self) -> &'static str {
            "accept"
        }

        async fn send(&self, _recipient: &str, _text: &str, key: &str) -> Result<DeliveryReceipt, DispatchError> {
            Ok(DeliveryReceipt {
                provider_message_id: format!("sent-{key}"),
                idempotency_key: key.to_string(),
                replayed: false,
            })
        }
    }

    #[tokio::test]
    async fn test_wake_drives_conversation_and_stops_on_shutdown() {
        let pool = init_memory().unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let orchestrator = Arc::new(
            Orchestrator::new(pool, Arc::new(NoTranscriber), Arc::new(Echo), Arc::new(Accept))
                .with_shutdown(stop_rx.clone()),
        );

        let recorded = orchestrator
            .ingest(&InboundEvent::text("m1", "+15550001", "hello"))
            .unwrap();

        let (worker, handle) = Worker::new(Arc::clone(&orchestrator), stop_rx);
        let running = tokio::spawn(worker.run());
        assert!(handle.wake(&recorded.message.conversation_id).await);

        let mut status = PipelineState::Received;
        for _ in 0..100 {
            status = orchestrator.messages().get(&recorded.message.id).unwrap().unwrap().status;
            if status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, PipelineState::Delivered);

        stop_tx.send(true).unwrap();
        running.await.unwrap();
        assert!(!handle.wake("anything").await);
    }

    /// Signals when a send starts, then takes a while to be acknowledged
    struct SlowAccept {
        started: Arc<tokio::sync::Notify>,
    }

    #[async_trait]
    impl Dispatcher for SlowAccept {
        fn name(&self) -> &'static str {
            "slow"
        }

        async fn send(&self, _recipient: &str, _text: &str, key: &str) -> Result<DeliveryReceipt, DispatchError> {
            self.started.notify_one();
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(DeliveryReceipt {
                provider_message_id: format!("sent-{key}"),
                idempotency_key: key.to_string(),
                replayed: false,
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_past_grace_for_in_flight_send() {
        let pool = init_memory().unwrap();
        let started = Arc::new(tokio::sync::Notify::new());
        let (stop_tx, stop_rx) = watch::channel(false);
        let dispatcher = SlowAccept {
            started: Arc::clone(&started),
        };
        let orchestrator = Arc::new(
            Orchestrator::new(pool, Arc::new(NoTranscriber), Arc::new(Echo), Arc::new(dispatcher))
                .with_shutdown(stop_rx.clone()),
        );

        let recorded = orchestrator
            .ingest(&InboundEvent::text("m1", "+15550001", "hello"))
            .unwrap();

        let (worker, handle) = Worker::new(Arc::clone(&orchestrator), stop_rx);
        let running = tokio::spawn(worker.with_grace_period(Duration::from_millis(10)).run());
        assert!(handle.wake(&recorded.message.conversation_id).await);

        started.notified().await;
        stop_tx.send(true).unwrap();
        running.await.unwrap();

        let status = orchestrator.messages().get(&recorded.message.id).unwrap().unwrap().status;
        assert_eq!(status, PipelineState::Delivered);
        assert!(orchestrator.locks().is_empty());
    }
}
