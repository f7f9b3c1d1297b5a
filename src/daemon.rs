//! Daemon - the main gateway service
//!
//! Wires the store, adapters, pipeline worker, archiver, and HTTP server,
//! and coordinates graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::agent::OpenAiCompletion;
use crate::api::ApiServerBuilder;
use crate::channels::{IdempotentDispatcher, WhatsAppDispatcher};
use crate::db::{self, ConversationRepo, DbPool};
use crate::media::MediaFetcher;
use crate::pipeline::{Orchestrator, Worker};
use crate::voice::WhisperTranscriber;
use crate::{Config, Error, Result};

/// Timeout for a single upstream HTTP call
const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// The Herald daemon
pub struct Daemon {
    config: Config,
    db: DbPool,
}

impl Daemon {
    /// Create a new daemon instance
    ///
    /// # Errors
    ///
    /// Returns error if the database cannot be opened
    pub fn new(config: Config) -> Result<Self> {
        let db = db::init(&config.database_path)?;
        tracing::info!(path = %config.database_path.display(), "database opened");
        Ok(Self { config, db })
    }

    /// Database pool
    #[must_use]
    pub const fn db(&self) -> &DbPool {
        &self.db
    }

    /// Build the orchestrator with the production adapters
    ///
    /// # Errors
    ///
    /// Returns error if credentials are missing or the HTTP client cannot be built
    pub fn orchestrator(&self, shutdown: watch::Receiver<bool>) -> Result<Orchestrator> {
        let (access_token, phone_number_id) = self.config.require_whatsapp()?;
        let openai_key = self.config.require_openai_key()?;

        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {e}")))?;

        let graph_url = self.config.whatsapp.graph_url();
        let fetcher = MediaFetcher::new(client.clone(), graph_url.clone(), Some(copy_secret(access_token)));

        let openai = &self.config.openai;
        let transcriber = WhisperTranscriber::new(
            client.clone(),
            openai.base_url.clone(),
            copy_secret(openai_key),
            openai.stt_model.clone(),
            fetcher,
        )
        .with_language(openai.language.clone());

        let completion = OpenAiCompletion::new(
            client.clone(),
            openai.base_url.clone(),
            copy_secret(openai_key),
            openai.model.clone(),
        )
        .with_temperature(openai.temperature)
        .with_max_context_chars(openai.max_context_chars);

        let dispatcher = IdempotentDispatcher::new(WhatsAppDispatcher::new(
            client,
            graph_url,
            copy_secret(access_token),
            phone_number_id,
            self.config.whatsapp.messages_per_second,
        ));

        tracing::info!(
            stt_model = %openai.stt_model,
            model = %openai.model,
            phone_number_id,
            "adapters configured"
        );

        Ok(Orchestrator::new(
            self.db.clone(),
            Arc::new(transcriber),
            Arc::new(completion),
            Arc::new(dispatcher),
        )
        .with_retry_policy(self.config.retry.clone())
        .with_context_config(self.config.context.clone())
        .with_fallback(self.config.fallback.clone())
        .with_shutdown(shutdown))
    }

    /// Re-drive unfinished messages once
    ///
    /// Ctrl-C stops at the next checkpoint.
    ///
    /// # Errors
    ///
    /// Returns error if adapters cannot be configured or the store fails
    pub async fn resume_once(&self) -> Result<usize> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let orchestrator = self.orchestrator(shutdown_rx)?;

        let signal = tokio::spawn(async move {
            shutdown_signal().await;
            shutdown_tx.send_replace(true);
        });

        let finished = orchestrator.resume_all().await;
        signal.abort();
        finished
    }

    /// Archive idle conversations once
    ///
    /// # Errors
    ///
    /// Returns error if the store fails
    pub fn archive_once(&self) -> Result<usize> {
        archive_idle(&ConversationRepo::new(self.db.clone()), self.config.conversations.idle_timeout)
    }

    /// Serve until SIGINT/SIGTERM
    ///
    /// # Errors
    ///
    /// Returns error if initialization or the server fails
    pub async fn run(mut self) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let orchestrator = Arc::new(self.orchestrator(shutdown_rx.clone())?);

        let (worker, handle) = Worker::new(Arc::clone(&orchestrator), shutdown_rx.clone());
        let worker_task = tokio::spawn(worker.with_grace_period(self.config.server.shutdown_grace).run());

        let archiver = spawn_archiver(
            ConversationRepo::new(self.db.clone()),
            self.config.conversations.idle_timeout,
            self.config.conversations.sweep_interval,
            shutdown_rx.clone(),
        );

        let server = ApiServerBuilder::new(self.db.clone(), orchestrator, handle)
            .port(self.config.server.port)
            .verify_token(self.config.server.verify_token.take())
            .requests_per_second(self.config.server.requests_per_second)
            .build();

        let shutdown_tx = Arc::new(shutdown_tx);
        let signal_tx = Arc::clone(&shutdown_tx);
        let signal = tokio::spawn(async move {
            shutdown_signal().await;
            tracing::info!("shutdown requested");
            signal_tx.send_replace(true);
        });

        let mut server_shutdown = shutdown_rx;
        let server_task = tokio::spawn(server.run(async move {
            let _ = server_shutdown.wait_for(|stop| *stop).await;
        }));

        tracing::info!("herald gateway ready");

        // Returns after graceful shutdown, or early if the server fails
        let server_result = server_task.await;
        if !shutdown_tx.send_replace(true) {
            tracing::error!("API server exited, shutting down");
        }
        signal.abort();

        if let Err(e) = worker_task.await {
            tracing::error!(error = %e, "pipeline worker panicked");
        }
        if let Err(e) = archiver.await {
            tracing::error!(error = %e, "archiver panicked");
        }

        tracing::info!("herald gateway stopped");
        server_result.map_err(|e| Error::Config(format!("API server task failed: {e}")))?
    }
}

/// Archive conversations idle longer than `idle_timeout`
fn archive_idle(conversations: &ConversationRepo, idle_timeout: Duration) -> Result<usize> {
    let idle = chrono::Duration::from_std(idle_timeout)
        .map_err(|e| Error::Config(format!("idle timeout out of range: {e}")))?;
    conversations.archive_idle(idle)
}

/// Periodically archive idle conversations until shutdown
pub fn spawn_archiver(
    conversations: ConversationRepo,
    idle_timeout: Duration,
    sweep_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = archive_idle(&conversations, idle_timeout) {
                        tracing::warn!(error = %e, "archive sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

fn copy_secret(secret: &SecretString) -> SecretString {
    SecretString::from(secret.expose_secret().to_owned())
}

/// Resolve on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
