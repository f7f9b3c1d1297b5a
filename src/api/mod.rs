//! HTTP API server for Herald gateway

pub mod health;
pub mod messages;
pub mod rate_limit;
pub mod webhooks;

use std::future::Future;
use std::sync::Arc;

use axum::Router;
use secrecy::SecretString;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::Result;
use crate::db::{DbPool, DeliveryAttemptRepo, MessageRepo};
use crate::pipeline::{Orchestrator, WorkerHandle};

/// Shared state for API handlers
pub struct ApiState {
    pub db: DbPool,
    pub messages: MessageRepo,
    pub attempts: DeliveryAttemptRepo,
    pub orchestrator: Arc<Orchestrator>,
    pub worker: WorkerHandle,
    /// Token for the webhook verification handshake
    pub verify_token: Option<SecretString>,
    pub rate_limiter: Option<rate_limit::SharedLimiter>,
}

/// Builder for the API server
pub struct ApiServerBuilder {
    db: DbPool,
    orchestrator: Arc<Orchestrator>,
    worker: WorkerHandle,
    port: u16,
    verify_token: Option<SecretString>,
    requests_per_second: u32,
}

impl ApiServerBuilder {
    /// Create a new API server builder
    #[must_use]
    pub fn new(db: DbPool, orchestrator: Arc<Orchestrator>, worker: WorkerHandle) -> Self {
        Self {
            db,
            orchestrator,
            worker,
            port: crate::config::DEFAULT_PORT,
            verify_token: None,
            requests_per_second: 0,
        }
    }

    /// Set the port
    #[must_use]
    pub const fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the webhook verification token
    #[must_use]
    pub fn verify_token(mut self, token: Option<SecretString>) -> Self {
        self.verify_token = token;
        self
    }

    /// Limit webhook requests per second (0 disables)
    #[must_use]
    pub const fn requests_per_second(mut self, rps: u32) -> Self {
        self.requests_per_second = rps;
        self
    }

    /// Build the API server
    #[must_use]
    pub fn build(self) -> ApiServer {
        let rate_limiter = (self.requests_per_second > 0).then(|| rate_limit::create_limiter(self.requests_per_second));

        let state = Arc::new(ApiState {
            messages: MessageRepo::new(self.db.clone()),
            attempts: DeliveryAttemptRepo::new(self.db.clone()),
            db: self.db,
            orchestrator: self.orchestrator,
            worker: self.worker,
            verify_token: self.verify_token,
            rate_limiter,
        });

        ApiServer {
            state,
            port: self.port,
        }
    }
}

/// API server
pub struct ApiServer {
    state: Arc<ApiState>,
    port: u16,
}

impl ApiServer {
    /// Build the router with all routes
    #[must_use]
    pub fn router(&self) -> Router {
        let webhooks = webhooks::router(self.state.clone()).route_layer(axum::middleware::from_fn_with_state(
            self.state.clone(),
            rate_limit::rate_limit_middleware,
        ));

        Router::new()
            .merge(webhooks)
            .nest("/api/messages", messages::router(self.state.clone()))
            .merge(health::router())
            .merge(health::ready_router(self.state.clone()))
            .layer(TraceLayer::new_for_http())
    }

    /// Run the API server until `shutdown` resolves
    ///
    /// In-flight requests finish before this returns.
    ///
    /// # Errors
    ///
    /// Returns error if server fails to bind or run
    pub async fn run(self, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
        let addr = format!("0.0.0.0:{}", self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| crate::Error::Config(format!("failed to bind API server: {e}")))?;

        tracing::info!(port = self.port, "API server listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| crate::Error::Config(format!("API server error: {e}")))?;

        tracing::info!("API server stopped");
        Ok(())
    }
}
