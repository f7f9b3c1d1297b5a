//! Herald Gateway - Messaging gateway for language-model replies
//!
//! This library provides the core functionality for the Herald gateway:
//! - Durable ingestion of text and voice-note webhooks
//! - A resumable per-message pipeline (transcribe, build context, complete, deliver)
//! - Idempotent outbound delivery over the `WhatsApp` Cloud API
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Webhooks (axum)                      │
//! │       WhatsApp Cloud API  │  Generic JSON            │
//! └────────────────────┬────────────────────────────────┘
//!                      │ record + wake
//! ┌────────────────────▼────────────────────────────────┐
//! │            Pipeline (per-conversation order)         │
//! │  Transcriber  │  Context  │  Completion  │ Dispatcher │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │          Event store (SQLite via r2d2)               │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod agent;
pub mod api;
pub mod channels;
pub mod config;
pub mod context;
pub mod daemon;
pub mod db;
pub mod error;
pub mod ingest;
pub mod media;
pub mod pipeline;
pub mod voice;

pub use config::Config;
pub use daemon::Daemon;
pub use db::{DbConn, DbPool};
pub use error::{Error, ErrorKind, Result, Retryable};
pub use ingest::{InboundEvent, InboundPayload};
pub use pipeline::{Orchestrator, Outcome, PipelineState};
