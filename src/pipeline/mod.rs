//! Message pipeline: state machine, retry policy, and orchestration
//!
//! An inbound message moves through
//! `RECEIVED -> DEDUP_CHECKED -> [TRANSCRIBING] -> CONTEXT_BUILT -> COMPLETING
//! -> DELIVERING -> DELIVERED`, ending in `IGNORED` or `FAILED` when it
//! cannot go further.

mod locks;
mod orchestrator;
pub mod retry;
mod state;
mod worker;

pub use locks::{ConversationGuard, ConversationLocks};
pub use orchestrator::{FallbackReplies, Orchestrator, Outcome, fallback_key, reply_key};
pub use retry::RetryPolicy;
pub use state::PipelineState;
pub use worker::{Worker, WorkerHandle};
