//! Conversation context for completions
//!
//! Turns come from the persisted history of a conversation, in arrival
//! order, cut down to the configured window.

mod builder;

pub use builder::{ContextConfig, ContextManager, PromptContext, PromptTurn, Role, truncate};
