//! Prompt context assembly with a bounded history window

use crate::db::{ConversationRepo, Direction, Message, MessageRepo};
use crate::pipeline::PipelineState;
use crate::{Error, Result};

/// Configuration for context building
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Maximum number of turns handed to the completion adapter
    pub max_turns: usize,
    /// Character budget for the turn history
    pub max_chars: usize,
    /// System prompt prepended to every completion
    pub system_prompt: Option<String>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_turns: 20,
            max_chars: 12_000,
            system_prompt: None,
        }
    }
}

/// Who authored a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    /// Chat API role name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One turn of a prompt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTurn {
    pub role: Role,
    pub content: String,
}

impl PromptTurn {
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Ordered prompt handed to the completion adapter
#[derive(Debug, Clone, Default)]
pub struct PromptContext {
    pub system_prompt: Option<String>,
    /// Oldest first
    pub turns: Vec<PromptTurn>,
}

impl PromptContext {
    /// Characters across all turns
    #[must_use]
    pub fn char_count(&self) -> usize {
        self.turns.iter().map(|t| t.content.chars().count()).sum()
    }

    /// The most recent user turn
    #[must_use]
    pub fn latest_user_turn(&self) -> Option<&PromptTurn> {
        self.turns.iter().rev().find(|t| t.role == Role::User)
    }
}

/// Apply the truncation policy to a chronological list of turns
///
/// Keeps at most `max_turns` of the newest turns, then drops oldest-first
/// until the history fits `max_chars`. The most recent user turn is never
/// dropped, even when it alone exceeds the budget.
#[must_use]
pub fn truncate(turns: Vec<PromptTurn>, config: &ContextConfig) -> Vec<PromptTurn> {
    let Some(anchor) = turns.iter().rposition(|t| t.role == Role::User) else {
        let skip = turns.len().saturating_sub(config.max_turns);
        return turns.into_iter().skip(skip).collect();
    };

    let mut kept: Vec<(usize, PromptTurn)> = turns.into_iter().enumerate().collect();

    let max_turns = config.max_turns.max(1);
    while kept.len() > max_turns {
        let Some(victim) = kept.iter().position(|(i, _)| *i != anchor) else {
            break;
        };
        kept.remove(victim);
    }

    let mut chars: usize = kept.iter().map(|(_, t)| t.content.chars().count()).sum();
    while chars > config.max_chars {
        let Some(victim) = kept.iter().position(|(i, _)| *i != anchor) else {
            break;
        };
        let (_, dropped) = kept.remove(victim);
        chars -= dropped.content.chars().count();
    }

    kept.into_iter().map(|(_, t)| t).collect()
}

/// Builds prompts from a conversation's persisted turn history
#[derive(Clone)]
pub struct ContextManager {
    config: ContextConfig,
    conversations: ConversationRepo,
    messages: MessageRepo,
}

impl ContextManager {
    /// Create a new context manager
    #[must_use]
    pub const fn new(config: ContextConfig, conversations: ConversationRepo, messages: MessageRepo) -> Self {
        Self {
            config,
            conversations,
            messages,
        }
    }

    /// Context configuration
    #[must_use]
    pub const fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Build a prompt from the full turn history of a conversation
    ///
    /// # Errors
    ///
    /// Returns error if database operations fail
    pub fn build_context(&self, conversation_id: &str) -> Result<PromptContext> {
        let history = self.conversations.turn_history(conversation_id)?;
        let turns = history.iter().filter_map(prompt_turn).collect();
        Ok(self.finish(turns))
    }

    /// Build the prompt for answering one inbound message
    ///
    /// Inbound turns that arrived after `anchor` are excluded, replies to
    /// earlier turns are kept, and `anchor` is placed last.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPayload` if the anchor has no text yet, or error if
    /// database operations fail
    pub fn build_context_for(&self, anchor: &Message) -> Result<PromptContext> {
        let Some(anchor_text) = anchor.turn_text() else {
            return Err(Error::InvalidPayload(format!(
                "message {} has no transcript",
                anchor.external_id
            )));
        };

        let history = self.conversations.turn_history(&anchor.conversation_id)?;
        let mut turns: Vec<PromptTurn> = history
            .iter()
            .filter(|m| m.id != anchor.id)
            .filter(|m| m.direction == Direction::Outbound || m.turn_index < anchor.turn_index)
            .filter(|m| m.reply_to.as_deref() != Some(anchor.id.as_str()))
            .filter_map(prompt_turn)
            .collect();
        turns.push(PromptTurn::user(anchor_text));

        Ok(self.finish(turns))
    }

    /// Append an assistant turn to a conversation
    ///
    /// # Errors
    ///
    /// Returns error if the conversation does not exist or the write fails
    pub fn append_turn(
        &self,
        conversation_id: &str,
        external_id: &str,
        content: &str,
        reply_to: Option<&str>,
    ) -> Result<Message> {
        self.messages
            .append_outbound(conversation_id, external_id, content, reply_to)
    }

    fn finish(&self, turns: Vec<PromptTurn>) -> PromptContext {
        PromptContext {
            system_prompt: self.config.system_prompt.clone(),
            turns: truncate(turns, &self.config),
        }
    }
}

/// Map a stored message to a prompt turn
///
/// Inbound turns without a transcript and replies that never reached the
/// participant contribute nothing.
fn prompt_turn(message: &Message) -> Option<PromptTurn> {
    match message.direction {
        Direction::Inbound => message.turn_text().map(PromptTurn::user),
        Direction::Outbound if message.status == PipelineState::Failed => None,
        Direction::Outbound => message.turn_text().map(PromptTurn::assistant),
    }
}
