//! Conversation repository
//!
//! A participant has at most one active conversation. Turns are numbered by
//! a per-conversation counter that only ever increments, inside the same
//! transaction that inserts the message, so history order is arrival order.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use uuid::Uuid;

use super::message::{Message, MESSAGE_COLUMNS};
use super::{DbPool, checkout, format_timestamp, now_timestamp, parse_datetime};
use crate::{Error, Result};

/// Conversation lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationState {
    Active,
    Archived,
}

impl ConversationState {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Archived => "archived",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }
}

/// A conversation with one participant
#[derive(Debug, Clone)]
pub struct Conversation {
    pub id: String,
    pub participant_id: String,
    pub state: ConversationState,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

const CONVERSATION_COLUMNS: &str = "id, participant_id, state, created_at, last_activity_at";

fn conversation_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        participant_id: row.get(1)?,
        state: ConversationState::from_str(&row.get::<_, String>(2)?)
            .unwrap_or(ConversationState::Active),
        created_at: parse_datetime(&row.get::<_, String>(3)?),
        last_activity_at: parse_datetime(&row.get::<_, String>(4)?),
    })
}

/// Find the participant's active conversation or open a new one
///
/// Runs on the caller's connection so it can share the caller's transaction.
pub(crate) fn find_or_create_active(conn: &Connection, participant_id: &str) -> Result<Conversation> {
    let existing = conn
        .query_row(
            &format!(
                "SELECT {CONVERSATION_COLUMNS} FROM conversations
                 WHERE participant_id = ?1 AND state = 'active'"
            ),
            [participant_id],
            conversation_from_row,
        )
        .optional()?;

    if let Some(conversation) = existing {
        return Ok(conversation);
    }

    let id = Uuid::new_v4().to_string();
    let now = now_timestamp();
    conn.execute(
        "INSERT INTO conversations (id, participant_id, state, next_turn, created_at, last_activity_at)
         VALUES (?1, ?2, 'active', 0, ?3, ?3)",
        [&id, participant_id, &now],
    )?;

    tracing::debug!(conversation_id = %id, "opened conversation");

    Ok(Conversation {
        id,
        participant_id: participant_id.to_string(),
        state: ConversationState::Active,
        created_at: parse_datetime(&now),
        last_activity_at: parse_datetime(&now),
    })
}

/// Reserve the next turn index and bump `last_activity_at`
pub(crate) fn allocate_turn(conn: &Connection, conversation_id: &str) -> Result<i64> {
    let turn: i64 = conn
        .query_row(
            "UPDATE conversations SET next_turn = next_turn + 1, last_activity_at = ?2
             WHERE id = ?1 RETURNING next_turn - 1",
            [conversation_id, &now_timestamp()],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| Error::NotFound(format!("conversation {conversation_id}")))?;

    Ok(turn)
}

/// Conversation repository
#[derive(Clone)]
pub struct ConversationRepo {
    pool: DbPool,
}

impl ConversationRepo {
    /// Create a new conversation repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Find or create the active conversation for a participant
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn find_or_create(&self, participant_id: &str) -> Result<Conversation> {
        let mut conn = checkout(&self.pool)?;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let conversation = find_or_create_active(&tx, participant_id)?;
        tx.commit()?;
        Ok(conversation)
    }

    /// Get a conversation by id
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn get(&self, id: &str) -> Result<Option<Conversation>> {
        let conn = checkout(&self.pool)?;
        let conversation = conn
            .query_row(
                &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
                [id],
                conversation_from_row,
            )
            .optional()?;
        Ok(conversation)
    }

    /// Turn history in arrival order
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn turn_history(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let conn = checkout(&self.pool)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE conversation_id = ?1 ORDER BY turn_index ASC"
        ))?;

        let turns = stmt
            .query_map([conversation_id], Message::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(turns)
    }

    /// Archive active conversations idle for longer than `idle`
    ///
    /// Conversations with unfinished inbound messages are left alone.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn archive_idle(&self, idle: chrono::Duration) -> Result<usize> {
        let cutoff = format_timestamp(Utc::now() - idle);
        let conn = checkout(&self.pool)?;

        let archived = conn.execute(
            "UPDATE conversations SET state = ?1
             WHERE state = 'active' AND last_activity_at < ?2
               AND NOT EXISTS (
                   SELECT 1 FROM messages m
                   WHERE m.conversation_id = conversations.id
                     AND m.direction = 'inbound'
                     AND m.status NOT IN ('delivered', 'ignored', 'failed')
               )",
            [ConversationState::Archived.as_str(), &cutoff],
        )?;

        if archived > 0 {
            tracing::info!(count = archived, "archived idle conversations");
        }

        Ok(archived)
    }

    /// List conversations for a participant, newest first
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn list_for_participant(&self, participant_id: &str) -> Result<Vec<Conversation>> {
        let conn = checkout(&self.pool)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations
             WHERE participant_id = ?1 ORDER BY created_at DESC"
        ))?;

        let conversations = stmt
            .query_map([participant_id], conversation_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(conversations)
    }
}
