//! Message repository: the durable event store
//!
//! Inbound messages are keyed by the platform's `external_id`. The unique
//! constraint lives in the schema, and every write below is a single
//! transaction, so a crash between two calls leaves either the old row or
//! the new one, never half of each.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use uuid::Uuid;

use super::conversation::{allocate_turn, find_or_create_active};
use super::{DbPool, checkout, now_timestamp, parse_datetime};
use crate::ingest::{InboundEvent, InboundPayload};
use crate::pipeline::PipelineState;
use crate::{Error, Result};

/// Message direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "inbound" => Some(Self::Inbound),
            "outbound" => Some(Self::Outbound),
            _ => None,
        }
    }
}

/// Message kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Audio,
}

impl MessageKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Audio => "audio",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "text" => Some(Self::Text),
            "audio" => Some(Self::Audio),
            _ => None,
        }
    }
}

/// A persisted message
#[derive(Debug, Clone)]
pub struct Message {
    pub id: String,
    /// Platform message id for inbound; idempotency key for outbound
    pub external_id: String,
    pub conversation_id: String,
    pub direction: Direction,
    pub kind: MessageKind,
    /// Tagged [`InboundPayload`] JSON for inbound, reply text for outbound
    pub raw_payload: String,
    pub transcript: Option<String>,
    pub status: PipelineState,
    /// Inbound message an outbound reply answers
    pub reply_to: Option<String>,
    /// Position in the conversation's turn history
    pub turn_index: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub(crate) const MESSAGE_COLUMNS: &str = "id, external_id, conversation_id, direction, kind, raw_payload, \
     transcript, status, reply_to, turn_index, created_at, updated_at";

impl Message {
    pub(crate) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let status: String = row.get(7)?;
        Ok(Self {
            id: row.get(0)?,
            external_id: row.get(1)?,
            conversation_id: row.get(2)?,
            direction: Direction::from_str(&row.get::<_, String>(3)?).unwrap_or(Direction::Inbound),
            kind: MessageKind::from_str(&row.get::<_, String>(4)?).unwrap_or(MessageKind::Text),
            raw_payload: row.get(5)?,
            transcript: row.get(6)?,
            status: PipelineState::parse(&status).ok_or_else(|| {
                rusqlite::Error::FromSqlConversionFailure(
                    7,
                    rusqlite::types::Type::Text,
                    format!("unknown status {status}").into(),
                )
            })?,
            reply_to: row.get(8)?,
            turn_index: row.get(9)?,
            created_at: parse_datetime(&row.get::<_, String>(10)?),
            updated_at: parse_datetime(&row.get::<_, String>(11)?),
        })
    }

    /// Decode the inbound payload
    ///
    /// # Errors
    ///
    /// Returns error for outbound messages or a corrupt payload
    pub fn payload(&self) -> Result<InboundPayload> {
        if self.direction == Direction::Outbound {
            return Err(Error::InvalidPayload(format!(
                "message {} is outbound",
                self.external_id
            )));
        }
        Ok(serde_json::from_str(&self.raw_payload)?)
    }

    /// Text this turn contributes to a prompt
    ///
    /// Inbound turns contribute their transcript (equal to the body for
    /// text messages); outbound turns contribute the reply text.
    #[must_use]
    pub fn turn_text(&self) -> Option<&str> {
        match self.direction {
            Direction::Inbound => self.transcript.as_deref(),
            Direction::Outbound => Some(self.raw_payload.as_str()),
        }
    }
}

/// Outcome of recording an inbound event
#[derive(Debug, Clone)]
pub struct Recorded {
    pub message: Message,
    /// False when the `external_id` was already present (`DuplicateIgnored`)
    pub is_new: bool,
}

fn find_by_external_id_on(conn: &Connection, external_id: &str) -> Result<Option<Message>> {
    let message = conn
        .query_row(
            &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE external_id = ?1"),
            [external_id],
            Message::from_row,
        )
        .optional()?;
    Ok(message)
}

fn insert_outbound(
    conn: &Connection,
    conversation_id: &str,
    external_id: &str,
    content: &str,
    reply_to: Option<&str>,
) -> Result<Message> {
    if let Some(existing) = find_by_external_id_on(conn, external_id)? {
        return Ok(existing);
    }

    let turn_index = allocate_turn(conn, conversation_id)?;
    let id = Uuid::new_v4().to_string();
    let now = now_timestamp();

    conn.execute(
        "INSERT INTO messages
            (id, external_id, conversation_id, direction, kind, raw_payload, status, reply_to, turn_index, created_at, updated_at)
         VALUES (?1, ?2, ?3, 'outbound', 'text', ?4, ?5, ?6, ?7, ?8, ?8)",
        rusqlite::params![
            &id,
            external_id,
            conversation_id,
            content,
            PipelineState::Delivering.as_str(),
            reply_to,
            turn_index,
            &now,
        ],
    )?;

    let message = conn.query_row(
        &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
        [&id],
        Message::from_row,
    )?;

    tracing::debug!(external_id, conversation_id, turn = turn_index, "appended outbound message");
    Ok(message)
}

fn set_status(conn: &Connection, message_id: &str, status: PipelineState) -> Result<()> {
    let updated = conn.execute(
        "UPDATE messages SET status = ?1, updated_at = ?2 WHERE id = ?3",
        [status.as_str(), &now_timestamp(), message_id],
    )?;

    if updated == 0 {
        return Err(Error::NotFound(format!("message {message_id}")));
    }
    Ok(())
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Message repository
#[derive(Clone)]
pub struct MessageRepo {
    pool: DbPool,
}

impl MessageRepo {
    /// Create a new message repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Record an inbound event, or report that it was already recorded
    ///
    /// Opens the sender's conversation if needed and appends the message to
    /// its turn history in the same transaction.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn record_inbound(&self, event: &InboundEvent) -> Result<Recorded> {
        let mut conn = checkout(&self.pool)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if let Some(existing) = find_by_external_id_on(&tx, &event.external_id)? {
            return Ok(Recorded {
                message: existing,
                is_new: false,
            });
        }

        let conversation = find_or_create_active(&tx, &event.sender_id)?;
        let turn_index = allocate_turn(&tx, &conversation.id)?;

        let id = Uuid::new_v4().to_string();
        let now = now_timestamp();
        let raw_payload = serde_json::to_string(&event.payload)?;

        let inserted = tx.execute(
            "INSERT INTO messages
                (id, external_id, conversation_id, direction, kind, raw_payload, status, turn_index, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'inbound', ?4, ?5, ?6, ?7, ?8, ?8)",
            rusqlite::params![
                &id,
                &event.external_id,
                &conversation.id,
                event.payload.kind_str(),
                &raw_payload,
                PipelineState::Received.as_str(),
                turn_index,
                &now,
            ],
        );

        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                // Another writer won the race; roll back and report theirs
                drop(tx);
                let existing = find_by_external_id_on(&conn, &event.external_id)?
                    .ok_or_else(|| Error::Database(e.to_string()))?;
                return Ok(Recorded {
                    message: existing,
                    is_new: false,
                });
            }
            Err(e) => return Err(e.into()),
        }

        let message = tx.query_row(
            &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
            [&id],
            Message::from_row,
        )?;
        tx.commit()?;

        tracing::debug!(
            external_id = %event.external_id,
            conversation_id = %message.conversation_id,
            turn = turn_index,
            "recorded inbound message"
        );

        Ok(Recorded {
            message,
            is_new: true,
        })
    }

    /// Append an outbound message to a conversation
    ///
    /// The `external_id` is the idempotency key; appending the same key twice
    /// returns the existing message.
    ///
    /// # Errors
    ///
    /// Returns error if the conversation does not exist or the write fails
    pub fn append_outbound(
        &self,
        conversation_id: &str,
        external_id: &str,
        content: &str,
        reply_to: Option<&str>,
    ) -> Result<Message> {
        let mut conn = checkout(&self.pool)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let message = insert_outbound(&tx, conversation_id, external_id, content, reply_to)?;
        tx.commit()?;
        Ok(message)
    }

    /// Store a generated reply and move its inbound message to `Delivering`
    ///
    /// Both writes commit together, so a reply never exists without its
    /// inbound message pointing past completion.
    ///
    /// # Errors
    ///
    /// Returns error if the write fails
    pub fn record_reply(&self, inbound: &Message, external_id: &str, content: &str) -> Result<Message> {
        let mut conn = checkout(&self.pool)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let reply = insert_outbound(&tx, &inbound.conversation_id, external_id, content, Some(&inbound.id))?;
        set_status(&tx, &inbound.id, PipelineState::Delivering)?;
        tx.commit()?;
        Ok(reply)
    }

    /// Update several statuses in one transaction
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if any message does not exist; nothing is written
    pub fn mark_statuses(&self, updates: &[(&str, PipelineState)]) -> Result<()> {
        let mut conn = checkout(&self.pool)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        for (message_id, status) in updates {
            set_status(&tx, message_id, *status)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Reply previously recorded for an inbound message
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn find_reply(&self, inbound_id: &str, external_id: &str) -> Result<Option<Message>> {
        let conn = checkout(&self.pool)?;
        let message = conn
            .query_row(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE reply_to = ?1 AND external_id = ?2 AND direction = 'outbound'"
                ),
                [inbound_id, external_id],
                Message::from_row,
            )
            .optional()?;
        Ok(message)
    }

    /// Update a message's pipeline status
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the message does not exist
    pub fn mark_status(&self, message_id: &str, status: PipelineState) -> Result<()> {
        let conn = checkout(&self.pool)?;
        set_status(&conn, message_id, status)
    }

    /// Attach a transcript and move to the given status in one write
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the message does not exist
    pub fn attach_transcript(&self, message_id: &str, transcript: &str, status: PipelineState) -> Result<()> {
        let conn = checkout(&self.pool)?;
        let updated = conn.execute(
            "UPDATE messages SET transcript = ?1, status = ?2, updated_at = ?3 WHERE id = ?4",
            [transcript, status.as_str(), &now_timestamp(), message_id],
        )?;

        if updated == 0 {
            return Err(Error::NotFound(format!("message {message_id}")));
        }
        Ok(())
    }

    /// Get a message by id
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn get(&self, id: &str) -> Result<Option<Message>> {
        let conn = checkout(&self.pool)?;
        let message = conn
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                [id],
                Message::from_row,
            )
            .optional()?;
        Ok(message)
    }

    /// Get a message by external id
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn find_by_external_id(&self, external_id: &str) -> Result<Option<Message>> {
        let conn = checkout(&self.pool)?;
        find_by_external_id_on(&conn, external_id)
    }

    /// Oldest unfinished inbound message in a conversation
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn next_pending_inbound(&self, conversation_id: &str) -> Result<Option<Message>> {
        let conn = checkout(&self.pool)?;
        let message = conn
            .query_row(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE conversation_id = ?1 AND direction = 'inbound'
                       AND status NOT IN ('delivered', 'ignored', 'failed')
                     ORDER BY turn_index ASC LIMIT 1"
                ),
                [conversation_id],
                Message::from_row,
            )
            .optional()?;
        Ok(message)
    }

    /// Conversations holding at least one unfinished inbound message
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn conversations_with_pending(&self) -> Result<Vec<String>> {
        let conn = checkout(&self.pool)?;
        let mut stmt = conn.prepare(
            "SELECT conversation_id FROM messages
             WHERE direction = 'inbound' AND status NOT IN ('delivered', 'ignored', 'failed')
             GROUP BY conversation_id ORDER BY MIN(created_at)",
        )?;

        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }

    /// Count messages with the given external id (0 or 1)
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn count_by_external_id(&self, external_id: &str) -> Result<usize> {
        let conn = checkout(&self.pool)?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE external_id = ?1",
            [external_id],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Count outbound messages in a conversation
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn outbound_count(&self, conversation_id: &str) -> Result<usize> {
        let conn = checkout(&self.pool)?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1 AND direction = ?2",
            [conversation_id, Direction::Outbound.as_str()],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}
