//! Database schema and migrations

use rusqlite::Connection;

use crate::Result;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// Initialize the database schema
///
/// # Errors
///
/// Returns error if migration fails
pub fn init(conn: &Connection) -> Result<()> {
    let version: i32 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .unwrap_or(0);

    if version < 1 {
        migrate_v1(conn)?;
    }
    if version < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        -- Conversations, one active per participant
        CREATE TABLE IF NOT EXISTS conversations (
            id TEXT PRIMARY KEY,
            participant_id TEXT NOT NULL,
            state TEXT NOT NULL DEFAULT 'active' CHECK(state IN ('active', 'archived')),
            next_turn INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            last_activity_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_conversations_participant
            ON conversations(participant_id, state);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_conversations_one_active
            ON conversations(participant_id) WHERE state = 'active';

        -- Inbound and outbound messages; external_id is the idempotency key
        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            external_id TEXT NOT NULL UNIQUE,
            conversation_id TEXT NOT NULL REFERENCES conversations(id),
            direction TEXT NOT NULL CHECK(direction IN ('inbound', 'outbound')),
            kind TEXT NOT NULL CHECK(kind IN ('text', 'audio')),
            raw_payload TEXT NOT NULL,
            transcript TEXT,
            status TEXT NOT NULL,
            reply_to TEXT REFERENCES messages(id),
            turn_index INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE(conversation_id, turn_index)
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, turn_index);
        CREATE INDEX IF NOT EXISTS idx_messages_status ON messages(direction, status);
        CREATE INDEX IF NOT EXISTS idx_messages_reply_to ON messages(reply_to);

        PRAGMA user_version = 1;
        ",
    )?;

    tracing::info!("migrated to schema v1");
    Ok(())
}

fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        -- Adapter call history, numbered per (message, stage)
        CREATE TABLE IF NOT EXISTS delivery_attempts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            message_id TEXT NOT NULL REFERENCES messages(id),
            stage TEXT NOT NULL CHECK(stage IN ('transcription', 'completion', 'delivery', 'fallback')),
            attempt_number INTEGER NOT NULL,
            outcome TEXT NOT NULL CHECK(outcome IN ('success', 'failure')),
            error_kind TEXT,
            error_detail TEXT,
            delay_ms INTEGER NOT NULL DEFAULT 0,
            provider_ref TEXT,
            created_at TEXT NOT NULL,
            UNIQUE(message_id, stage, attempt_number)
        );

        CREATE INDEX IF NOT EXISTS idx_attempts_message ON delivery_attempts(message_id);

        PRAGMA user_version = 2;
        ",
    )?;

    tracing::info!("migrated to schema v2");
    Ok(())
}
