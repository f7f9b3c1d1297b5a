//! Delivery attempt history
//!
//! One row per adapter call. Attempt numbers are allocated inside the insert
//! transaction, so they are gap-free and monotonic per (message, stage).

use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, TransactionBehavior};

use super::{DbPool, checkout, now_timestamp, parse_datetime};
use crate::error::ErrorKind;
use crate::Result;

/// Which adapter call an attempt belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryStage {
    Transcription,
    Completion,
    Delivery,
    /// Apology sent after a terminal failure
    Fallback,
}

impl DeliveryStage {
    /// Storage identifier
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Transcription => "transcription",
            Self::Completion => "completion",
            Self::Delivery => "delivery",
            Self::Fallback => "fallback",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "transcription" => Some(Self::Transcription),
            "completion" => Some(Self::Completion),
            "delivery" => Some(Self::Delivery),
            "fallback" => Some(Self::Fallback),
            _ => None,
        }
    }
}

/// Result of a single attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    Failure,
}

impl AttemptOutcome {
    /// Storage identifier
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

/// A recorded attempt
#[derive(Debug, Clone)]
pub struct DeliveryAttempt {
    pub message_id: String,
    pub stage: DeliveryStage,
    /// 1-based, monotonic per (message, stage)
    pub attempt_number: u32,
    pub outcome: AttemptOutcome,
    pub error_kind: Option<String>,
    pub error_detail: Option<String>,
    /// Backoff waited before this attempt
    pub delay: Duration,
    /// Platform receipt id for successful deliveries
    pub provider_ref: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Attempt to be recorded
#[derive(Debug, Clone)]
pub struct NewAttempt<'a> {
    pub message_id: &'a str,
    pub stage: DeliveryStage,
    pub outcome: AttemptOutcome,
    pub error_kind: Option<ErrorKind>,
    pub error_detail: Option<String>,
    pub delay: Duration,
    pub provider_ref: Option<&'a str>,
}

impl<'a> NewAttempt<'a> {
    /// A successful attempt
    #[must_use]
    pub const fn success(message_id: &'a str, stage: DeliveryStage, delay: Duration) -> Self {
        Self {
            message_id,
            stage,
            outcome: AttemptOutcome::Success,
            error_kind: None,
            error_detail: None,
            delay,
            provider_ref: None,
        }
    }

    /// A failed attempt
    #[must_use]
    pub const fn failure(
        message_id: &'a str,
        stage: DeliveryStage,
        delay: Duration,
        kind: ErrorKind,
        detail: String,
    ) -> Self {
        Self {
            message_id,
            stage,
            outcome: AttemptOutcome::Failure,
            error_kind: Some(kind),
            error_detail: Some(detail),
            delay,
            provider_ref: None,
        }
    }

    /// Attach a platform receipt id
    #[must_use]
    pub const fn with_provider_ref(mut self, provider_ref: &'a str) -> Self {
        self.provider_ref = Some(provider_ref);
        self
    }
}

const ATTEMPT_COLUMNS: &str = "message_id, stage, attempt_number, outcome, error_kind, error_detail, \
     delay_ms, provider_ref, created_at";

fn attempt_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DeliveryAttempt> {
    let delay_ms: i64 = row.get(6)?;
    Ok(DeliveryAttempt {
        message_id: row.get(0)?,
        stage: DeliveryStage::from_str(&row.get::<_, String>(1)?).unwrap_or(DeliveryStage::Delivery),
        attempt_number: row.get(2)?,
        outcome: if row.get::<_, String>(3)? == "success" {
            AttemptOutcome::Success
        } else {
            AttemptOutcome::Failure
        },
        error_kind: row.get(4)?,
        error_detail: row.get(5)?,
        delay: Duration::from_millis(u64::try_from(delay_ms).unwrap_or(0)),
        provider_ref: row.get(7)?,
        timestamp: parse_datetime(&row.get::<_, String>(8)?),
    })
}

/// Delivery attempt repository
#[derive(Clone)]
pub struct DeliveryAttemptRepo {
    pool: DbPool,
}

impl DeliveryAttemptRepo {
    /// Create a new delivery attempt repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Record an attempt, allocating the next attempt number
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn record(&self, attempt: &NewAttempt<'_>) -> Result<DeliveryAttempt> {
        let mut conn = checkout(&self.pool)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let attempt_number: u32 = tx.query_row(
            "SELECT COALESCE(MAX(attempt_number), 0) + 1 FROM delivery_attempts
             WHERE message_id = ?1 AND stage = ?2",
            [attempt.message_id, attempt.stage.as_str()],
            |row| row.get(0),
        )?;

        let delay_ms = i64::try_from(attempt.delay.as_millis()).unwrap_or(i64::MAX);
        let now = now_timestamp();

        tx.execute(
            "INSERT INTO delivery_attempts
                (message_id, stage, attempt_number, outcome, error_kind, error_detail, delay_ms, provider_ref, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            rusqlite::params![
                attempt.message_id,
                attempt.stage.as_str(),
                attempt_number,
                attempt.outcome.as_str(),
                attempt.error_kind.map(ErrorKind::as_str),
                attempt.error_detail.as_deref(),
                delay_ms,
                attempt.provider_ref,
                &now,
            ],
        )?;
        tx.commit()?;

        Ok(DeliveryAttempt {
            message_id: attempt.message_id.to_string(),
            stage: attempt.stage,
            attempt_number,
            outcome: attempt.outcome,
            error_kind: attempt.error_kind.map(|k| k.as_str().to_string()),
            error_detail: attempt.error_detail.clone(),
            delay: attempt.delay,
            provider_ref: attempt.provider_ref.map(String::from),
            timestamp: parse_datetime(&now),
        })
    }

    /// All attempts for a message, oldest first
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn list(&self, message_id: &str) -> Result<Vec<DeliveryAttempt>> {
        let conn = checkout(&self.pool)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM delivery_attempts
             WHERE message_id = ?1 ORDER BY id ASC"
        ))?;

        let attempts = stmt
            .query_map([message_id], attempt_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(attempts)
    }

    /// Attempts for one stage of a message, oldest first
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn list_stage(&self, message_id: &str, stage: DeliveryStage) -> Result<Vec<DeliveryAttempt>> {
        Ok(self
            .list(message_id)?
            .into_iter()
            .filter(|a| a.stage == stage)
            .collect())
    }

    /// The successful attempt for a stage, if one was recorded
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn find_success(&self, message_id: &str, stage: DeliveryStage) -> Result<Option<DeliveryAttempt>> {
        let conn = checkout(&self.pool)?;
        let attempt = conn
            .query_row(
                &format!(
                    "SELECT {ATTEMPT_COLUMNS} FROM delivery_attempts
                     WHERE message_id = ?1 AND stage = ?2 AND outcome = 'success'
                     ORDER BY attempt_number DESC LIMIT 1"
                ),
                [message_id, stage.as_str()],
                attempt_from_row,
            )
            .optional()?;
        Ok(attempt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MessageRepo, init_memory};
    use crate::ingest::InboundEvent;

    fn setup() -> (DeliveryAttemptRepo, String) {
        let pool = init_memory().unwrap();
        let message = MessageRepo::new(pool.clone())
            .record_inbound(&InboundEvent::text("m1", "+15550001", "hello"))
            .unwrap()
            .message;
        (DeliveryAttemptRepo::new(pool), message.id)
    }

    #[test]
    fn test_attempts_numbered_per_stage() {
        let (repo, id) = setup();

        let a1 = repo
            .record(&NewAttempt::failure(
                &id,
                DeliveryStage::Transcription,
                Duration::ZERO,
                ErrorKind::TransientUpstream,
                "503".to_string(),
            ))
            .unwrap();
        let a2 = repo
            .record(&NewAttempt::success(&id, DeliveryStage::Transcription, Duration::from_millis(500)))
            .unwrap();
        let c1 = repo
            .record(&NewAttempt::success(&id, DeliveryStage::Completion, Duration::ZERO))
            .unwrap();

        assert_eq!(a1.attempt_number, 1);
        assert_eq!(a2.attempt_number, 2);
        assert_eq!(c1.attempt_number, 1);

        let all = repo.list(&id).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].error_kind.as_deref(), Some("transient_upstream"));
        assert_eq!(all[1].delay, Duration::from_millis(500));

        let transcription = repo.list_stage(&id, DeliveryStage::Transcription).unwrap();
        assert_eq!(transcription.len(), 2);
    }

    #[test]
    fn test_find_success() {
        let (repo, id) = setup();
        assert!(repo.find_success(&id, DeliveryStage::Delivery).unwrap().is_none());

        repo.record(
            &NewAttempt::success(&id, DeliveryStage::Delivery, Duration::ZERO).with_provider_ref("wamid.out"),
        )
        .unwrap();

        let success = repo.find_success(&id, DeliveryStage::Delivery).unwrap().unwrap();
        assert_eq!(success.provider_ref.as_deref(), Some("wamid.out"));
        assert_eq!(success.outcome, AttemptOutcome::Success);
    }

    #[test]
    fn test_foreign_key_enforced() {
        let (repo, _) = setup();
        assert!(repo
            .record(&NewAttempt::success("missing", DeliveryStage::Delivery, Duration::ZERO))
            .is_err());
    }
}
