//! Bounded retry with exponential backoff for adapter calls

use std::time::Duration;

use rand::Rng;

/// Retry policy for adapter calls
///
/// `max_attempts` counts the first call, so the default makes one call and
/// at most two retries.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts per stage, including the first
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Growth factor between consecutive retries
    pub factor: f64,
    /// Relative jitter applied to each delay (0.2 = ±20%)
    pub jitter: f64,
    /// Maximum delay cap
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            factor: 2.0,
            jitter: 0.2,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Policy without jitter, for deterministic timing
    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// Whether another attempt is allowed after `attempt` (1-based) failed
    #[must_use]
    pub const fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Backoff before `attempt` (1-based)
    ///
    /// The first attempt never waits. Later attempts wait
    /// `base_delay * factor^(attempt - 2)` with jitter, capped at
    /// `max_delay`. An upstream `retry_after` hint replaces the computed
    /// delay but is still capped.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        if let Some(ra) = retry_after {
            return ra.min(self.max_delay);
        }

        let exponent = i32::try_from(attempt - 2).unwrap_or(i32::MAX);
        let nominal = self.base_delay.as_secs_f64() * self.factor.powi(exponent);
        let nominal = nominal.min(self.max_delay.as_secs_f64());

        let jitter = self.jitter.clamp(0.0, 1.0);
        let scale = if jitter > 0.0 {
            1.0 + rand::thread_rng().gen_range(-jitter..=jitter)
        } else {
            1.0
        };

        Duration::from_secs_f64((nominal * scale).max(0.0)).min(self.max_delay)
    }
}

/// Whether an HTTP status is worth retrying
///
/// Rate limits (429), request timeouts (408) and server errors (5xx).
#[must_use]
pub fn is_recoverable_status(status: u16) -> bool {
    status == 408 || status == 429 || (500..600).contains(&status)
}

/// Parse an HTTP `Retry-After` header value given in seconds
#[must_use]
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}
