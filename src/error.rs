//! Error types for kasho.
//!
//! All errors that can occur within the replication core are represented
//! by [`KashoError`]. Errors are propagated via `Result<T, KashoError>`
//! throughout the codebase; service mains convert fatal errors into a
//! non-zero exit so a supervisor restarts the process.
//!
//! # Error Classification
//!
//! Errors are classified into three categories that determine handling:
//! - **Fatal** — bad configuration, license refusal, buffer conflicts,
//!   schema-mismatch apply failures. Terminate the service.
//! - **Retryable** — transient connectivity and protocol failures.
//!   Retried with exponential backoff, indefinitely.
//! - **Recoverable** — per-change conditions (transform mismatches,
//!   integrity violations). Logged with the offending position; the
//!   stream advances.
//!
//! # Retry Policy
//!
//! The [`RetryPolicy`] struct encapsulates exponential backoff for
//! retryable errors: 1 s doubling to a 30 s cap, unbounded attempts.

use std::fmt;

use crate::change::Position;

/// Primary error type for the replication core.
#[derive(Debug, thiserror::Error)]
pub enum KashoError {
    // ── Fatal at startup ─────────────────────────────────────────────────
    /// Malformed YAML, unknown generator name, missing environment variable.
    #[error("config error: {0}")]
    Config(String),

    /// The external licensing service refused us or was unreachable.
    #[error("license validation failed: {0}")]
    License(String),

    // ── Retryable ────────────────────────────────────────────────────────
    /// Transient failure reaching source, replica, or buffer store.
    #[error("connect error ({target}): {message}")]
    Connect { target: &'static str, message: String },

    /// Source stream or buffer RPC decode failure.
    #[error("protocol error: {0}")]
    Protocol(String),

    // ── Recoverable per-change ───────────────────────────────────────────
    /// Generator output type cannot be coerced to the column type.
    #[error("transform mismatch on {table}.{column}: generator yields {produced}, column holds {expected}")]
    TransformMismatch {
        table: String,
        column: String,
        produced: &'static str,
        expected: &'static str,
    },

    // ── Apply failures ───────────────────────────────────────────────────
    /// SQL execution failure on the replica, classified by sub-case.
    #[error("apply error at {position} ({class}): {message}")]
    Apply {
        position: Position,
        class: ApplyErrorClass,
        message: String,
    },

    // ── Buffer ───────────────────────────────────────────────────────────
    /// Append with a conflicting payload at an existing position.
    #[error("conflicting payload at existing position {0}")]
    Conflict(Position),

    /// An unexpected internal error. Indicates a bug.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Sub-classification of replica-side SQL failures. Each class has its
/// own handling: warn-and-advance, halt, or reconnect-and-retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyErrorClass {
    /// Duplicate key on insert, missing row on delete.
    Integrity,
    /// Syntax error or schema mismatch; operator intervention required.
    Schema,
    /// Deadlock, lost connection; retry the same change.
    Transient,
}

impl fmt::Display for ApplyErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplyErrorClass::Integrity => f.write_str("integrity"),
            ApplyErrorClass::Schema => f.write_str("schema"),
            ApplyErrorClass::Transient => f.write_str("transient"),
        }
    }
}

impl KashoError {
    /// Whether the process should exit non-zero rather than retry.
    pub fn is_fatal(&self) -> bool {
        match self {
            KashoError::Config(_)
            | KashoError::License(_)
            | KashoError::Conflict(_)
            | KashoError::Internal(_) => true,
            KashoError::Apply { class, .. } => *class == ApplyErrorClass::Schema,
            _ => false,
        }
    }

    /// Whether the operation should be retried with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            KashoError::Connect { .. } | KashoError::Protocol(_) => true,
            KashoError::Apply { class, .. } => *class == ApplyErrorClass::Transient,
            _ => false,
        }
    }

    pub fn connect(target: &'static str, err: impl fmt::Display) -> Self {
        KashoError::Connect { target, message: err.to_string() }
    }
}

impl From<tokio_postgres::Error> for KashoError {
    fn from(err: tokio_postgres::Error) -> Self {
        KashoError::connect("postgres", err)
    }
}

impl From<mysql_async::Error> for KashoError {
    fn from(err: mysql_async::Error) -> Self {
        KashoError::connect("mysql", err)
    }
}

impl From<redis::RedisError> for KashoError {
    fn from(err: redis::RedisError) -> Self {
        KashoError::connect("buffer", err)
    }
}

// ── Retry Policy ───────────────────────────────────────────────────────────

/// Exponential backoff for retryable errors.
///
/// Capture and apply loops use this to pace reconnect attempts. Attempts
/// are unbounded; classification (not a retry budget) decides whether an
/// error is terminal.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Base delay in milliseconds (doubled each attempt).
    pub base_delay_ms: u64,
    /// Maximum delay in milliseconds (cap for backoff).
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000, // 1 second initial
            max_delay_ms: 30_000, // 30 second cap
        }
    }
}

impl RetryPolicy {
    /// Backoff delay in milliseconds for the given attempt number (0-based).
    ///
    /// `base_delay * 2^attempt`, capped at `max_delay`.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        self.base_delay_ms
            .saturating_mul(1u64 << attempt.min(16))
            .min(self.max_delay_ms)
    }

    pub fn backoff(&self, attempt: u32) -> std::time::Duration {
        std::time::Duration::from_millis(self.backoff_ms(attempt))
    }
}

/// Consecutive-failure counter paired with a [`RetryPolicy`].
///
/// In-memory only; reset whenever an operation succeeds.
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    attempts: u32,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure and return the delay to sleep before retrying.
    pub fn record_failure(&mut self, policy: &RetryPolicy) -> std::time::Duration {
        let delay = policy.backoff(self.attempts);
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(KashoError::Config("x".into()).is_fatal());
        assert!(KashoError::License("x".into()).is_fatal());
        assert!(KashoError::Conflict(Position::bootstrap(1)).is_fatal());
        assert!(!KashoError::Protocol("x".into()).is_fatal());
        assert!(!KashoError::connect("postgres", "down").is_fatal());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(KashoError::connect("buffer", "refused").is_retryable());
        assert!(KashoError::Protocol("bad frame".into()).is_retryable());
        assert!(!KashoError::Config("x".into()).is_retryable());
    }

    #[test]
    fn test_apply_classes() {
        let mk = |class| KashoError::Apply {
            position: Position::from_lsn(1),
            class,
            message: "m".into(),
        };
        assert!(mk(ApplyErrorClass::Schema).is_fatal());
        assert!(!mk(ApplyErrorClass::Schema).is_retryable());
        assert!(mk(ApplyErrorClass::Transient).is_retryable());
        assert!(!mk(ApplyErrorClass::Integrity).is_fatal());
        assert!(!mk(ApplyErrorClass::Integrity).is_retryable());
    }

    #[test]
    fn test_retry_policy_backoff() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_ms(0), 1_000);
        assert_eq!(policy.backoff_ms(1), 2_000);
        assert_eq!(policy.backoff_ms(4), 16_000);
        // Capped at 30 s from attempt 5 onward.
        assert_eq!(policy.backoff_ms(5), 30_000);
        assert_eq!(policy.backoff_ms(40), 30_000);
    }

    #[test]
    fn test_retry_state_lifecycle() {
        let policy = RetryPolicy::default();
        let mut state = RetryState::new();

        assert_eq!(state.record_failure(&policy).as_millis(), 1_000);
        assert_eq!(state.record_failure(&policy).as_millis(), 2_000);
        assert_eq!(state.attempts(), 2);

        state.reset();
        assert_eq!(state.attempts(), 0);
        assert_eq!(state.record_failure(&policy).as_millis(), 1_000);
    }
}
