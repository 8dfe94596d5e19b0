//! Error types for rowsync.
//!
//! All errors that can occur while driving a table through its replication
//! cycle are represented by [`RowSyncError`]. Errors are propagated via
//! `Result<T, RowSyncError>` throughout the codebase; nothing in this crate
//! uses exceptions-as-control-flow or string-matches a driver error message
//! to decide what to do next — each condition that the scheduler cares about
//! gets its own variant.
//!
//! # Error Classification
//!
//! - **Transient** — network blips, lock timeouts, pool exhaustion. Retried
//!   with bounded backoff; on exhaustion the table moves to `ERROR` and the
//!   engine worker continues with the next table.
//! - **Permanent** — missing schema, malformed query, auth failure. The
//!   table moves to `ERROR` immediately, no retry.
//! - **Invariant** — the cursor would move backwards, or a status
//!   transition is not legal from the current state. Refused outright;
//!   never silently corrects itself.
//! - **Budget** — a per-table pass exceeded its wall-clock or chunk-count
//!   guard. Not a failure: the cycle ends cleanly with progress committed.

use std::fmt;

/// Primary error type for the replication core.
#[derive(Debug, thiserror::Error)]
pub enum RowSyncError {
    /// A source adapter call failed after exhausting its retry budget.
    #[error("transient source error ({schema}.{table}): {message}")]
    TransientSource {
        schema: String,
        table: String,
        message: String,
    },

    /// A source adapter call failed in a way that will not succeed on retry
    /// (missing table, malformed query, authentication failure).
    #[error("permanent source error ({schema}.{table}): {message}")]
    PermanentSource {
        schema: String,
        table: String,
        message: String,
    },

    /// A target write failed transiently (lock timeout, connection reset).
    #[error("transient target error ({schema}.{table}): {message}")]
    TransientTarget {
        schema: String,
        table: String,
        message: String,
    },

    /// PostgreSQL reported the current transaction as aborted/poisoned.
    /// The writer falls back to per-row execution outside this error.
    #[error("aborted transaction ({schema}.{table}): {message}")]
    AbortedTransaction {
        schema: String,
        table: String,
        message: String,
    },

    /// A cursor mutation or status transition would violate a catalog
    /// invariant (monotonicity, legal transition). Refused, not applied.
    #[error("cursor invariant violated ({schema}.{table}): {message}")]
    CursorInvariant {
        schema: String,
        table: String,
        message: String,
    },

    /// A per-table pass exceeded its wall-clock or chunk-count guard.
    /// Not fatal — the cycle ends with whatever progress was committed.
    #[error("budget exceeded ({schema}.{table}): {message}")]
    BudgetExceeded {
        schema: String,
        table: String,
        message: String,
    },

    /// The catalog entry for (schema, table) does not exist.
    #[error("catalog entry not found: {0}.{1}")]
    NotFound(String, String),

    /// A catalog or config row could not be decoded (bad JSON, bad enum tag).
    #[error("catalog decode error: {0}")]
    CatalogDecode(String),

    /// The catalog store itself (target PostgreSQL) is unreachable.
    #[error("catalog store unreachable: {0}")]
    CatalogUnreachable(String),

    /// An invalid argument was passed to a core API (e.g. `UpdateLastOffset`
    /// called on a table whose `pk_strategy != OFFSET`).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl RowSyncError {
    /// Whether this error is retryable by the adapter/writer/scheduler.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RowSyncError::TransientSource { .. }
                | RowSyncError::TransientTarget { .. }
                | RowSyncError::AbortedTransaction { .. }
                | RowSyncError::CatalogUnreachable(_)
        )
    }

    /// Classify the error for logging and scheduler bookkeeping.
    pub fn kind(&self) -> RowSyncErrorKind {
        match self {
            RowSyncError::TransientSource { .. }
            | RowSyncError::TransientTarget { .. }
            | RowSyncError::AbortedTransaction { .. }
            | RowSyncError::CatalogUnreachable(_) => RowSyncErrorKind::Transient,

            RowSyncError::PermanentSource { .. } | RowSyncError::NotFound(..) => {
                RowSyncErrorKind::Permanent
            }

            RowSyncError::CursorInvariant { .. } | RowSyncError::InvalidArgument(_) => {
                RowSyncErrorKind::Invariant
            }

            RowSyncError::BudgetExceeded { .. } => RowSyncErrorKind::Budget,

            RowSyncError::CatalogDecode(_) => RowSyncErrorKind::Permanent,
        }
    }

    /// Whether this error should drive the table's catalog status to `ERROR`.
    ///
    /// Budget exhaustion is not a failure and invariant violations refuse
    /// the mutation rather than corrupting state, so neither moves a table
    /// to `ERROR` on their own.
    pub fn moves_table_to_error(&self) -> bool {
        matches!(
            self.kind(),
            RowSyncErrorKind::Permanent | RowSyncErrorKind::Transient
        )
    }

    pub fn schema_table(&self) -> Option<(&str, &str)> {
        match self {
            RowSyncError::TransientSource { schema, table, .. }
            | RowSyncError::PermanentSource { schema, table, .. }
            | RowSyncError::TransientTarget { schema, table, .. }
            | RowSyncError::AbortedTransaction { schema, table, .. }
            | RowSyncError::CursorInvariant { schema, table, .. }
            | RowSyncError::BudgetExceeded { schema, table, .. } => Some((schema, table)),
            RowSyncError::NotFound(schema, table) => Some((schema, table)),
            _ => None,
        }
    }
}

/// Classification of error severity/kind for monitoring and retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowSyncErrorKind {
    Transient,
    Permanent,
    Invariant,
    Budget,
}

impl fmt::Display for RowSyncErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowSyncErrorKind::Transient => write!(f, "TRANSIENT"),
            RowSyncErrorKind::Permanent => write!(f, "PERMANENT"),
            RowSyncErrorKind::Invariant => write!(f, "INVARIANT"),
            RowSyncErrorKind::Budget => write!(f, "BUDGET"),
        }
    }
}

impl From<sqlx::Error> for RowSyncError {
    fn from(e: sqlx::Error) -> Self {
        RowSyncError::CatalogUnreachable(e.to_string())
    }
}

// ── Retry policy ─────────────────────────────────────────────────────────

/// Bounded exponential backoff for adapter/writer retries.
///
/// spec.md §4.2 calls for 3 attempts with a 100ms base delay; this is the
/// default, but the policy is reusable wherever bounded backoff is needed.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Base delay in milliseconds (doubled each attempt).
    pub base_delay_ms: u64,
    /// Maximum delay in milliseconds (cap for backoff).
    pub max_delay_ms: u64,
    /// Maximum number of attempts before giving up.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 100,
            max_delay_ms: 5_000,
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// Backoff delay for the given attempt number (0-based), exponential
    /// with +/-25% jitter to avoid thundering-herd retries across tables.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let delay = self.base_delay_ms.saturating_mul(1u64 << attempt.min(16));
        let capped = delay.min(self.max_delay_ms);
        if attempt.is_multiple_of(2) {
            capped.saturating_mul(3) / 4
        } else {
            capped.saturating_mul(5) / 4
        }
    }

    /// `attempt` is 0-based and counts retries, not the initial call, so
    /// `max_attempts` (spec.md §4.2's "3 attempts") bounds the *total*
    /// number of calls `with_retry` makes, initial call included.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt + 1 < self.max_attempts
    }
}

/// Runs `op` with bounded exponential backoff, retrying only when the
/// produced error reports [`RowSyncError::is_retryable`].
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, RowSyncError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, RowSyncError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && policy.should_retry(attempt) => {
                let delay = policy.backoff_ms(attempt);
                tracing::warn!(attempt, delay_ms = delay, error = %e, "retrying after transient error");
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert!(policy.backoff_ms(0) < policy.backoff_ms(1));
        assert!(policy.backoff_ms(10) <= policy.max_delay_ms.saturating_mul(5) / 4);
    }

    #[test]
    fn retryable_classification() {
        let e = RowSyncError::TransientSource {
            schema: "s".into(),
            table: "t".into(),
            message: "timeout".into(),
        };
        assert!(e.is_retryable());
        assert_eq!(e.kind(), RowSyncErrorKind::Transient);

        let e = RowSyncError::CursorInvariant {
            schema: "s".into(),
            table: "t".into(),
            message: "would go backwards".into(),
        };
        assert!(!e.is_retryable());
        assert_eq!(e.kind(), RowSyncErrorKind::Invariant);
    }

    #[tokio::test]
    async fn with_retry_gives_up_after_max_attempts() {
        let policy = RetryPolicy {
            base_delay_ms: 1,
            max_delay_ms: 2,
            max_attempts: 3,
        };
        let mut calls = 0;
        let result: Result<(), RowSyncError> = with_retry(&policy, || {
            calls += 1;
            async {
                Err(RowSyncError::TransientSource {
                    schema: "s".into(),
                    table: "t".into(),
                    message: "boom".into(),
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 3); // 3 total attempts, spec.md §4.2
    }
}
