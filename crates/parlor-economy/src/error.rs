//! Error types for the economy layer.

/// Errors from wallet, outbox, and archive operations.
#[derive(Debug, thiserror::Error)]
pub enum EconomyError {
    /// The debit would drive the balance negative.
    #[error("insufficient funds: balance {balance}, requested {requested}")]
    InsufficientFunds { balance: i64, requested: i64 },

    /// A ledger entry with this idempotency key already exists; the
    /// original entry stands and nothing was mutated.
    #[error("duplicate transaction for idempotency key {0}")]
    DuplicateTransaction(String),

    /// Optimistic-concurrency conflict on the player profile after
    /// exhausting retries.
    #[error("concurrency conflict updating profile for {0}")]
    ConcurrencyConflict(String),

    /// The payload of an outbox row could not be parsed.
    #[error("malformed outbox payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),

    /// An outbox row carries an event type no handler knows.
    #[error("unknown outbox event type: {0}")]
    UnknownEventType(String),

    /// A repository's interior lock was poisoned.
    #[error("repository lock poisoned")]
    LockPoisoned,

    /// Database error from the Postgres repositories.
    #[error("database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for EconomyError {
    fn from(e: sqlx::Error) -> Self {
        Self::Database(e.to_string())
    }
}
