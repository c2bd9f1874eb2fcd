//! Repository traits and records for the relational boundary.
//!
//! Records mirror the minimum schema the core relies on:
//! `player_profiles`, `wallet_transactions`, `outbox_messages`, and
//! `archived_games`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parlor_protocol::UserId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::EconomyError;

/// A player's wallet row. `version` drives optimistic concurrency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerProfile {
    pub user_id: UserId,
    pub coins: i64,
    pub version: i64,
}

/// One append-only ledger row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: String,
    pub user_id: UserId,
    /// Signed amount: negative for debits, positive for credits.
    pub amount: i64,
    pub balance_after: i64,
    pub entry_type: String,
    pub description: String,
    pub reference_id: String,
    /// Unique across the table; dedupes retries.
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
}

/// One transactional-outbox row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub id: String,
    pub event_type: String,
    pub payload: Value,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// The archival row written once per completed game.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedGame {
    pub id: String,
    pub room_id: String,
    pub game_type: String,
    pub final_state_json: Value,
    pub player_seats_json: Value,
    pub winner_user_id: Option<UserId>,
    pub total_pot: i64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

/// Wallet access: profiles plus the append-only ledger.
#[async_trait]
pub trait WalletRepository: Send + Sync {
    /// Fetches a profile, creating it with `initial_coins` on first
    /// touch.
    async fn get_or_create_profile(
        &self,
        user_id: &UserId,
        initial_coins: i64,
    ) -> Result<PlayerProfile, EconomyError>;

    /// Applies a signed amount to a user's balance and appends a ledger
    /// entry, all atomically.
    ///
    /// Errors:
    /// - [`EconomyError::DuplicateTransaction`] if `idempotency_key` was
    ///   already used; the balance is untouched.
    /// - [`EconomyError::InsufficientFunds`] if the balance would go
    ///   negative.
    /// - [`EconomyError::ConcurrencyConflict`] if the profile version
    ///   raced past the retry budget.
    #[allow(clippy::too_many_arguments)]
    async fn apply_transaction(
        &self,
        user_id: &UserId,
        amount: i64,
        entry_type: &str,
        description: &str,
        reference_id: &str,
        idempotency_key: &str,
        initial_coins: i64,
    ) -> Result<LedgerEntry, EconomyError>;

    async fn balance(&self, user_id: &UserId) -> Result<Option<i64>, EconomyError>;

    /// A user's ledger, oldest first.
    async fn ledger(&self, user_id: &UserId) -> Result<Vec<LedgerEntry>, EconomyError>;
}

/// The transactional outbox.
#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// Appends a new unprocessed row and returns its id.
    async fn enqueue(&self, event_type: &str, payload: Value) -> Result<String, EconomyError>;

    /// Unprocessed rows with `attempts < max_attempts`, oldest first.
    async fn fetch_due(
        &self,
        limit: usize,
        max_attempts: i32,
    ) -> Result<Vec<OutboxRecord>, EconomyError>;

    /// Marks a row processed. Returns false if it was already processed —
    /// the unique-update guard that keeps concurrent workers off the same
    /// row.
    async fn mark_processed(&self, id: &str) -> Result<bool, EconomyError>;

    /// Increments `attempts` and records the error (truncated to 500
    /// characters).
    async fn mark_failed(&self, id: &str, error: &str) -> Result<(), EconomyError>;

    /// Deletes processed rows older than `cutoff` and dead rows
    /// (`attempts >= max_attempts`) older than `cutoff`. Returns how many
    /// went.
    async fn purge(&self, cutoff: DateTime<Utc>, max_attempts: i32) -> Result<u64, EconomyError>;
}

/// Completed-game archival.
#[async_trait]
pub trait ArchiveRepository: Send + Sync {
    /// Inserts the archive row; a second insert for the same room is a
    /// no-op so outbox retries stay idempotent.
    async fn insert(&self, game: &ArchivedGame) -> Result<(), EconomyError>;

    async fn by_room(&self, room_id: &str) -> Result<Option<ArchivedGame>, EconomyError>;
}

/// Truncation applied to `last_error` before it is stored.
pub(crate) fn truncate_error(error: &str) -> String {
    const MAX: usize = 500;
    if error.len() <= MAX {
        error.to_string()
    } else {
        let mut cut = MAX;
        while !error.is_char_boundary(cut) {
            cut -= 1;
        }
        error[..cut].to_string()
    }
}
