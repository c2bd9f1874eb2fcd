//! In-memory repository implementations used by tests and single-node
//! development setups.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parlor_protocol::UserId;
use serde_json::Value;
use uuid::Uuid;

use crate::repository::truncate_error;
use crate::{
    ArchiveRepository, ArchivedGame, EconomyError, LedgerEntry, OutboxRecord,
    OutboxRepository, PlayerProfile, WalletRepository,
};

#[derive(Default)]
struct WalletInner {
    profiles: HashMap<UserId, PlayerProfile>,
    ledger: Vec<LedgerEntry>,
}

/// Wallet repository backed by process memory. The single mutex gives
/// the same atomicity a database transaction would.
#[derive(Default)]
pub struct MemoryWallet {
    inner: Mutex<WalletInner>,
}

impl MemoryWallet {
    pub fn new() -> Self {
        Self::default()
    }
}

fn lock<T>(m: &Mutex<T>) -> Result<std::sync::MutexGuard<'_, T>, EconomyError> {
    m.lock().map_err(|_| EconomyError::LockPoisoned)
}

#[async_trait]
impl WalletRepository for MemoryWallet {
    async fn get_or_create_profile(
        &self,
        user_id: &UserId,
        initial_coins: i64,
    ) -> Result<PlayerProfile, EconomyError> {
        let mut inner = lock(&self.inner)?;
        let profile = inner
            .profiles
            .entry(user_id.clone())
            .or_insert_with(|| PlayerProfile {
                user_id: user_id.clone(),
                coins: initial_coins,
                version: 1,
            });
        Ok(profile.clone())
    }

    async fn apply_transaction(
        &self,
        user_id: &UserId,
        amount: i64,
        entry_type: &str,
        description: &str,
        reference_id: &str,
        idempotency_key: &str,
        initial_coins: i64,
    ) -> Result<LedgerEntry, EconomyError> {
        let mut inner = lock(&self.inner)?;

        if inner
            .ledger
            .iter()
            .any(|e| e.idempotency_key == idempotency_key)
        {
            return Err(EconomyError::DuplicateTransaction(
                idempotency_key.to_string(),
            ));
        }

        let profile = inner
            .profiles
            .entry(user_id.clone())
            .or_insert_with(|| PlayerProfile {
                user_id: user_id.clone(),
                coins: initial_coins,
                version: 1,
            });

        let balance_after = profile.coins + amount;
        if balance_after < 0 {
            return Err(EconomyError::InsufficientFunds {
                balance: profile.coins,
                requested: amount,
            });
        }
        profile.coins = balance_after;
        profile.version += 1;

        let entry = LedgerEntry {
            id: Uuid::new_v4().simple().to_string(),
            user_id: user_id.clone(),
            amount,
            balance_after,
            entry_type: entry_type.to_string(),
            description: description.to_string(),
            reference_id: reference_id.to_string(),
            idempotency_key: idempotency_key.to_string(),
            created_at: Utc::now(),
        };
        inner.ledger.push(entry.clone());
        Ok(entry)
    }

    async fn balance(&self, user_id: &UserId) -> Result<Option<i64>, EconomyError> {
        let inner = lock(&self.inner)?;
        Ok(inner.profiles.get(user_id).map(|p| p.coins))
    }

    async fn ledger(&self, user_id: &UserId) -> Result<Vec<LedgerEntry>, EconomyError> {
        let inner = lock(&self.inner)?;
        Ok(inner
            .ledger
            .iter()
            .filter(|e| &e.user_id == user_id)
            .cloned()
            .collect())
    }
}

/// Outbox repository backed by process memory.
#[derive(Default)]
pub struct MemoryOutbox {
    rows: Mutex<Vec<OutboxRecord>>,
}

impl MemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every row, for assertions in tests.
    pub fn snapshot(&self) -> Vec<OutboxRecord> {
        self.rows.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl OutboxRepository for MemoryOutbox {
    async fn enqueue(&self, event_type: &str, payload: Value) -> Result<String, EconomyError> {
        let mut rows = lock(&self.rows)?;
        let id = Uuid::new_v4().simple().to_string();
        rows.push(OutboxRecord {
            id: id.clone(),
            event_type: event_type.to_string(),
            payload,
            attempts: 0,
            last_error: None,
            created_at: Utc::now(),
            processed_at: None,
        });
        Ok(id)
    }

    async fn fetch_due(
        &self,
        limit: usize,
        max_attempts: i32,
    ) -> Result<Vec<OutboxRecord>, EconomyError> {
        let rows = lock(&self.rows)?;
        let mut due: Vec<OutboxRecord> = rows
            .iter()
            .filter(|r| r.processed_at.is_none() && r.attempts < max_attempts)
            .cloned()
            .collect();
        due.sort_by_key(|r| r.created_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn mark_processed(&self, id: &str) -> Result<bool, EconomyError> {
        let mut rows = lock(&self.rows)?;
        match rows
            .iter_mut()
            .find(|r| r.id == id && r.processed_at.is_none())
        {
            Some(row) => {
                row.processed_at = Some(Utc::now());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark_failed(&self, id: &str, error: &str) -> Result<(), EconomyError> {
        let mut rows = lock(&self.rows)?;
        if let Some(row) = rows.iter_mut().find(|r| r.id == id) {
            row.attempts += 1;
            row.last_error = Some(truncate_error(error));
        }
        Ok(())
    }

    async fn purge(&self, cutoff: DateTime<Utc>, max_attempts: i32) -> Result<u64, EconomyError> {
        let mut rows = lock(&self.rows)?;
        let before = rows.len();
        rows.retain(|r| {
            let processed_old =
                r.processed_at.map(|at| at < cutoff).unwrap_or(false);
            let dead_old = r.attempts >= max_attempts && r.created_at < cutoff;
            !(processed_old || dead_old)
        });
        Ok((before - rows.len()) as u64)
    }
}

/// Archive repository backed by process memory.
#[derive(Default)]
pub struct MemoryArchive {
    rows: Mutex<Vec<ArchivedGame>>,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArchiveRepository for MemoryArchive {
    async fn insert(&self, game: &ArchivedGame) -> Result<(), EconomyError> {
        let mut rows = lock(&self.rows)?;
        if rows.iter().any(|r| r.room_id == game.room_id) {
            return Ok(());
        }
        rows.push(game.clone());
        Ok(())
    }

    async fn by_room(&self, room_id: &str) -> Result<Option<ArchivedGame>, EconomyError> {
        let rows = lock(&self.rows)?;
        Ok(rows.iter().find(|r| r.room_id == room_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uid(s: &str) -> UserId {
        UserId::new(s)
    }

    #[tokio::test]
    async fn test_profile_created_with_initial_coins() {
        let wallet = MemoryWallet::new();
        let p = wallet.get_or_create_profile(&uid("u1"), 100).await.unwrap();
        assert_eq!(p.coins, 100);
        assert_eq!(p.version, 1);

        // Second touch returns the same profile, no re-grant.
        let p = wallet.get_or_create_profile(&uid("u1"), 999).await.unwrap();
        assert_eq!(p.coins, 100);
    }

    #[tokio::test]
    async fn test_apply_transaction_updates_balance_and_ledger() {
        let wallet = MemoryWallet::new();
        let entry = wallet
            .apply_transaction(&uid("u1"), -30, "entry_fee", "fee", "room:1", "k1", 100)
            .await
            .unwrap();
        assert_eq!(entry.amount, -30);
        assert_eq!(entry.balance_after, 70);
        assert_eq!(wallet.balance(&uid("u1")).await.unwrap(), Some(70));
    }

    #[tokio::test]
    async fn test_duplicate_idempotency_key_is_rejected_without_mutation() {
        let wallet = MemoryWallet::new();
        wallet
            .apply_transaction(&uid("u1"), -30, "entry_fee", "fee", "r", "same-key", 100)
            .await
            .unwrap();
        let err = wallet
            .apply_transaction(&uid("u1"), -30, "entry_fee", "fee", "r", "same-key", 100)
            .await;
        assert!(matches!(err, Err(EconomyError::DuplicateTransaction(_))));
        assert_eq!(wallet.balance(&uid("u1")).await.unwrap(), Some(70));
        assert_eq!(wallet.ledger(&uid("u1")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_balance_never_goes_negative() {
        let wallet = MemoryWallet::new();
        let err = wallet
            .apply_transaction(&uid("u1"), -150, "entry_fee", "fee", "r", "k1", 100)
            .await;
        assert!(matches!(err, Err(EconomyError::InsufficientFunds { .. })));
        assert_eq!(wallet.balance(&uid("u1")).await.unwrap(), Some(100));
    }

    #[tokio::test]
    async fn test_outbox_fetch_due_skips_processed_and_dead_rows() {
        let outbox = MemoryOutbox::new();
        let a = outbox.enqueue("GameEnded", serde_json::json!({})).await.unwrap();
        let b = outbox.enqueue("GameEnded", serde_json::json!({})).await.unwrap();
        let c = outbox.enqueue("GameEnded", serde_json::json!({})).await.unwrap();

        assert!(outbox.mark_processed(&a).await.unwrap());
        for _ in 0..5 {
            outbox.mark_failed(&b, "boom").await.unwrap();
        }

        let due = outbox.fetch_due(10, 5).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, c);
    }

    #[tokio::test]
    async fn test_mark_processed_is_a_unique_update_guard() {
        let outbox = MemoryOutbox::new();
        let id = outbox.enqueue("GameEnded", serde_json::json!({})).await.unwrap();
        assert!(outbox.mark_processed(&id).await.unwrap());
        assert!(!outbox.mark_processed(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_mark_failed_truncates_long_errors() {
        let outbox = MemoryOutbox::new();
        let id = outbox.enqueue("GameEnded", serde_json::json!({})).await.unwrap();
        outbox.mark_failed(&id, &"x".repeat(900)).await.unwrap();
        let rows = outbox.snapshot();
        assert_eq!(rows[0].attempts, 1);
        assert_eq!(rows[0].last_error.as_ref().unwrap().len(), 500);
    }

    #[tokio::test]
    async fn test_purge_removes_old_processed_rows() {
        let outbox = MemoryOutbox::new();
        let id = outbox.enqueue("GameEnded", serde_json::json!({})).await.unwrap();
        outbox.mark_processed(&id).await.unwrap();

        // A cutoff in the future makes "older than cutoff" true now.
        let purged = outbox
            .purge(Utc::now() + chrono::Duration::hours(1), 5)
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(outbox.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_archive_insert_is_idempotent_per_room() {
        let archive = MemoryArchive::new();
        let game = ArchivedGame {
            id: "1".into(),
            room_id: "room-a".into(),
            game_type: "sprint".into(),
            final_state_json: serde_json::json!({}),
            player_seats_json: serde_json::json!({}),
            winner_user_id: Some(uid("u1")),
            total_pot: 400,
            started_at: Utc::now(),
            ended_at: Utc::now(),
        };
        archive.insert(&game).await.unwrap();
        archive.insert(&game).await.unwrap();
        assert!(archive.by_room("room-a").await.unwrap().is_some());
    }
}
