//! Postgres repository implementations.
//!
//! Queries are runtime-bound (`sqlx::query` + `try_get`) against the
//! minimum schema:
//!
//! ```sql
//! CREATE TABLE player_profiles (
//!     user_id     TEXT PRIMARY KEY,
//!     coins       BIGINT NOT NULL,
//!     version     BIGINT NOT NULL,
//!     is_deleted  BOOLEAN NOT NULL DEFAULT FALSE,
//!     deleted_at  TIMESTAMPTZ
//! );
//! CREATE TABLE wallet_transactions (
//!     id              TEXT PRIMARY KEY,
//!     user_id         TEXT NOT NULL,
//!     amount          BIGINT NOT NULL,
//!     balance_after   BIGINT NOT NULL,
//!     type            TEXT NOT NULL,
//!     description     TEXT NOT NULL,
//!     reference_id    TEXT NOT NULL,
//!     idempotency_key TEXT NOT NULL UNIQUE,
//!     created_at      TIMESTAMPTZ NOT NULL
//! );
//! CREATE TABLE outbox_messages (
//!     id           TEXT PRIMARY KEY,
//!     event_type   TEXT NOT NULL,
//!     payload      JSONB NOT NULL,
//!     attempts     INT NOT NULL DEFAULT 0,
//!     last_error   TEXT,
//!     created_at   TIMESTAMPTZ NOT NULL,
//!     processed_at TIMESTAMPTZ
//! );
//! CREATE INDEX outbox_due ON outbox_messages (processed_at, attempts, created_at);
//! CREATE TABLE archived_games (
//!     id                TEXT PRIMARY KEY,
//!     room_id           TEXT NOT NULL UNIQUE,
//!     game_type         TEXT NOT NULL,
//!     final_state_json  JSONB NOT NULL,
//!     player_seats_json JSONB NOT NULL,
//!     winner_user_id    TEXT,
//!     total_pot         BIGINT NOT NULL,
//!     started_at        TIMESTAMPTZ NOT NULL,
//!     ended_at          TIMESTAMPTZ NOT NULL
//! );
//! ```

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parlor_protocol::UserId;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::repository::truncate_error;
use crate::{
    ArchiveRepository, ArchivedGame, EconomyError, LedgerEntry, OutboxRecord,
    OutboxRepository, PlayerProfile, WalletRepository,
};

/// Retry budget for the optimistic-concurrency loop on profiles.
const OCC_RETRIES: u32 = 3;

/// Connection-pool settings for the Postgres repositories.
#[derive(Debug, Clone)]
pub struct PgPoolSettings {
    pub url: String,
    pub max_pool_size: u32,
    pub min_pool_size: u32,
    pub connection_idle_lifetime: Duration,
    pub command_timeout: Duration,
}

impl Default for PgPoolSettings {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_pool_size: 16,
            min_pool_size: 1,
            connection_idle_lifetime: Duration::from_secs(300),
            command_timeout: Duration::from_secs(30),
        }
    }
}

/// Connects a pool with the given settings.
pub async fn connect_pool(settings: &PgPoolSettings) -> Result<PgPool, EconomyError> {
    Ok(PgPoolOptions::new()
        .max_connections(settings.max_pool_size)
        .min_connections(settings.min_pool_size)
        .idle_timeout(settings.connection_idle_lifetime)
        .acquire_timeout(settings.command_timeout)
        .connect(&settings.url)
        .await?)
}

pub struct PgWallet {
    pool: PgPool,
}

impl PgWallet {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn ledger_from_row(row: &sqlx::postgres::PgRow) -> Result<LedgerEntry, EconomyError> {
    Ok(LedgerEntry {
        id: row.try_get("id")?,
        user_id: UserId::new(row.try_get::<String, _>("user_id")?),
        amount: row.try_get("amount")?,
        balance_after: row.try_get("balance_after")?,
        entry_type: row.try_get("type")?,
        description: row.try_get("description")?,
        reference_id: row.try_get("reference_id")?,
        idempotency_key: row.try_get("idempotency_key")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl WalletRepository for PgWallet {
    async fn get_or_create_profile(
        &self,
        user_id: &UserId,
        initial_coins: i64,
    ) -> Result<PlayerProfile, EconomyError> {
        let row = sqlx::query(
            "INSERT INTO player_profiles (user_id, coins, version)
             VALUES ($1, $2, 1)
             ON CONFLICT (user_id) DO UPDATE SET user_id = EXCLUDED.user_id
             RETURNING user_id, coins, version",
        )
        .bind(user_id.as_str())
        .bind(initial_coins)
        .fetch_one(&self.pool)
        .await?;

        Ok(PlayerProfile {
            user_id: UserId::new(row.try_get::<String, _>("user_id")?),
            coins: row.try_get("coins")?,
            version: row.try_get("version")?,
        })
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
        for _ in 0..OCC_RETRIES {
            let profile = self.get_or_create_profile(user_id, initial_coins).await?;

            let balance_after = profile.coins + amount;
            if balance_after < 0 {
                return Err(EconomyError::InsufficientFunds {
                    balance: profile.coins,
                    requested: amount,
                });
            }

            let mut tx = self.pool.begin().await?;

            let updated = sqlx::query(
                "UPDATE player_profiles SET coins = $1, version = version + 1
                 WHERE user_id = $2 AND version = $3",
            )
            .bind(balance_after)
            .bind(user_id.as_str())
            .bind(profile.version)
            .execute(&mut *tx)
            .await?;

            if updated.rows_affected() == 0 {
                // Someone else moved the version; retry from a fresh read.
                tx.rollback().await?;
                continue;
            }

            let id = Uuid::new_v4().simple().to_string();
            let inserted = sqlx::query(
                "INSERT INTO wallet_transactions
                     (id, user_id, amount, balance_after, type, description,
                      reference_id, idempotency_key, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())
                 ON CONFLICT (idempotency_key) DO NOTHING
                 RETURNING id, user_id, amount, balance_after, type,
                           description, reference_id, idempotency_key, created_at",
            )
            .bind(&id)
            .bind(user_id.as_str())
            .bind(amount)
            .bind(balance_after)
            .bind(entry_type)
            .bind(description)
            .bind(reference_id)
            .bind(idempotency_key)
            .fetch_optional(&mut *tx)
            .await?;

            let Some(row) = inserted else {
                // The key already exists: the conflict rolls the balance
                // update back with the transaction.
                tx.rollback().await?;
                return Err(EconomyError::DuplicateTransaction(
                    idempotency_key.to_string(),
                ));
            };

            tx.commit().await?;
            return ledger_from_row(&row);
        }

        Err(EconomyError::ConcurrencyConflict(user_id.to_string()))
    }

    async fn balance(&self, user_id: &UserId) -> Result<Option<i64>, EconomyError> {
        let row = sqlx::query("SELECT coins FROM player_profiles WHERE user_id = $1")
            .bind(user_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(row) => Some(row.try_get("coins")?),
            None => None,
        })
    }

    async fn ledger(&self, user_id: &UserId) -> Result<Vec<LedgerEntry>, EconomyError> {
        let rows = sqlx::query(
            "SELECT id, user_id, amount, balance_after, type, description,
                    reference_id, idempotency_key, created_at
             FROM wallet_transactions WHERE user_id = $1 ORDER BY created_at",
        )
        .bind(user_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(ledger_from_row).collect()
    }
}

pub struct PgOutbox {
    pool: PgPool,
}

impl PgOutbox {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn outbox_from_row(row: &sqlx::postgres::PgRow) -> Result<OutboxRecord, EconomyError> {
    Ok(OutboxRecord {
        id: row.try_get("id")?,
        event_type: row.try_get("event_type")?,
        payload: row.try_get("payload")?,
        attempts: row.try_get("attempts")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        processed_at: row.try_get("processed_at")?,
    })
}

#[async_trait]
impl OutboxRepository for PgOutbox {
    async fn enqueue(&self, event_type: &str, payload: Value) -> Result<String, EconomyError> {
        let id = Uuid::new_v4().simple().to_string();
        sqlx::query(
            "INSERT INTO outbox_messages (id, event_type, payload, attempts, created_at)
             VALUES ($1, $2, $3, 0, NOW())",
        )
        .bind(&id)
        .bind(event_type)
        .bind(payload)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    async fn fetch_due(
        &self,
        limit: usize,
        max_attempts: i32,
    ) -> Result<Vec<OutboxRecord>, EconomyError> {
        let rows = sqlx::query(
            "SELECT id, event_type, payload, attempts, last_error, created_at, processed_at
             FROM outbox_messages
             WHERE processed_at IS NULL AND attempts < $1
             ORDER BY created_at
             LIMIT $2",
        )
        .bind(max_attempts)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(outbox_from_row).collect()
    }

    async fn mark_processed(&self, id: &str) -> Result<bool, EconomyError> {
        let updated = sqlx::query(
            "UPDATE outbox_messages SET processed_at = NOW()
             WHERE id = $1 AND processed_at IS NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() > 0)
    }

    async fn mark_failed(&self, id: &str, error: &str) -> Result<(), EconomyError> {
        sqlx::query(
            "UPDATE outbox_messages SET attempts = attempts + 1, last_error = $2
             WHERE id = $1",
        )
        .bind(id)
        .bind(truncate_error(error))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn purge(&self, cutoff: DateTime<Utc>, max_attempts: i32) -> Result<u64, EconomyError> {
        let deleted = sqlx::query(
            "DELETE FROM outbox_messages
             WHERE (processed_at IS NOT NULL AND processed_at < $1)
                OR (attempts >= $2 AND created_at < $1)",
        )
        .bind(cutoff)
        .bind(max_attempts)
        .execute(&self.pool)
        .await?;
        Ok(deleted.rows_affected())
    }
}

pub struct PgArchive {
    pool: PgPool,
}

impl PgArchive {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ArchiveRepository for PgArchive {
    async fn insert(&self, game: &ArchivedGame) -> Result<(), EconomyError> {
        sqlx::query(
            "INSERT INTO archived_games
                 (id, room_id, game_type, final_state_json, player_seats_json,
                  winner_user_id, total_pot, started_at, ended_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             ON CONFLICT (room_id) DO NOTHING",
        )
        .bind(&game.id)
        .bind(&game.room_id)
        .bind(&game.game_type)
        .bind(&game.final_state_json)
        .bind(&game.player_seats_json)
        .bind(game.winner_user_id.as_ref().map(|u| u.as_str()))
        .bind(game.total_pot)
        .bind(game.started_at)
        .bind(game.ended_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn by_room(&self, room_id: &str) -> Result<Option<ArchivedGame>, EconomyError> {
        let row = sqlx::query(
            "SELECT id, room_id, game_type, final_state_json, player_seats_json,
                    winner_user_id, total_pot, started_at, ended_at
             FROM archived_games WHERE room_id = $1",
        )
        .bind(room_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };
        Ok(Some(ArchivedGame {
            id: row.try_get("id")?,
            room_id: row.try_get("room_id")?,
            game_type: row.try_get("game_type")?,
            final_state_json: row.try_get("final_state_json")?,
            player_seats_json: row.try_get("player_seats_json")?,
            winner_user_id: row
                .try_get::<Option<String>, _>("winner_user_id")?
                .map(UserId::new),
            total_pot: row.try_get("total_pot")?,
            started_at: row.try_get("started_at")?,
            ended_at: row.try_get("ended_at")?,
        }))
    }
}
