//! The outbox + archival worker.
//!
//! Every node runs one; rows are the only coordination point. Each cycle
//! reads a batch of unprocessed rows, dispatches on the event type, and
//! marks the row processed on success or bumps its attempt counter on
//! failure. `GameEnded` is the one event type the core requires: its
//! handler applies payouts and writes the archive row, both idempotent,
//! so a crash between the two is healed by the next retry.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use parlor_protocol::{RoomId, UserId};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::{ArchiveRepository, ArchivedGame, Economy, EconomyError, OutboxRepository};

/// The event type every game module's end-of-game flows produce.
pub const GAME_ENDED_EVENT: &str = "GameEnded";

/// Payload of a `GameEnded` outbox row, written by the room runtime
/// before the room lock is released.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameEndedPayload {
    pub room_id: RoomId,
    pub game_type: String,
    pub final_state: serde_json::Value,
    pub seats: BTreeMap<UserId, u8>,
    #[serde(default)]
    pub winner_user_id: Option<UserId>,
    #[serde(default)]
    pub ranking: Option<Vec<UserId>>,
    pub total_pot: i64,
    /// Unix seconds.
    pub started_at: i64,
    pub ended_at: i64,
}

#[derive(Debug, Clone)]
pub struct OutboxWorkerConfig {
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub max_attempts: i32,
    /// Age past which processed (or dead) rows are purged.
    pub purge_after: Duration,
    pub purge_interval: Duration,
}

impl Default for OutboxWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 100,
            max_attempts: 5,
            purge_after: Duration::from_secs(7 * 24 * 3600),
            purge_interval: Duration::from_secs(3600),
        }
    }
}

pub struct OutboxWorker {
    outbox: Arc<dyn OutboxRepository>,
    archive: Arc<dyn ArchiveRepository>,
    economy: Arc<Economy>,
    config: OutboxWorkerConfig,
}

impl OutboxWorker {
    pub fn new(
        outbox: Arc<dyn OutboxRepository>,
        archive: Arc<dyn ArchiveRepository>,
        economy: Arc<Economy>,
        config: OutboxWorkerConfig,
    ) -> Self {
        Self {
            outbox,
            archive,
            economy,
            config,
        }
    }

    /// Spawns the worker loop; it drains until the shutdown signal flips.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!("outbox worker started");
            let mut poll = tokio::time::interval(self.config.poll_interval);
            let mut purge = tokio::time::interval(self.config.purge_interval);

            loop {
                tokio::select! {
                    _ = poll.tick() => {
                        if let Err(e) = self.drain_once().await {
                            tracing::error!(error = %e, "outbox drain failed");
                        }
                    }
                    _ = purge.tick() => {
                        if let Err(e) = self.purge_once().await {
                            tracing::error!(error = %e, "outbox purge failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            tracing::info!("outbox worker stopping");
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Processes one batch. Returns how many rows were handled
    /// successfully.
    pub async fn drain_once(&self) -> Result<u64, EconomyError> {
        let rows = self
            .outbox
            .fetch_due(self.config.batch_size, self.config.max_attempts)
            .await?;
        let mut processed = 0;

        for row in rows {
            match self.handle(&row.event_type, &row.payload).await {
                Ok(()) => {
                    if self.outbox.mark_processed(&row.id).await? {
                        processed += 1;
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        outbox_id = %row.id,
                        event_type = %row.event_type,
                        attempts = row.attempts + 1,
                        error = %e,
                        "outbox row failed"
                    );
                    self.outbox.mark_failed(&row.id, &e.to_string()).await?;
                }
            }
        }
        Ok(processed)
    }

    /// Deletes rows past the retention window.
    pub async fn purge_once(&self) -> Result<u64, EconomyError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.purge_after)
                .unwrap_or_else(|_| chrono::Duration::days(7));
        let purged = self.outbox.purge(cutoff, self.config.max_attempts).await?;
        if purged > 0 {
            tracing::info!(purged, "outbox rows purged");
        }
        Ok(purged)
    }

    async fn handle(&self, event_type: &str, payload: &serde_json::Value) -> Result<(), EconomyError> {
        match event_type {
            GAME_ENDED_EVENT => self.handle_game_ended(payload).await,
            other => Err(EconomyError::UnknownEventType(other.to_string())),
        }
    }

    async fn handle_game_ended(&self, payload: &serde_json::Value) -> Result<(), EconomyError> {
        let payload: GameEndedPayload = serde_json::from_value(payload.clone())?;

        self.economy
            .process_game_payouts(
                &payload.room_id,
                &payload.game_type,
                payload.total_pot,
                &payload.seats,
                payload.winner_user_id.as_ref(),
                payload.ranking.as_deref(),
            )
            .await?;

        let archived = ArchivedGame {
            id: Uuid::new_v4().simple().to_string(),
            room_id: payload.room_id.to_string(),
            game_type: payload.game_type.clone(),
            final_state_json: payload.final_state.clone(),
            player_seats_json: serde_json::to_value(&payload.seats)?,
            winner_user_id: payload.winner_user_id.clone(),
            total_pot: payload.total_pot,
            started_at: Utc.timestamp_opt(payload.started_at, 0).single().unwrap_or_else(Utc::now),
            ended_at: Utc.timestamp_opt(payload.ended_at, 0).single().unwrap_or_else(Utc::now),
        };
        self.archive.insert(&archived).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryArchive, MemoryOutbox, MemoryWallet, WalletRepository};

    fn uid(s: &str) -> UserId {
        UserId::new(s)
    }

    struct Rig {
        outbox: Arc<MemoryOutbox>,
        archive: Arc<MemoryArchive>,
        wallet: Arc<MemoryWallet>,
        worker: OutboxWorker,
    }

    fn rig() -> Rig {
        let outbox = Arc::new(MemoryOutbox::new());
        let archive = Arc::new(MemoryArchive::new());
        let wallet = Arc::new(MemoryWallet::new());
        let economy = Arc::new(Economy::new(wallet.clone(), 500, 3));
        let worker = OutboxWorker::new(
            outbox.clone(),
            archive.clone(),
            economy,
            OutboxWorkerConfig::default(),
        );
        Rig {
            outbox,
            archive,
            wallet,
            worker,
        }
    }

    fn payload(winner: Option<&str>) -> GameEndedPayload {
        let mut seats = BTreeMap::new();
        seats.insert(uid("a"), 0);
        seats.insert(uid("b"), 1);
        GameEndedPayload {
            room_id: RoomId::parse("cafe01").unwrap(),
            game_type: "sprint".into(),
            final_state: serde_json::json!({ "positions": [30, 12] }),
            seats,
            winner_user_id: winner.map(uid),
            ranking: None,
            total_pot: 200,
            started_at: 1_700_000_000,
            ended_at: 1_700_000_600,
        }
    }

    #[tokio::test]
    async fn test_game_ended_pays_out_and_archives() {
        let rig = rig();
        rig.outbox
            .enqueue(GAME_ENDED_EVENT, serde_json::to_value(payload(Some("a"))).unwrap())
            .await
            .unwrap();

        let processed = rig.worker.drain_once().await.unwrap();
        assert_eq!(processed, 1);

        // 200 - 3% = 194 to the winner on top of the 500 grant.
        assert_eq!(rig.wallet.balance(&uid("a")).await.unwrap(), Some(694));
        let archived = rig.archive.by_room("cafe01").await.unwrap().unwrap();
        assert_eq!(archived.winner_user_id, Some(uid("a")));
        assert_eq!(archived.total_pot, 200);

        let rows = rig.outbox.snapshot();
        assert!(rows[0].processed_at.is_some());
    }

    #[tokio::test]
    async fn test_failed_rows_retry_then_succeed_exactly_once() {
        let rig = rig();
        // An unknown event type fails until we rewrite it; simulate three
        // failures by enqueueing a bad row and draining.
        let bad = rig
            .outbox
            .enqueue("NotAThing", serde_json::json!({}))
            .await
            .unwrap();
        for expected_attempts in 1..=3 {
            rig.worker.drain_once().await.unwrap();
            let row = rig
                .outbox
                .snapshot()
                .into_iter()
                .find(|r| r.id == bad)
                .unwrap();
            assert_eq!(row.attempts, expected_attempts);
            assert!(row.processed_at.is_none());
            assert!(row.last_error.is_some());
        }
    }

    #[tokio::test]
    async fn test_rows_stop_retrying_at_attempt_cap() {
        let rig = rig();
        rig.outbox
            .enqueue("NotAThing", serde_json::json!({}))
            .await
            .unwrap();
        for _ in 0..8 {
            rig.worker.drain_once().await.unwrap();
        }
        let row = &rig.outbox.snapshot()[0];
        assert_eq!(row.attempts, rig.worker.config.max_attempts);
    }

    #[tokio::test]
    async fn test_replayed_game_ended_row_credits_once() {
        let rig = rig();
        let value = serde_json::to_value(payload(Some("a"))).unwrap();
        rig.outbox.enqueue(GAME_ENDED_EVENT, value.clone()).await.unwrap();
        rig.outbox.enqueue(GAME_ENDED_EVENT, value).await.unwrap();

        rig.worker.drain_once().await.unwrap();

        // Two rows, both processed, but the win:<room>:<user> key and the
        // per-room archive guard keep the effects single.
        assert_eq!(rig.wallet.balance(&uid("a")).await.unwrap(), Some(694));
        assert!(rig.archive.by_room("cafe01").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_malformed_payload_is_counted_as_failure() {
        let rig = rig();
        rig.outbox
            .enqueue(GAME_ENDED_EVENT, serde_json::json!({ "nope": true }))
            .await
            .unwrap();
        let processed = rig.worker.drain_once().await.unwrap();
        assert_eq!(processed, 0);
        assert_eq!(rig.outbox.snapshot()[0].attempts, 1);
    }
}
