//! The turn-timeout scheduler.
//!
//! Exactly one node drives timeouts at a time: the leader holds
//! `leader:gameloop` (15 s TTL) and extends it every tick; everyone else
//! sleeps. Per tick the leader pulls due rooms per turn-based game type
//! from the due index and invokes each engine's timeout hook under the
//! room lock, with bounded parallelism. The same sweep ages out rooms
//! with no recent activity.
//!
//! The due entry is removed unconditionally after the hook runs — an
//! engine that declines to act is not revisited every tick, and only an
//! engine-authored turn start produces a fresh entry.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::stream::{self, StreamExt};
use parlor_room::{CommandExecutor, ModuleRegistry, RoomError};
use parlor_store::{keys, Kv, RoomRegistry};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct GameLoopConfig {
    /// Sweep cadence.
    pub tick_interval: Duration,
    /// Due rooms pulled per game type per tick.
    pub max_rooms_per_tick: usize,
    /// Rooms processed concurrently within one tick.
    pub sweep_concurrency: usize,
    /// Leader lock TTL; refreshed every tick.
    pub leader_ttl: Duration,
    /// A room idle longer than this is evicted.
    pub idle_room_after: Duration,
    /// Idle rooms evicted per game type per tick.
    pub idle_batch: usize,
}

impl Default for GameLoopConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(5000),
            max_rooms_per_tick: 50,
            sweep_concurrency: 10,
            leader_ttl: Duration::from_secs(15),
            idle_room_after: Duration::from_secs(3600),
            idle_batch: 20,
        }
    }
}

impl GameLoopConfig {
    /// Clamps out-of-range values so the config is safe to run.
    pub fn validated(mut self) -> Self {
        if self.tick_interval < Duration::from_millis(100) {
            tracing::warn!(
                interval_ms = self.tick_interval.as_millis() as u64,
                "tick interval too small — clamping to 100ms"
            );
            self.tick_interval = Duration::from_millis(100);
        }
        if self.sweep_concurrency == 0 {
            self.sweep_concurrency = 1;
        }
        if self.leader_ttl <= self.tick_interval {
            // The lock must outlive a tick or leadership flaps.
            self.leader_ttl = self.tick_interval * 3;
        }
        self
    }
}

pub struct TurnTimeoutScheduler {
    kv: Arc<dyn Kv>,
    registry: Arc<RoomRegistry>,
    executor: Arc<CommandExecutor>,
    modules: Arc<ModuleRegistry>,
    config: GameLoopConfig,
    worker_id: String,
}

impl TurnTimeoutScheduler {
    pub fn new(
        kv: Arc<dyn Kv>,
        registry: Arc<RoomRegistry>,
        executor: Arc<CommandExecutor>,
        modules: Arc<ModuleRegistry>,
        config: GameLoopConfig,
    ) -> Self {
        Self {
            kv,
            registry,
            executor,
            modules,
            config: config.validated(),
            worker_id: Uuid::new_v4().simple().to_string(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(worker_id = %self.worker_id, "game loop started");
            let mut tick = tokio::time::interval(self.config.tick_interval);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        match self.try_lead().await {
                            Ok(true) => {
                                if let Err(e) = self.tick_once().await {
                                    tracing::error!(error = %e, "timeout sweep failed");
                                }
                            }
                            Ok(false) => {
                                tracing::trace!("not the leader, sleeping");
                            }
                            Err(e) => {
                                tracing::error!(error = %e, "leader check failed");
                            }
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            tracing::info!("game loop stopping");
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Acquires or extends leadership. Holding the lock means this node
    /// drives every timeout until the TTL lapses.
    pub async fn try_lead(&self) -> Result<bool, RoomError> {
        let token = self.worker_id.as_bytes();
        // Already the leader? Extend.
        if self
            .kv
            .expire_if_equal(keys::LEADER_GAMELOOP, token, self.config.leader_ttl)
            .await
            .map_err(parlor_store::StoreError::from)?
        {
            return Ok(true);
        }
        // Vacant? Take it.
        let acquired = self
            .kv
            .set_nx_ex(
                keys::LEADER_GAMELOOP,
                token.to_vec(),
                self.config.leader_ttl,
            )
            .await
            .map_err(parlor_store::StoreError::from)?;
        if acquired {
            tracing::info!(worker_id = %self.worker_id, "acquired game loop leadership");
        }
        Ok(acquired)
    }

    /// One leader tick: sweep due rooms and evict idle ones, per
    /// turn-based game type.
    pub async fn tick_once(&self) -> Result<(), RoomError> {
        for module in self.modules.turn_based_modules() {
            self.sweep_game_type(&module.game_type).await?;
        }
        for module in self.modules.modules() {
            self.evict_idle(&module.game_type).await?;
        }
        Ok(())
    }

    async fn sweep_game_type(&self, game_type: &str) -> Result<(), RoomError> {
        let due = self
            .registry
            .rooms_due_for_timeout(game_type, unix_now(), self.config.max_rooms_per_tick)
            .await?;
        if due.is_empty() {
            return Ok(());
        }
        tracing::debug!(game_type, rooms = due.len(), "sweeping due rooms");

        stream::iter(due)
            .for_each_concurrent(self.config.sweep_concurrency, |room_id| {
                let executor = Arc::clone(&self.executor);
                let game_type = game_type.to_string();
                async move {
                    match executor.run_turn_timeout(&game_type, &room_id).await {
                        Ok(acted) => {
                            tracing::debug!(%room_id, acted, "timeout hook ran");
                        }
                        Err(RoomError::LockContention(_)) => {
                            // Another worker owns the room this instant;
                            // the due entry stays for the next tick.
                            tracing::debug!(%room_id, "room locked, skipping");
                        }
                        Err(e) => {
                            tracing::warn!(%room_id, error = %e, "timeout hook failed");
                        }
                    }
                }
            })
            .await;
        Ok(())
    }

    async fn evict_idle(&self, game_type: &str) -> Result<(), RoomError> {
        let cutoff = unix_now() - self.config.idle_room_after.as_secs() as i64;
        let idle = self
            .registry
            .idle_rooms(game_type, cutoff, self.config.idle_batch)
            .await?;
        for room_id in idle {
            if let Err(e) = self.executor.evict_room(game_type, &room_id).await {
                tracing::warn!(%room_id, error = %e, "idle eviction failed");
            }
        }
        Ok(())
    }
}
