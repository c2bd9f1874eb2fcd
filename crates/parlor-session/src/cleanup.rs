//! The session cleanup worker.
//!
//! Runs on every node (not leader-gated): tickets are consumed through
//! the registry's take-once path, so two nodes sweeping at the same
//! moment cannot both act on one ticket. Each expired ticket unseats the
//! user from their room and tells the room they left for good.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parlor_protocol::RoomMessage;
use parlor_room::{Broadcaster, ModuleRegistry, RoomError};
use parlor_store::RoomRegistry;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct CleanupWorkerConfig {
    pub sweep_interval: Duration,
    pub batch_size: usize,
}

impl Default for CleanupWorkerConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(1),
            batch_size: 100,
        }
    }
}

pub struct CleanupWorker {
    registry: Arc<RoomRegistry>,
    modules: Arc<ModuleRegistry>,
    broadcaster: Arc<Broadcaster>,
    config: CleanupWorkerConfig,
}

impl CleanupWorker {
    pub fn new(
        registry: Arc<RoomRegistry>,
        modules: Arc<ModuleRegistry>,
        broadcaster: Arc<Broadcaster>,
        config: CleanupWorkerConfig,
    ) -> Self {
        Self {
            registry,
            modules,
            broadcaster,
            config,
        }
    }

    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!("session cleanup worker started");
            let mut sweep = tokio::time::interval(self.config.sweep_interval);
            loop {
                tokio::select! {
                    _ = sweep.tick() => {
                        if let Err(e) = self.sweep_once().await {
                            tracing::error!(error = %e, "session cleanup sweep failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            tracing::info!("session cleanup worker stopping");
                            break;
                        }
                    }
                }
            }
        })
    }

    /// One sweep over expired tickets. Returns how many were handled.
    pub async fn sweep_once(&self) -> Result<usize, RoomError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        let expired = self
            .registry
            .expired_tickets(now, self.config.batch_size)
            .await?;
        let handled = expired.len();

        for (user_id, room_id) in expired {
            let Some(game_type) = self.registry.game_type_of(&room_id).await? else {
                // The room died before the grace elapsed; just clear the
                // user's claim.
                self.registry.clear_user_room(&user_id).await?;
                continue;
            };
            let Some(module) = self.modules.get(&game_type) else {
                self.registry.clear_user_room(&user_id).await?;
                continue;
            };

            tracing::info!(%user_id, %room_id, "grace period elapsed, removing player");
            if let Err(e) = module.service.leave_room(&room_id, &user_id).await {
                tracing::warn!(%user_id, %room_id, error = %e, "grace-period leave failed");
                // The claim must not stick around either way.
                self.registry.clear_user_room(&user_id).await?;
            }
            self.broadcaster.publish(
                &room_id,
                RoomMessage::PlayerLeft {
                    user_id: user_id.clone(),
                    user_name: user_id.to_string(),
                },
            );
        }
        Ok(handled)
    }
}
