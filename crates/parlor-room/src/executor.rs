//! The spine of one command.
//!
//! `hub → validation → registry lookup → dispatcher → room lock → engine
//! → outbox on game end → unlock → broadcast`. The executor owns
//! everything after the dispatcher: it is the only code that takes the
//! per-room lock for hub commands, and the scheduler reuses its timeout
//! path so the two flows cannot drift apart.

use std::sync::Arc;
use std::time::Duration;

use parlor_economy::{GameEndedPayload, OutboxRepository, GAME_ENDED_EVENT};
use parlor_protocol::{RoomId, RoomMeta, UserId};
use parlor_store::{RoomRegistry, RoomStore};

use crate::service::unix_now;
use crate::{
    ActionResult, Broadcaster, Command, CommandDispatcher, GameEnded, ModuleRegistry, RoomError,
};

/// How long the per-room lock may be contended before the command gives
/// up with `LockContention`.
const LOCK_TTL: Duration = Duration::from_secs(1);

pub struct CommandExecutor {
    dispatcher: Arc<CommandDispatcher>,
    store: Arc<RoomStore>,
    registry: Arc<RoomRegistry>,
    broadcaster: Arc<Broadcaster>,
    modules: Arc<ModuleRegistry>,
    outbox: Arc<dyn OutboxRepository>,
}

impl CommandExecutor {
    pub fn new(
        dispatcher: Arc<CommandDispatcher>,
        store: Arc<RoomStore>,
        broadcaster: Arc<Broadcaster>,
        modules: Arc<ModuleRegistry>,
        outbox: Arc<dyn OutboxRepository>,
    ) -> Arc<Self> {
        let registry = store.registry().clone();
        Arc::new(Self {
            dispatcher,
            store,
            registry,
            broadcaster,
            modules,
            outbox,
        })
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    pub fn modules(&self) -> &Arc<ModuleRegistry> {
        &self.modules
    }

    /// Runs one user command through the room's serialized timeline.
    pub async fn perform_action(
        self: &Arc<Self>,
        room_id: &RoomId,
        user_id: &UserId,
        action: &str,
        payload: serde_json::Value,
    ) -> Result<ActionResult, RoomError> {
        let game_type = self
            .registry
            .game_type_of(room_id)
            .await?
            .ok_or_else(|| RoomError::NotFound(room_id.clone()))?;

        let this = Arc::clone(self);
        let room = room_id.clone();
        let command = Command {
            user_id: user_id.clone(),
            action: action.to_string(),
            payload,
        };

        self.dispatcher
            .dispatch(room_id, async move {
                this.execute_locked(&game_type, &room, command).await
            })
            .await?
    }

    /// The lock → execute → side-effects window for one command.
    async fn execute_locked(
        self: &Arc<Self>,
        game_type: &str,
        room_id: &RoomId,
        command: Command,
    ) -> Result<ActionResult, RoomError> {
        let module = self
            .modules
            .get(game_type)
            .ok_or_else(|| RoomError::UnknownGameType(game_type.to_string()))?
            .clone();

        let Some(lock) = self.store.try_lock(game_type, room_id, LOCK_TTL).await? else {
            return Err(RoomError::LockContention(room_id.clone()));
        };

        let outcome = module.engine.execute(room_id, command).await;

        // Effects that must land while the lock is held.
        let result = match &outcome {
            Ok(result) if result.success => {
                self.after_success(game_type, room_id, result, module.engine.turn_timeout())
                    .await
            }
            _ => Ok(()),
        };

        self.store.unlock(lock).await?;

        let outcome = outcome?;
        result?;

        // Broadcasts happen after unlock; per-room order is preserved by
        // the dispatcher's serialized timeline.
        if outcome.success {
            self.broadcaster.publish_result(room_id, &outcome, unix_now());
            if outcome.game_ended.is_some() {
                self.finish_room(game_type, room_id).await?;
            }
        }
        Ok(outcome)
    }

    /// Registry and outbox effects of a successful action, under the
    /// room lock.
    async fn after_success(
        &self,
        game_type: &str,
        room_id: &RoomId,
        result: &ActionResult,
        turn_timeout: Option<Duration>,
    ) -> Result<(), RoomError> {
        let now = unix_now();
        self.registry.touch_activity(game_type, room_id, now).await?;

        if let Some(ended) = &result.game_ended {
            self.registry
                .unregister_turn_timeout(game_type, room_id)
                .await?;
            self.enqueue_game_ended(game_type, room_id, ended).await?;
            return Ok(());
        }

        // The engine is the sole author of new due entries: it records
        // the new turn start in meta, and we index it.
        if let Some(timeout) = turn_timeout {
            if result.new_state.is_some() {
                if let Some(meta) = self.store.load_meta(game_type, room_id).await? {
                    if let Some(started) = meta.turn_started_at {
                        self.registry
                            .register_turn_timeout(
                                game_type,
                                room_id,
                                started + timeout.as_secs() as i64,
                            )
                            .await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Writes the `GameEnded` outbox record. Must run before the room
    /// lock is released so the room cannot advance past its own ending.
    async fn enqueue_game_ended(
        &self,
        game_type: &str,
        room_id: &RoomId,
        ended: &GameEnded,
    ) -> Result<(), RoomError> {
        let meta = self
            .store
            .load_meta(game_type, room_id)
            .await?
            .unwrap_or_else(|| RoomMeta::new(game_type, 0, unix_now()));

        let payload = GameEndedPayload {
            room_id: room_id.clone(),
            game_type: game_type.to_string(),
            final_state: ended.final_state.clone(),
            seats: meta.seats.clone(),
            winner_user_id: ended.winner_user_id.clone(),
            ranking: ended.ranking.clone(),
            total_pot: meta.total_pot(),
            started_at: meta.created_at,
            ended_at: unix_now(),
        };
        let payload = serde_json::to_value(&payload)
            .map_err(parlor_economy::EconomyError::MalformedPayload)?;
        let outbox_id = self.outbox.enqueue(GAME_ENDED_EVENT, payload).await?;
        tracing::info!(%room_id, game_type, outbox_id, "game ended, outbox record written");
        Ok(())
    }

    /// Tears a finished room down after its final broadcast.
    async fn finish_room(&self, game_type: &str, room_id: &RoomId) -> Result<(), RoomError> {
        if let Some(meta) = self.store.load_meta(game_type, room_id).await? {
            for user in meta.seats.keys() {
                self.registry.clear_user_room(user).await?;
            }
        }
        self.store.delete(game_type, room_id).await?;
        self.broadcaster.drop_room(room_id);
        Ok(())
    }

    /// The scheduler's per-room step: lock, invoke the engine's timeout
    /// hook, unconditionally drop the stale due entry, then apply the
    /// same side effects as a hub command.
    ///
    /// Returns `true` if the engine acted.
    pub async fn run_turn_timeout(
        self: &Arc<Self>,
        game_type: &str,
        room_id: &RoomId,
    ) -> Result<bool, RoomError> {
        let module = self
            .modules
            .get(game_type)
            .ok_or_else(|| RoomError::UnknownGameType(game_type.to_string()))?
            .clone();

        let Some(lock) = self.store.try_lock(game_type, room_id, LOCK_TTL).await? else {
            // Contended: leave the due entry alone; the next tick
            // retries.
            return Err(RoomError::LockContention(room_id.clone()));
        };

        let outcome = module.engine.check_timeouts(room_id).await;

        // The stale entry goes regardless of what the engine said — a
        // declining engine must not be revisited every tick.
        self.registry
            .unregister_turn_timeout(game_type, room_id)
            .await?;

        let effects = match &outcome {
            Ok(Some(result)) if result.success => {
                self.after_success(game_type, room_id, result, module.engine.turn_timeout())
                    .await
            }
            _ => Ok(()),
        };

        self.store.unlock(lock).await?;

        let outcome = outcome?;
        effects?;

        match outcome {
            Some(result) if result.success => {
                self.broadcaster.publish_result(room_id, &result, unix_now());
                if result.game_ended.is_some() {
                    self.finish_room(game_type, room_id).await?;
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Deletes an idle room (activity-sweep eviction).
    pub async fn evict_room(&self, game_type: &str, room_id: &RoomId) -> Result<(), RoomError> {
        tracing::info!(%room_id, game_type, "evicting idle room");
        self.finish_room(game_type, room_id).await
    }
}
