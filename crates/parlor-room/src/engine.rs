//! The game module contract — the extension point for rule engines.
//!
//! A module registers exactly one [`GameEngine`] and one [`RoomService`]
//! for its game type. The runtime drives every hub action through the
//! engine; the engine owns its rules and its state layout, and the
//! runtime owns locking, dispatch, broadcast, and money.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parlor_protocol::{RoomId, RoomMeta, UserId};

use crate::RoomError;

/// One command from one user, already validated at the hub boundary.
#[derive(Debug, Clone)]
pub struct Command {
    pub user_id: UserId,
    pub action: String,
    pub payload: serde_json::Value,
}

/// A module-defined event emitted by an action.
#[derive(Debug, Clone, PartialEq)]
pub struct GameEvent {
    pub name: String,
    pub data: serde_json::Value,
}

/// Set when an action (or timeout) finished the game.
#[derive(Debug, Clone, PartialEq)]
pub struct GameEnded {
    pub winner_user_id: Option<UserId>,
    pub ranking: Option<Vec<UserId>>,
    pub final_state: serde_json::Value,
}

/// The outcome of one engine invocation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ActionResult {
    pub success: bool,
    pub error: Option<String>,
    /// JSON snapshot of the new state, present when the state changed.
    pub new_state: Option<serde_json::Value>,
    pub events: Vec<GameEvent>,
    pub game_ended: Option<GameEnded>,
}

impl ActionResult {
    pub fn ok(new_state: serde_json::Value) -> Self {
        Self {
            success: true,
            new_state: Some(new_state),
            ..Self::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn with_event(mut self, name: impl Into<String>, data: serde_json::Value) -> Self {
        self.events.push(GameEvent {
            name: name.into(),
            data,
        });
        self
    }

    pub fn ended(mut self, ended: GameEnded) -> Self {
        self.game_ended = Some(ended);
        self
    }
}

/// Everything `GetState` returns for one room.
#[derive(Debug, Clone)]
pub struct StateResponse {
    pub room_id: RoomId,
    pub game_type: String,
    pub meta: RoomMeta,
    pub state: serde_json::Value,
    pub legal_moves: Vec<String>,
}

/// A rule engine for one game type. One singleton per process.
///
/// `execute` and `check_timeouts` run under the caller-held room lock and
/// are responsible for their own load → apply → save against the room
/// store. Everything else is read-only.
#[async_trait]
pub trait GameEngine: Send + Sync {
    fn game_type(&self) -> &str;

    /// Applies one command. Rule violations come back as
    /// `ActionResult::error(..)`; infrastructure failures as `Err`.
    async fn execute(&self, room_id: &RoomId, command: Command) -> Result<ActionResult, RoomError>;

    /// Actions currently legal for this user (typically the turn holder).
    async fn legal_actions(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
    ) -> Result<Vec<String>, RoomError>;

    /// Full state view, or `None` if the room is gone.
    async fn state(&self, room_id: &RoomId) -> Result<Option<StateResponse>, RoomError>;

    /// Batched state view for lobby and admin pages; missing rooms are
    /// omitted.
    async fn states(&self, room_ids: &[RoomId]) -> Result<Vec<StateResponse>, RoomError> {
        let mut out = Vec::with_capacity(room_ids.len());
        for id in room_ids {
            if let Some(resp) = self.state(id).await? {
                out.push(resp);
            }
        }
        Ok(out)
    }

    /// Batched meta view; missing rooms are omitted.
    async fn metas(&self, room_ids: &[RoomId]) -> Result<Vec<(RoomId, RoomMeta)>, RoomError>;

    /// Turn budget for this engine, or `None` for games with no turn
    /// concept (single-player reveal games). Engines returning `Some`
    /// are swept by the timeout scheduler.
    fn turn_timeout(&self) -> Option<Duration> {
        None
    }

    /// Invoked by the scheduler under the room lock when the room's due
    /// entry matured. Return `None` to decline (nothing to do); the
    /// scheduler removes the stale due entry either way, so declining
    /// can never spin.
    async fn check_timeouts(&self, _room_id: &RoomId) -> Result<Option<ActionResult>, RoomError> {
        Ok(None)
    }
}

/// Room lifecycle operations for one game type.
#[async_trait]
pub trait RoomService: Send + Sync {
    /// Creates a room from prepared meta; returns its id.
    async fn create_room(&self, meta: RoomMeta) -> Result<RoomId, RoomError>;

    /// Seats a user at the lowest free seat, reserving the entry fee
    /// first and refunding it if the seat write fails.
    async fn join_room(&self, room_id: &RoomId, user_id: &UserId) -> Result<u8, RoomError>;

    async fn leave_room(&self, room_id: &RoomId, user_id: &UserId) -> Result<(), RoomError>;

    async fn room_meta(&self, room_id: &RoomId) -> Result<Option<RoomMeta>, RoomError>;

    async fn delete_room(&self, room_id: &RoomId) -> Result<(), RoomError>;
}

/// What a module exports at process init.
#[derive(Clone)]
pub struct GameModule {
    pub game_type: String,
    pub engine: Arc<dyn GameEngine>,
    pub service: Arc<dyn RoomService>,
    /// Optional JSON schema for the module's action payloads, served to
    /// tooling; the runtime does not interpret it.
    pub json_schema: Option<serde_json::Value>,
}

/// The registration table keyed by game type. Built once at init,
/// immutable afterwards.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: HashMap<String, GameModule>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, module: GameModule) {
        tracing::info!(game_type = %module.game_type, "game module registered");
        self.modules.insert(module.game_type.clone(), module);
    }

    pub fn get(&self, game_type: &str) -> Option<&GameModule> {
        self.modules.get(game_type)
    }

    pub fn modules(&self) -> impl Iterator<Item = &GameModule> {
        self.modules.values()
    }

    /// Modules whose engine has a turn concept — the set the timeout
    /// scheduler sweeps.
    pub fn turn_based_modules(&self) -> impl Iterator<Item = &GameModule> {
        self.modules
            .values()
            .filter(|m| m.engine.turn_timeout().is_some())
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}
