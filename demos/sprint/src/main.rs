//! Sprint: a 4-player race demo on the Parlor runtime.
//!
//! Rules: the creator starts the race once at least two players are
//! seated. Players take turns rolling a die and advancing; first to the
//! end of the track wins the pot. A player who idles through their
//! 30-second turn is skipped by the timeout sweep.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parlor::prelude::*;
use rand::Rng;
use serde::{Deserialize, Serialize};

const GAME_TYPE: &str = "sprint";
const MAX_SEATS: usize = 4;
const NO_WINNER: u8 = 0xFF;
const TURN_TIMEOUT: Duration = Duration::from_secs(30);

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SprintState {
    /// Track position per seat; unseated slots stay 0.
    positions: [u8; MAX_SEATS],
    current_turn: u8,
    last_roll: u8,
    winner_seat: u8,
    started: u8,
    track_length: u8,
}

impl GameState for SprintState {
    const VERSION: u8 = 1;
    const ENCODED_SIZE: usize = MAX_SEATS + 5;
}

impl SprintState {
    fn fresh(track_length: u8) -> Self {
        Self {
            positions: [0; MAX_SEATS],
            current_turn: 0,
            last_roll: 0,
            winner_seat: NO_WINNER,
            started: 0,
            track_length,
        }
    }

    fn view(&self) -> serde_json::Value {
        serde_json::json!({
            "positions": self.positions,
            "current_turn": self.current_turn,
            "last_roll": self.last_roll,
            "winner_seat": if self.winner_seat == NO_WINNER {
                serde_json::Value::Null
            } else {
                serde_json::json!(self.winner_seat)
            },
            "started": self.started == 1,
            "track_length": self.track_length,
        })
    }

    /// The next occupied seat after `from`, in seat order.
    fn next_turn(&self, meta: &RoomMeta, from: u8) -> u8 {
        let occupied: Vec<u8> = meta.users_by_seat().iter().map(|(s, _)| *s).collect();
        if occupied.is_empty() {
            return from;
        }
        occupied
            .iter()
            .copied()
            .find(|s| *s > from)
            .unwrap_or(occupied[0])
    }
}

fn track_length_from(meta: &RoomMeta) -> u8 {
    meta.config
        .get("track_length")
        .and_then(|v| v.as_u64())
        .map(|v| v.clamp(5, 200) as u8)
        .unwrap_or(30)
}

fn initial_state(meta: &RoomMeta) -> SprintState {
    SprintState::fresh(track_length_from(meta))
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

struct SprintEngine {
    store: Arc<RoomStore>,
}

impl SprintEngine {
    async fn load(
        &self,
        room_id: &RoomId,
    ) -> Result<Option<(SprintState, RoomMeta)>, RoomError> {
        Ok(self.store.load::<SprintState>(GAME_TYPE, room_id).await?)
    }

    async fn save(
        &self,
        room_id: &RoomId,
        state: &SprintState,
        meta: &RoomMeta,
    ) -> Result<(), RoomError> {
        Ok(self
            .store
            .save(GAME_TYPE, room_id, state, meta, unix_now())
            .await?)
    }

    fn user_at_seat(meta: &RoomMeta, seat: u8) -> Option<UserId> {
        meta.seats
            .iter()
            .find(|(_, s)| **s == seat)
            .map(|(u, _)| u.clone())
    }

    /// Seats ranked by track position, best first.
    fn ranking(state: &SprintState, meta: &RoomMeta) -> Vec<UserId> {
        let mut ranked: Vec<(u8, UserId)> = meta
            .users_by_seat()
            .into_iter()
            .map(|(seat, user)| (state.positions[seat as usize], user))
            .collect();
        ranked.sort_by(|a, b| b.0.cmp(&a.0));
        ranked.into_iter().map(|(_, user)| user).collect()
    }

    fn start(
        &self,
        state: &mut SprintState,
        meta: &mut RoomMeta,
        user: &UserId,
    ) -> ActionResult {
        if state.started == 1 {
            return ActionResult::error("the race already started");
        }
        if meta.seat_of(user) != Some(0) {
            return ActionResult::error("only the room creator can start");
        }
        if meta.seats.len() < 2 {
            return ActionResult::error("need at least 2 players");
        }

        state.started = 1;
        state.current_turn = meta.users_by_seat()[0].0;
        meta.turn_started_at = Some(unix_now());

        ActionResult::ok(state.view()).with_event(
            "RaceStarted",
            serde_json::json!({ "players": meta.seats.len() }),
        )
    }

    fn roll(
        &self,
        state: &mut SprintState,
        meta: &mut RoomMeta,
        user: &UserId,
    ) -> ActionResult {
        if state.started == 0 {
            return ActionResult::error("the race has not started");
        }
        if state.winner_seat != NO_WINNER {
            return ActionResult::error("the race is over");
        }
        let Some(seat) = meta.seat_of(user) else {
            return ActionResult::error("you are not seated here");
        };
        if seat != state.current_turn {
            return ActionResult::error("it is not your turn");
        }

        let roll: u8 = rand::rng().random_range(1..=6);
        state.last_roll = roll;
        let pos = &mut state.positions[seat as usize];
        *pos = pos.saturating_add(roll);

        let mut result = ActionResult::default();
        result.success = true;
        result.events.push(GameEvent {
            name: "DiceRolled".into(),
            data: serde_json::json!({ "seat": seat, "value": roll }),
        });

        if *pos >= state.track_length {
            state.winner_seat = seat;
            meta.turn_started_at = None;
            result.events.push(GameEvent {
                name: "RaceWon".into(),
                data: serde_json::json!({ "seat": seat }),
            });
            result.game_ended = Some(GameEnded {
                winner_user_id: Self::user_at_seat(meta, seat),
                ranking: Some(Self::ranking(state, meta)),
                final_state: state.view(),
            });
        } else {
            state.current_turn = state.next_turn(meta, seat);
            meta.turn_started_at = Some(unix_now());
        }

        result.new_state = Some(state.view());
        result
    }
}

#[async_trait]
impl GameEngine for SprintEngine {
    fn game_type(&self) -> &str {
        GAME_TYPE
    }

    async fn execute(
        &self,
        room_id: &RoomId,
        command: Command,
    ) -> Result<ActionResult, RoomError> {
        let Some((mut state, mut meta)) = self.load(room_id).await? else {
            return Err(RoomError::NotFound(room_id.clone()));
        };

        let result = match command.action.as_str() {
            "start" => self.start(&mut state, &mut meta, &command.user_id),
            "roll" => self.roll(&mut state, &mut meta, &command.user_id),
            other => ActionResult::error(format!("unknown action: {other}")),
        };

        if result.success {
            self.save(room_id, &state, &meta).await?;
        }
        Ok(result)
    }

    async fn legal_actions(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
    ) -> Result<Vec<String>, RoomError> {
        let Some((state, meta)) = self.load(room_id).await? else {
            return Ok(vec![]);
        };
        let Some(seat) = meta.seat_of(user_id) else {
            return Ok(vec![]);
        };

        let mut actions = Vec::new();
        if state.started == 0 && seat == 0 && meta.seats.len() >= 2 {
            actions.push("start".to_string());
        }
        if state.started == 1
            && state.winner_seat == NO_WINNER
            && seat == state.current_turn
        {
            actions.push("roll".to_string());
        }
        Ok(actions)
    }

    async fn state(&self, room_id: &RoomId) -> Result<Option<StateResponse>, RoomError> {
        let Some((state, meta)) = self.load(room_id).await? else {
            return Ok(None);
        };
        Ok(Some(StateResponse {
            room_id: room_id.clone(),
            game_type: GAME_TYPE.to_string(),
            state: state.view(),
            legal_moves: vec![],
            meta,
        }))
    }

    async fn metas(
        &self,
        room_ids: &[RoomId],
    ) -> Result<Vec<(RoomId, RoomMeta)>, RoomError> {
        Ok(self.store.load_meta_many(GAME_TYPE, room_ids).await?)
    }

    fn turn_timeout(&self) -> Option<Duration> {
        Some(TURN_TIMEOUT)
    }

    async fn check_timeouts(
        &self,
        room_id: &RoomId,
    ) -> Result<Option<ActionResult>, RoomError> {
        let Some((mut state, mut meta)) = self.load(room_id).await? else {
            return Ok(None);
        };
        if state.started == 0 || state.winner_seat != NO_WINNER {
            return Ok(None);
        }
        let Some(turn_started) = meta.turn_started_at else {
            return Ok(None);
        };
        if unix_now() < turn_started + TURN_TIMEOUT.as_secs() as i64 {
            // The due entry outlived an action that already moved the
            // turn; nothing to do.
            return Ok(None);
        }

        let skipped = state.current_turn;
        state.current_turn = state.next_turn(&meta, skipped);
        meta.turn_started_at = Some(unix_now());
        self.save(room_id, &state, &meta).await?;

        tracing::info!(%room_id, seat = skipped, "turn timed out, skipping");
        Ok(Some(ActionResult::ok(state.view()).with_event(
            "TurnTimeout",
            serde_json::json!({ "skipped_seat": skipped, "next_seat": state.current_turn }),
        )))
    }
}

// ---------------------------------------------------------------------------
// Module wiring
// ---------------------------------------------------------------------------

fn sprint_module(ctx: &ModuleContext) -> GameModule {
    let engine = Arc::new(SprintEngine {
        store: ctx.store.clone(),
    });
    let service = Arc::new(StandardRoomService::new(
        GAME_TYPE,
        ctx.store.clone(),
        ctx.economy.clone(),
        initial_state,
    ));
    GameModule {
        game_type: GAME_TYPE.to_string(),
        engine,
        service,
        json_schema: None,
    }
}

// ---------------------------------------------------------------------------
// Server bootstrap
// ---------------------------------------------------------------------------

/// Development authenticator: the token itself is the user id.
struct TokenAuth;

impl Authenticator for TokenAuth {
    async fn authenticate(&self, token: &str) -> Result<AuthedUser, SessionError> {
        if token.is_empty() || token.len() > 64 {
            return Err(SessionError::AuthFailed("bad token".into()));
        }
        Ok(AuthedUser {
            user_id: UserId::new(token),
            display_name: format!("player-{token}"),
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = ServerConfig::default()
        .with_template(
            "Sprint (4 players)",
            RoomTemplate {
                game_type: GAME_TYPE.to_string(),
                max_seats: 4,
                entry_fee: 100,
                visibility: Visibility::Public,
                config: [("track_length".to_string(), serde_json::json!(30))]
                    .into_iter()
                    .collect(),
            },
        )
        .with_template(
            "Sprint (free)",
            RoomTemplate {
                game_type: GAME_TYPE.to_string(),
                max_seats: 4,
                entry_fee: 0,
                visibility: Visibility::Public,
                config: Default::default(),
            },
        );

    let server = ParlorServer::<TokenAuth>::builder()
        .config(config)
        .module(sprint_module)
        .build(TokenAuth)
        .await?;

    tracing::info!(addr = %server.local_addr()?, "sprint server up");
    server.run().await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
