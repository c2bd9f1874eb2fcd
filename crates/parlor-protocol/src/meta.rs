//! Room metadata: the small JSON document stored next to every state.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::UserId;

/// Who may discover and join a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    Public,
    Private,
}

/// Metadata for one room. Persisted as JSON under the room's `:meta` key.
///
/// Invariants maintained by the room service:
/// - `seats.len() <= max_seats as usize`
/// - seat indexes are distinct and drawn from `0..max_seats`
/// - `game_type` never changes after creation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomMeta {
    pub game_type: String,

    /// Seated participants: user → seat index.
    #[serde(default)]
    pub seats: BTreeMap<UserId, u8>,

    pub max_seats: u8,

    #[serde(default)]
    pub visibility: Visibility,

    /// Entry fee in coins; 0 means free to join.
    #[serde(default)]
    pub entry_fee: i64,

    /// Arbitrary module-specific configuration.
    #[serde(default)]
    pub config: BTreeMap<String, serde_json::Value>,

    /// Unix seconds when the current turn started, if a turn is running.
    #[serde(default)]
    pub turn_started_at: Option<i64>,

    /// Users currently inside their disconnect grace window: user →
    /// unix seconds when the grace expires.
    #[serde(default)]
    pub disconnect_grace: BTreeMap<UserId, i64>,

    /// Unix seconds when the room was created.
    pub created_at: i64,
}

impl RoomMeta {
    pub fn new(game_type: impl Into<String>, max_seats: u8, created_at: i64) -> Self {
        Self {
            game_type: game_type.into(),
            seats: BTreeMap::new(),
            max_seats,
            visibility: Visibility::Public,
            entry_fee: 0,
            config: BTreeMap::new(),
            turn_started_at: None,
            disconnect_grace: BTreeMap::new(),
            created_at,
        }
    }

    pub fn is_full(&self) -> bool {
        self.seats.len() >= self.max_seats as usize
    }

    pub fn seat_of(&self, user: &UserId) -> Option<u8> {
        self.seats.get(user).copied()
    }

    /// The lowest seat index not currently taken, if any.
    pub fn lowest_free_seat(&self) -> Option<u8> {
        (0..self.max_seats).find(|s| !self.seats.values().any(|taken| taken == s))
    }

    /// Seated users ordered by seat index.
    pub fn users_by_seat(&self) -> Vec<(u8, UserId)> {
        let mut out: Vec<(u8, UserId)> =
            self.seats.iter().map(|(u, s)| (*s, u.clone())).collect();
        out.sort_by_key(|(s, _)| *s);
        out
    }

    /// Total pot for this room if all seats paid the entry fee.
    pub fn total_pot(&self) -> i64 {
        self.entry_fee * self.seats.len() as i64
    }
}
