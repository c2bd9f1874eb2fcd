//! Typed broadcast messages fanned out to everyone watching a room.
//!
//! `#[serde(tag = "type")]` produces internally tagged JSON — the client
//! switches on `"type"` and reads the flattened fields, e.g.
//! `{ "type": "PlayerJoined", "user_id": "u1", "seat_index": 0, ... }`.

use serde::{Deserialize, Serialize};

use crate::UserId;

/// A message published to a room's subscribers (players and spectators).
///
/// Delivery is per-room FIFO for messages originating on one node, and
/// best-effort to spectators: a failed delivery to one subscriber never
/// drops the message for the rest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RoomMessage {
    /// Full state snapshot, sent after every successful action.
    GameState { state: serde_json::Value },

    PlayerJoined {
        user_id: UserId,
        user_name: String,
        seat_index: u8,
    },

    PlayerLeft {
        user_id: UserId,
        user_name: String,
    },

    /// A seated player lost their last connection; the room holds their
    /// seat for `grace_period_seconds`.
    PlayerDisconnected {
        user_id: UserId,
        user_name: String,
        grace_period_seconds: u64,
    },

    PlayerReconnected {
        user_id: UserId,
        user_name: String,
    },

    /// A module-defined event (dice rolled, card revealed, turn timed
    /// out). `timestamp` is unix seconds on the originating node.
    GameEvent {
        name: String,
        data: serde_json::Value,
        timestamp: i64,
    },

    /// A failed action, delivered only to the acting connection.
    ActionError { action: String, message: String },

    ChatMessage {
        user_id: UserId,
        user_name: String,
        text: String,
        timestamp: i64,
    },
}
