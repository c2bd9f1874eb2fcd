//! The KV keyspace.
//!
//! Room-scoped keys wrap the room id in `{…}` hash tags so a room's
//! state, meta, and lock land on the same cluster slot and can be
//! written in one pipeline.

use parlor_protocol::{RoomId, UserId};

pub fn state_key(game_type: &str, room_id: &RoomId) -> String {
    format!("game:{game_type}:{{{room_id}}}:state")
}

pub fn meta_key(game_type: &str, room_id: &RoomId) -> String {
    format!("game:{game_type}:{{{room_id}}}:meta")
}

pub fn lock_key(game_type: &str, room_id: &RoomId) -> String {
    format!("game:{game_type}:{{{room_id}}}:lock")
}

/// Hash: roomId → gameType.
pub const ROOM_REGISTRY: &str = "global:room_registry";

/// Sorted set per game type: roomId scored by creation time.
pub fn rooms_index(game_type: &str) -> String {
    format!("index:rooms:{game_type}")
}

/// Sorted set per game type: roomId scored by last-touched time.
pub fn activity_index(game_type: &str) -> String {
    format!("index:activity:{game_type}")
}

/// Sorted set per game type: roomId scored by absolute turn due-time.
pub fn timeouts_index(game_type: &str) -> String {
    format!("index:timeouts:{game_type}")
}

/// Hash: shortCode → roomId.
pub const SHORT_CODES: &str = "global:short_codes";

/// Hash: roomId → shortCode (the reverse direction of the bijection).
pub const ROOM_SHORT_CODES: &str = "global:room_short_codes";

/// Counter feeding the short-code generator.
pub const SHORT_CODE_COUNTER: &str = "global:short_code_counter";

/// Hash: userId → roomId (at most one active room per user).
pub const USER_ROOMS: &str = "global:user_rooms";

/// Sorted set per user: connectionId scored by last heartbeat.
pub fn user_connections(user_id: &UserId) -> String {
    format!("global:user_connections:{user_id}")
}

/// Sorted set: userId scored by last heartbeat.
pub const ONLINE_USERS: &str = "global:online_users";

/// String per user: the roomId their disconnect ticket points at.
pub fn disconnected_player(user_id: &UserId) -> String {
    format!("global:disconnected_players:{user_id}")
}

/// Sorted set: userId scored by ticket expiry.
pub const DISCONNECTED_INDEX: &str = "global:disconnected_players_index";

/// Minute-bucket counter per user.
pub fn rate_limit(user_id: &UserId) -> String {
    format!("ratelimit:{user_id}")
}

/// The leader lock for the turn-timeout sweep.
pub const LEADER_GAMELOOP: &str = "leader:gameloop";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_keys_share_a_hash_tag() {
        let id = RoomId::parse("deadbeef").unwrap();
        let s = state_key("sprint", &id);
        let m = meta_key("sprint", &id);
        let l = lock_key("sprint", &id);
        assert_eq!(s, "game:sprint:{deadbeef}:state");
        assert_eq!(m, "game:sprint:{deadbeef}:meta");
        assert_eq!(l, "game:sprint:{deadbeef}:lock");
        // Same tag substring → same cluster slot.
        for k in [&s, &m, &l] {
            assert!(k.contains("{deadbeef}"));
        }
    }

    #[test]
    fn test_per_user_keys_embed_the_user() {
        let u = UserId::new("u42");
        assert_eq!(user_connections(&u), "global:user_connections:u42");
        assert_eq!(rate_limit(&u), "ratelimit:u42");
        assert_eq!(
            disconnected_player(&u),
            "global:disconnected_players:u42"
        );
    }
}
