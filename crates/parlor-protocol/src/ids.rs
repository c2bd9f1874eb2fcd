//! Identity types used across every layer of the runtime.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An opaque room identifier: 32 lowercase hex characters.
///
/// Newtype wrapper so a room id can never be confused with a user id,
/// even though both are strings underneath. Room ids embed in KV keys
/// wrapped in `{…}` hash tags, so the inner value must never contain
/// braces or colons — `new()` guarantees that, and `parse()` rejects
/// anything that is not plain hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    /// Generates a fresh random room id.
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Parses an externally supplied room id, rejecting anything that is
    /// not plain hex of a sane length.
    pub fn parse(s: &str) -> Option<Self> {
        if crate::validate::valid_room_id(s) {
            Some(Self(s.to_ascii_lowercase()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RoomId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A unique identifier for a user, assigned by the authentication layer.
///
/// The runtime treats it as opaque; it only needs equality, hashing, and
/// a stable string form for KV keys and map keys in JSON documents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Opaque identifier for a single transport connection.
///
/// A user may hold several connections at once (two browser tabs); each
/// gets its own id from a per-process counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_id_is_hex() {
        let id = RoomId::new();
        assert_eq!(id.as_str().len(), 32);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_room_id_serializes_as_plain_string() {
        let id = RoomId::parse("deadbeef").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"deadbeef\"");
    }

    #[test]
    fn test_room_id_parse_rejects_non_hex() {
        assert!(RoomId::parse("not-hex!").is_none());
        assert!(RoomId::parse("").is_none());
        assert!(RoomId::parse(&"f".repeat(51)).is_none());
    }

    #[test]
    fn test_room_id_parse_normalizes_case() {
        let id = RoomId::parse("DEADBEEF").unwrap();
        assert_eq!(id.as_str(), "deadbeef");
    }

    #[test]
    fn test_user_id_round_trip() {
        let id = UserId::new("u-42");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"u-42\"");
        let back: UserId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_connection_id_display() {
        assert_eq!(ConnectionId::new(7).to_string(), "conn-7");
    }
}
