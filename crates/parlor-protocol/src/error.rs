//! Error types for the protocol layer.
//!
//! [`ActionError`] is the taxonomy surfaced to acting clients.
//! [`CodecError`] covers the binary state codec. [`ProtocolError`] covers
//! envelope encoding and malformed input at the hub boundary.

use serde::{Deserialize, Serialize};

/// Errors surfaced to the acting client as an `ActionError` frame.
///
/// Serializable so the hub can put the variant name on the wire verbatim;
/// the `Display` form is the human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail")]
pub enum ActionError {
    /// The user is not seated in the room they addressed.
    #[error("you are not in this room")]
    NotInRoom,

    /// The action arrived outside the user's turn.
    #[error("it is not your turn")]
    NotYourTurn,

    /// Every seat is taken.
    #[error("room is full")]
    RoomFull,

    /// No room with the given id or short code exists.
    #[error("room not found")]
    RoomNotFound,

    /// The module does not recognize the action name.
    #[error("unknown action: {0}")]
    UnknownAction(String),

    /// The action is recognized but violates the game rules right now.
    #[error("illegal move: {0}")]
    IllegalMove(String),

    /// The wallet balance cannot cover the requested amount.
    #[error("insufficient funds")]
    InsufficientFunds,

    /// A ledger write with this idempotency key already exists.
    #[error("duplicate transaction")]
    DuplicateTransaction,

    /// An optimistic-concurrency conflict; the caller may retry.
    #[error("concurrency conflict")]
    ConcurrencyConflict,

    /// The dispatcher could not enqueue the command; back off.
    #[error("system overloaded")]
    SystemOverloaded,

    /// The per-room lock could not be acquired in time; transient.
    #[error("room is busy, try again")]
    LockContention,

    /// The per-user rate limit bucket is exhausted for this minute.
    #[error("rate limit exceeded")]
    RateLimited,

    /// Input failed validation before any state was touched.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Errors from the binary state codec.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization of the state body failed.
    #[error("state encode failed: {0}")]
    Encode(#[source] bincode::Error),

    /// The encoded body did not match the declared fixed size.
    #[error("encoded state is {actual} bytes, declared size is {declared}")]
    SizeMismatch { declared: usize, actual: usize },

    /// The state exceeds the hard 1024-byte ceiling.
    #[error("state of {0} bytes exceeds the {max}-byte limit", max = crate::MAX_STATE_SIZE)]
    TooLarge(usize),

    /// The blob is shorter than the fixed header.
    #[error("state blob of {0} bytes is shorter than the header")]
    Truncated(usize),

    /// The stored triple matches neither the current layout nor any
    /// registered migration. Names the stored triple so operators can
    /// see exactly what drifted.
    #[error(
        "state corrupted or incompatible: stored (version {stored_version}, size \
         {stored_size}), expected (version {expected_version}, size {expected_size})"
    )]
    StateCorruptedOrIncompatible {
        stored_version: u8,
        stored_size: u32,
        expected_version: u8,
        expected_size: u32,
    },

    /// A registered migration returned a state it could not build.
    #[error("migration from version {from_version} failed: {reason}")]
    MigrationFailed { from_version: u8, reason: String },
}

/// Errors in envelope handling at the hub boundary.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("encode failed: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("decode failed: {0}")]
    Decode(#[source] serde_json::Error),

    /// The message parsed but violates protocol rules — wrong first
    /// message, unsupported version, and so on.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_error_display() {
        assert_eq!(ActionError::RoomFull.to_string(), "room is full");
        assert_eq!(
            ActionError::UnknownAction("jump".into()).to_string(),
            "unknown action: jump"
        );
    }

    #[test]
    fn test_action_error_serializes_with_kind_tag() {
        let json = serde_json::to_value(ActionError::NotYourTurn).unwrap();
        assert_eq!(json["kind"], "NotYourTurn");

        let json = serde_json::to_value(ActionError::IllegalMove("occupied".into())).unwrap();
        assert_eq!(json["kind"], "IllegalMove");
        assert_eq!(json["detail"], "occupied");
    }

    #[test]
    fn test_codec_error_names_stored_triple() {
        let e = CodecError::StateCorruptedOrIncompatible {
            stored_version: 1,
            stored_size: 24,
            expected_version: 2,
            expected_size: 32,
        };
        let msg = e.to_string();
        assert!(msg.contains("version 1"));
        assert!(msg.contains("size 24"));
        assert!(msg.contains("version 2"));
    }
}
