//! Error types for the room layer.

use parlor_protocol::{ActionError, RoomId, UserId};

/// Errors that can occur during room operations.
#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    /// The room does not exist (or its record was unreadable and treated
    /// as absent).
    #[error("room {0} not found")]
    NotFound(RoomId),

    /// Every seat is taken.
    #[error("room {0} is full")]
    Full(RoomId),

    /// The user is already seated in this or another room.
    #[error("user {0} is already in a room")]
    AlreadyInRoom(UserId),

    /// The user is not seated in the room they addressed.
    #[error("user {0} is not in room {1}")]
    NotInRoom(UserId, RoomId),

    /// No module is registered for this game type.
    #[error("no module registered for game type {0}")]
    UnknownGameType(String),

    /// The per-room lock could not be acquired within its budget.
    #[error("room {0} is locked by another worker")]
    LockContention(RoomId),

    /// The dispatcher refused the command (shutting down).
    #[error("system overloaded")]
    Overloaded,

    /// The shard loop dropped the command during shutdown.
    #[error("shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Store(#[from] parlor_store::StoreError),

    #[error(transparent)]
    Economy(#[from] parlor_economy::EconomyError),
}

impl RoomError {
    /// Maps the infra error onto the client-facing taxonomy.
    pub fn to_action_error(&self) -> ActionError {
        match self {
            Self::NotFound(_) => ActionError::RoomNotFound,
            Self::Full(_) => ActionError::RoomFull,
            Self::AlreadyInRoom(_) => {
                ActionError::IllegalMove("already in a room".into())
            }
            Self::NotInRoom(_, _) => ActionError::NotInRoom,
            Self::UnknownGameType(t) => {
                ActionError::InvalidInput(format!("unknown game type {t}"))
            }
            Self::LockContention(_) => ActionError::LockContention,
            Self::Overloaded | Self::ShuttingDown => ActionError::SystemOverloaded,
            Self::Economy(parlor_economy::EconomyError::InsufficientFunds { .. }) => {
                ActionError::InsufficientFunds
            }
            Self::Economy(parlor_economy::EconomyError::DuplicateTransaction(_)) => {
                ActionError::DuplicateTransaction
            }
            Self::Economy(parlor_economy::EconomyError::ConcurrencyConflict(_)) => {
                ActionError::ConcurrencyConflict
            }
            Self::Store(_) | Self::Economy(_) => ActionError::SystemOverloaded,
        }
    }
}
