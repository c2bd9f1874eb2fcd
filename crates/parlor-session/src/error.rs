//! Error types for the session layer.

use parlor_protocol::UserId;

/// Errors that can occur during session management.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The token was invalid, expired, or rejected by the
    /// [`Authenticator`](crate::Authenticator).
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// No live session exists for the given user.
    #[error("no session for user {0}")]
    NotFound(UserId),

    #[error(transparent)]
    Store(#[from] parlor_store::StoreError),

    /// Room-layer failure while acting on a session event (grace-period
    /// leave, reconnect resume).
    #[error(transparent)]
    Room(#[from] parlor_room::RoomError),
}
