//! Unified error type for the Parlor server.

/// Top-level error wrapping every layer's error type, so binaries deal
/// with one `Result` via `?`.
#[derive(Debug, thiserror::Error)]
pub enum ParlorError {
    #[error(transparent)]
    Transport(#[from] parlor_transport::TransportError),

    #[error(transparent)]
    Protocol(#[from] parlor_protocol::ProtocolError),

    #[error(transparent)]
    Session(#[from] parlor_session::SessionError),

    #[error(transparent)]
    Room(#[from] parlor_room::RoomError),

    #[error(transparent)]
    Store(#[from] parlor_store::StoreError),

    #[error(transparent)]
    Economy(#[from] parlor_economy::EconomyError),

    /// Configuration file problems at startup.
    #[error("config error: {0}")]
    Config(String),
}
