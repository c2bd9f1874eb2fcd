//! Wire protocol for Parlor.
//!
//! This crate defines the "language" the rest of the runtime speaks:
//!
//! - **Identity** ([`RoomId`], [`UserId`], [`ConnectionId`]) — the opaque
//!   ids that name rooms, users, and sockets.
//! - **Room metadata** ([`RoomMeta`]) — the small JSON document stored
//!   next to every game state.
//! - **Wire types** ([`ClientCommand`], [`ServerReply`], [`Envelope`]) —
//!   the messages that travel between clients and the realtime hub.
//! - **Broadcast messages** ([`RoomMessage`]) — the typed fan-out frames
//!   published to everyone watching a room.
//! - **State codec** ([`GameState`], [`encode_state`], [`decode_state`]) —
//!   the versioned fixed-size binary encoding of game state.
//! - **Validation** ([`validate`]) — input checks applied before any
//!   state mutation.
//!
//! The protocol layer knows nothing about storage or networking — it only
//! defines shapes and how they serialize.

mod codec;
mod error;
mod ids;
mod messages;
mod meta;
pub mod validate;
mod wire;

pub use codec::{
    decode_state, encode_state, GameState, MigrationRegistry, StoredStateHeader,
    MAX_STATE_SIZE, STATE_HEADER_LEN,
};
pub use error::{ActionError, CodecError, ProtocolError};
pub use ids::{ConnectionId, RoomId, UserId};
pub use messages::RoomMessage;
pub use meta::{RoomMeta, Visibility};
pub use wire::{ClientCommand, Envelope, Payload, ServerReply, PROTOCOL_VERSION};
