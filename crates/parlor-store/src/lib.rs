//! Persistence and indexing for Parlor rooms.
//!
//! Three pieces, bottom up:
//!
//! - [`Kv`] — the named interface to the external in-memory store. The
//!   runtime only ever talks to this trait; [`MemoryKv`] is the bundled
//!   single-process engine with the same atomicity guarantees a
//!   single-threaded store shard gives (conditional set, compare-and-
//!   delete, scripted read-modify-write, sorted sets, per-key TTL).
//! - [`RoomStore`] — owns every room's state bytes and meta document,
//!   plus the per-room distributed lock.
//! - [`RoomRegistry`] — owns every global index: rooms by game type,
//!   by activity, by turn due-time, user→room, short codes, connection
//!   heartbeats, the online set, disconnect tickets, and rate-limit
//!   counters.
//!
//! Ownership is strict: no two components write the same key. The store
//! writes only `game:*` keys; the registry writes only `global:*`,
//! `index:*`, `ratelimit:*`, and `leader:*` keys.

mod error;
pub mod keys;
mod kv;
mod memory;
mod registry;
mod room_store;

pub use error::{KvError, StoreError};
pub use kv::{Kv, UpdateFn};
pub use memory::MemoryKv;
pub use registry::{RoomRegistry, SHORT_CODE_ALPHABET, SHORT_CODE_LEN};
pub use room_store::{RoomLock, RoomStore};
