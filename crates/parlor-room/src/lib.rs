//! The room runtime core: module contract, per-room serialization, and
//! fan-out.
//!
//! - [`GameEngine`] / [`RoomService`] — the contract a game module
//!   satisfies to embed in the runtime. Modules register in a
//!   [`ModuleRegistry`] keyed by game type at process init.
//! - [`CommandDispatcher`] — hashes room ids onto sharded single-consumer
//!   queues so commands for one room never race while different rooms
//!   progress in parallel.
//! - [`Broadcaster`] — room-scoped fan-out of typed messages to players
//!   and spectators.
//! - [`CommandExecutor`] — the spine of one command: dispatcher → room
//!   lock → engine → outbox on game end → unlock → broadcast.
//! - [`StandardRoomService`] — the create/join/leave/delete flow shared
//!   by modules, including entry-fee reservation with refund on failure
//!   and the atomic seat-allocation script.

mod broadcast;
mod dispatch;
mod engine;
mod error;
mod executor;
mod service;

pub use broadcast::{Broadcaster, RoomFeed};
pub use dispatch::CommandDispatcher;
pub use engine::{
    ActionResult, Command, GameEnded, GameEngine, GameEvent, GameModule, ModuleRegistry,
    RoomService, StateResponse,
};
pub use error::RoomError;
pub use executor::CommandExecutor;
pub use service::StandardRoomService;
