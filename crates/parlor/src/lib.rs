//! # Parlor
//!
//! A multi-tenant, horizontally scalable server for short-lived,
//! authoritative turn-based game sessions.
//!
//! Game developers implement the [`GameEngine`](parlor_room::GameEngine)
//! and register a [`GameModule`](parlor_room::GameModule); the runtime
//! handles transport, sessions, per-room serialization, persistence,
//! turn timeouts, payouts, and fan-out.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use parlor::prelude::*;
//!
//! // Implement GameEngine for your game, then:
//! // let server = ParlorServer::builder()
//! //     .config(ServerConfig::default())
//! //     .module(my_module_factory)
//! //     .build(my_auth)
//! //     .await?;
//! // server.run().await
//! ```

#![allow(async_fn_in_trait)]

mod config;
mod error;
mod handler;
mod hub;
mod server;

pub use config::{
    DatabaseSection, DispatcherSection, EconomySection, GameLoopSection, OutboxSection,
    RateLimitSection, RoomTemplate, ServerConfig, SessionSection,
};
pub use error::ParlorError;
pub use hub::{Hub, HubConnection};
pub use server::{ModuleContext, ParlorServer, ParlorServerBuilder};

/// Re-exports everything a game developer needs.
pub mod prelude {
    pub use crate::{
        Hub, HubConnection, ModuleContext, ParlorError, ParlorServer, ParlorServerBuilder,
        RoomTemplate, ServerConfig,
    };

    pub use parlor_protocol::{
        decode_state, encode_state, ActionError, ClientCommand, ConnectionId, Envelope,
        GameState, MigrationRegistry, Payload, RoomId, RoomMessage, RoomMeta, ServerReply,
        UserId, Visibility, PROTOCOL_VERSION,
    };

    pub use parlor_room::{
        ActionResult, Broadcaster, Command, CommandDispatcher, CommandExecutor, GameEnded,
        GameEngine, GameEvent, GameModule, ModuleRegistry, RoomError, RoomService,
        StandardRoomService, StateResponse,
    };

    pub use parlor_session::{AuthedUser, Authenticator, SessionError, SessionTracker};

    pub use parlor_store::{Kv, MemoryKv, RoomRegistry, RoomStore};

    pub use parlor_economy::{
        ArchiveRepository, Economy, MemoryArchive, MemoryOutbox, MemoryWallet,
        OutboxRepository, WalletRepository,
    };

    pub use parlor_transport::{Connection, Transport, WebSocketTransport};
}
