//! Economy boundary for Parlor: wallet ledger, entry-fee reservations,
//! payouts, and the transactional outbox that makes game-end side effects
//! recoverable.
//!
//! The relational database is reached exclusively through three
//! repository traits ([`WalletRepository`], [`OutboxRepository`],
//! [`ArchiveRepository`]). Postgres implementations back production;
//! in-memory implementations back every test.
//!
//! The [`Economy`] service holds the money rules the room runtime relies
//! on: reserve → commit/refund around joins, rake and payout tables at
//! game end, idempotency keys everywhere so outbox retries can never
//! double-credit.

mod economy;
mod error;
mod memory;
mod outbox;
mod postgres;
mod repository;

pub use economy::{Economy, Reservation};
pub use error::EconomyError;
pub use memory::{MemoryArchive, MemoryOutbox, MemoryWallet};
pub use outbox::{GameEndedPayload, OutboxWorker, OutboxWorkerConfig, GAME_ENDED_EVENT};
pub use postgres::{connect_pool, PgArchive, PgOutbox, PgPoolSettings, PgWallet};
pub use repository::{
    ArchiveRepository, ArchivedGame, LedgerEntry, OutboxRecord, OutboxRepository,
    PlayerProfile, WalletRepository,
};
