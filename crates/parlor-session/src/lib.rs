//! Session lifecycle for Parlor.
//!
//! 1. **Authentication** — the [`Authenticator`] trait validates a token
//!    and yields the user's identity. The runtime never stores
//!    credentials; that is the auth provider's job.
//! 2. **Connection tracking** — [`SessionTracker`] records connections
//!    and heartbeats in the shared registry, so presence survives node
//!    restarts and is visible fleet-wide.
//! 3. **Disconnect grace** — a seated player who loses their last
//!    connection gets a ticket; reconnecting inside the grace window
//!    resumes their room, and the [`CleanupWorker`] unseats them when
//!    the ticket expires.

#![allow(async_fn_in_trait)]

mod auth;
mod cleanup;
mod error;
mod tracker;

pub use auth::{AuthedUser, Authenticator};
pub use cleanup::{CleanupWorker, CleanupWorkerConfig};
pub use error::SessionError;
pub use tracker::{ConnectOutcome, SessionTracker};
