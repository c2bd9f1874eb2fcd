//! `ParlorServer` builder and accept loop.
//!
//! The builder wires the whole runtime: KV engine, registry, store,
//! economy repositories, dispatcher, broadcaster, module registry, and
//! the three background workers (turn-timeout scheduler, session
//! cleanup, outbox). Defaults are the in-memory engines, so a test or a
//! single-node dev server needs no external services.

use std::sync::Arc;

use parlor_economy::{
    ArchiveRepository, Economy, MemoryArchive, MemoryOutbox, MemoryWallet, OutboxRepository,
    OutboxWorker, OutboxWorkerConfig, WalletRepository,
};
use parlor_protocol::MigrationRegistry;
use parlor_room::{
    Broadcaster, CommandDispatcher, CommandExecutor, GameModule, ModuleRegistry,
};
use parlor_session::{Authenticator, CleanupWorker, CleanupWorkerConfig, SessionTracker};
use parlor_store::{Kv, MemoryKv, RoomRegistry, RoomStore};
use parlor_tick::{GameLoopConfig, TurnTimeoutScheduler};
use parlor_transport::{Transport, WebSocketTransport};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::handler::handle_connection;
use crate::{Hub, ParlorError, ServerConfig};

/// What module factories get to build their engine and service against.
pub struct ModuleContext {
    pub store: Arc<RoomStore>,
    pub registry: Arc<RoomRegistry>,
    pub economy: Arc<Economy>,
}

type ModuleFactory = Box<dyn FnOnce(&ModuleContext) -> GameModule + Send>;

/// Builder for configuring and starting a Parlor server.
pub struct ParlorServerBuilder {
    config: ServerConfig,
    kv: Option<Arc<dyn Kv>>,
    wallet: Option<Arc<dyn WalletRepository>>,
    outbox: Option<Arc<dyn OutboxRepository>>,
    archive: Option<Arc<dyn ArchiveRepository>>,
    migrations: MigrationRegistry,
    module_factories: Vec<ModuleFactory>,
}

impl ParlorServerBuilder {
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
            kv: None,
            wallet: None,
            outbox: None,
            archive: None,
            migrations: MigrationRegistry::new(),
            module_factories: Vec::new(),
        }
    }

    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Swaps the bundled in-memory KV engine for another implementation.
    pub fn kv(mut self, kv: Arc<dyn Kv>) -> Self {
        self.kv = Some(kv);
        self
    }

    /// Swaps the in-memory relational repositories (e.g. for the
    /// Postgres implementations).
    pub fn repositories(
        mut self,
        wallet: Arc<dyn WalletRepository>,
        outbox: Arc<dyn OutboxRepository>,
        archive: Arc<dyn ArchiveRepository>,
    ) -> Self {
        self.wallet = Some(wallet);
        self.outbox = Some(outbox);
        self.archive = Some(archive);
        self
    }

    pub fn migrations(mut self, migrations: MigrationRegistry) -> Self {
        self.migrations = migrations;
        self
    }

    /// Registers a game module. The factory runs once during `build`
    /// with the runtime context.
    pub fn module<F>(mut self, factory: F) -> Self
    where
        F: FnOnce(&ModuleContext) -> GameModule + Send + 'static,
    {
        self.module_factories.push(Box::new(factory));
        self
    }

    /// Builds the runtime, spawns the background workers, and binds the
    /// transport.
    pub async fn build<A: Authenticator>(
        self,
        auth: A,
    ) -> Result<ParlorServer<A>, ParlorError> {
        let config = self.config;

        let kv = self.kv.unwrap_or_else(|| Arc::new(MemoryKv::new()));
        let registry = Arc::new(RoomRegistry::new(kv.clone()));
        let store = Arc::new(RoomStore::with_migrations(
            kv.clone(),
            registry.clone(),
            self.migrations,
        ));

        let wallet = self
            .wallet
            .unwrap_or_else(|| Arc::new(MemoryWallet::new()));
        let outbox = self
            .outbox
            .unwrap_or_else(|| Arc::new(MemoryOutbox::new()));
        let archive = self
            .archive
            .unwrap_or_else(|| Arc::new(MemoryArchive::new()));
        let economy = Arc::new(Economy::new(
            wallet,
            config.economy.initial_coins,
            config.economy.rake_percent,
        ));

        let context = ModuleContext {
            store: store.clone(),
            registry: registry.clone(),
            economy: economy.clone(),
        };
        let mut modules = ModuleRegistry::new();
        for factory in self.module_factories {
            modules.register(factory(&context));
        }
        let modules = Arc::new(modules);

        let shards = if config.dispatcher.shards == 0 {
            CommandDispatcher::default_shards()
        } else {
            config.dispatcher.shards
        };
        let dispatcher = CommandDispatcher::new(shards);
        let broadcaster = Arc::new(Broadcaster::new());
        let executor = CommandExecutor::new(
            dispatcher.clone(),
            store.clone(),
            broadcaster.clone(),
            modules.clone(),
            outbox.clone(),
        );

        let sessions = Arc::new(SessionTracker::new(
            registry.clone(),
            broadcaster.clone(),
            config.grace_period(),
        ));

        let hub = Hub::new(
            registry.clone(),
            executor.clone(),
            sessions,
            config.templates.clone(),
            config.rate_limit.permit_limit,
            config.rate_limit_window(),
        );

        // Background workers, all on the same shutdown signal.
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut workers = Vec::new();

        let scheduler = TurnTimeoutScheduler::new(
            kv.clone(),
            registry.clone(),
            executor.clone(),
            modules.clone(),
            GameLoopConfig {
                tick_interval: config.tick_interval(),
                max_rooms_per_tick: config.game_loop.max_rooms_per_tick,
                sweep_concurrency: config.game_loop.sweep_concurrency,
                idle_room_after: std::time::Duration::from_secs(
                    config.game_loop.idle_room_seconds,
                ),
                ..GameLoopConfig::default()
            },
        );
        workers.push(scheduler.spawn(shutdown_rx.clone()));

        let cleanup = CleanupWorker::new(
            registry.clone(),
            modules.clone(),
            broadcaster.clone(),
            CleanupWorkerConfig::default(),
        );
        workers.push(cleanup.spawn(shutdown_rx.clone()));

        let outbox_worker = OutboxWorker::new(
            outbox,
            archive,
            economy,
            OutboxWorkerConfig {
                poll_interval: std::time::Duration::from_millis(
                    config.outbox.poll_interval_ms,
                ),
                batch_size: config.outbox.batch_size,
                max_attempts: config.outbox.max_attempts,
                purge_after: std::time::Duration::from_secs(
                    config.outbox.purge_after_days * 24 * 3600,
                ),
                ..OutboxWorkerConfig::default()
            },
        );
        workers.push(outbox_worker.spawn(shutdown_rx));

        let transport = WebSocketTransport::bind(&config.bind_addr).await?;

        Ok(ParlorServer {
            transport,
            hub,
            dispatcher,
            auth: Arc::new(auth),
            shutdown: shutdown_tx,
            workers,
        })
    }
}

impl Default for ParlorServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A running Parlor server.
pub struct ParlorServer<A: Authenticator> {
    transport: WebSocketTransport,
    hub: Arc<Hub>,
    dispatcher: Arc<CommandDispatcher>,
    auth: Arc<A>,
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl<A: Authenticator> ParlorServer<A> {
    pub fn builder() -> ParlorServerBuilder {
        ParlorServerBuilder::new()
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.transport.local_addr()
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Runs the accept loop until [`stop`](Self::stop) flips the
    /// shutdown signal.
    pub async fn run(mut self) -> Result<(), ParlorError> {
        tracing::info!("parlor server running");
        let mut shutdown = self.shutdown.subscribe();

        loop {
            tokio::select! {
                accepted = self.transport.accept() => match accepted {
                    Ok(conn) => {
                        let hub = Arc::clone(&self.hub);
                        let auth = Arc::clone(&self.auth);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(conn, hub, auth).await {
                                tracing::debug!(error = %e, "connection ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "accept failed");
                    }
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        // Drain in order: no new commands, then workers.
        self.dispatcher.shutdown().await;
        for worker in self.workers {
            let _ = worker.await;
        }
        tracing::info!("parlor server stopped");
        Ok(())
    }

    /// Signals every loop to stop. `run` returns after draining.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}
