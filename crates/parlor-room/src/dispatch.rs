//! The command dispatcher: a single-threaded timeline per room without a
//! task per room.
//!
//! `N = 2 × processor count` unbounded FIFO shards. A room id hashes to
//! one shard; that shard's consumer drains jobs sequentially, so two
//! commands for the same room can never overlap, while commands for
//! rooms on different shards progress in parallel.

use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use futures_util::FutureExt;
use parlor_protocol::RoomId;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::RoomError;

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

pub struct CommandDispatcher {
    /// Shard writers. `None` once shutdown has closed them.
    shards: RwLock<Option<Vec<mpsc::UnboundedSender<Job>>>>,
    shard_count: usize,
    consumers: Mutex<Vec<JoinHandle<()>>>,
    /// Commands accepted but not yet completed, across all shards.
    in_flight: AtomicU64,
}

impl CommandDispatcher {
    /// Spawns `shards` consumer tasks. Pass
    /// [`CommandDispatcher::default_shards`] unless a test needs a fixed
    /// shard count.
    pub fn new(shards: usize) -> Arc<Self> {
        let shards = shards.max(1);
        let mut senders = Vec::with_capacity(shards);
        let mut consumers = Vec::with_capacity(shards);

        for shard in 0..shards {
            let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
            senders.push(tx);
            consumers.push(tokio::spawn(async move {
                tracing::debug!(shard, "dispatcher shard started");
                while let Some(job) = rx.recv().await {
                    job.await;
                }
                tracing::debug!(shard, "dispatcher shard drained");
            }));
        }

        Arc::new(Self {
            shards: RwLock::new(Some(senders)),
            shard_count: shards,
            consumers: Mutex::new(consumers),
            in_flight: AtomicU64::new(0),
        })
    }

    /// Default shard count for this host: `2 × processor count`.
    pub fn default_shards() -> usize {
        std::thread::available_parallelism()
            .map(|p| p.get() * 2)
            .unwrap_or(4)
    }

    fn shard_of(&self, room_id: &RoomId) -> usize {
        let mut hasher = DefaultHasher::new();
        room_id.as_str().hash(&mut hasher);
        (hasher.finish() % self.shard_count as u64) as usize
    }

    /// Number of accepted, not-yet-finished commands.
    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn shard_count(&self) -> usize {
        self.shard_count
    }

    /// Enqueues `task` on the room's shard and waits for its result.
    ///
    /// Commands for the same room complete in enqueue order. A refused
    /// enqueue (only possible once shutdown closed the shard writers)
    /// surfaces immediately as [`RoomError::Overloaded`].
    pub async fn dispatch<T, F>(
        self: &Arc<Self>,
        room_id: &RoomId,
        task: F,
    ) -> Result<T, RoomError>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let gauge = Arc::clone(self);
        let job: Job = Box::pin(async move {
            // A panicking command must not take the shard loop (and every
            // queued room behind it) down with it.
            let outcome = std::panic::AssertUnwindSafe(task).catch_unwind().await;
            gauge.in_flight.fetch_sub(1, Ordering::Relaxed);
            match outcome {
                // The caller may have gone away; that is not our problem.
                Ok(result) => {
                    let _ = tx.send(result);
                }
                Err(panic) => {
                    let msg = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "non-string panic".into());
                    tracing::error!(panic = %msg, "command panicked");
                }
            }
        });

        let shard = self.shard_of(room_id);
        {
            let shards = self.shards.read().expect("shard table lock");
            let Some(senders) = shards.as_ref() else {
                return Err(RoomError::Overloaded);
            };
            self.in_flight.fetch_add(1, Ordering::Relaxed);
            if senders[shard].send(job).is_err() {
                self.in_flight.fetch_sub(1, Ordering::Relaxed);
                return Err(RoomError::Overloaded);
            }
        }

        rx.await.map_err(|_| RoomError::ShuttingDown)
    }

    /// Closes every shard writer, then waits for the consumers to drain
    /// what they already accepted.
    pub async fn shutdown(self: &Arc<Self>) {
        // Dropping the senders closes the channels; consumers finish
        // their queues and exit.
        self.shards.write().expect("shard table lock").take();

        let handles: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.consumers.lock().await);
        for handle in handles {
            let _ = handle.await;
        }
        tracing::info!("dispatcher shut down");
    }
}
