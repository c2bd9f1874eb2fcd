//! The `Kv` trait: the runtime's only window onto the external store.
//!
//! The method set is the exact command surface the room runtime needs —
//! nothing more. Conditional and read-modify-write operations are
//! specified as *atomic*: an implementation backed by a networked store
//! must run them as server-side scripts, not client-side read-then-write
//! sequences. [`MemoryKv`](crate::MemoryKv) gets atomicity for free from
//! its interior mutex.

use std::time::Duration;

use async_trait::async_trait;

use crate::KvError;

/// Closure applied atomically to a key's current value.
///
/// Return `Some(new_bytes)` to write, `None` to leave the key untouched.
/// This is the script seam used for the seat-allocation script: decode →
/// mutate → re-encode under the store's atomicity.
pub type UpdateFn = Box<dyn FnOnce(Option<&[u8]>) -> Option<Vec<u8>> + Send>;

#[async_trait]
pub trait Kv: Send + Sync + 'static {
    // -- plain strings ---------------------------------------------------

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError>;

    /// Pipelined multi-get; the result vector is positionally aligned
    /// with `keys`, missing keys yield `None`.
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, KvError>;

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), KvError>;

    /// Set with a time-to-live.
    async fn set_ex(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), KvError>;

    /// Pipelined multi-set; all pairs are written in one round trip.
    async fn mset(&self, pairs: Vec<(String, Vec<u8>)>) -> Result<(), KvError>;

    /// Deletes keys of any kind. Returns how many existed.
    async fn del(&self, keys: &[String]) -> Result<u64, KvError>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, KvError>;

    /// `SET key value NX EX ttl` — the lock-acquire primitive.
    async fn set_nx_ex(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<bool, KvError>;

    /// Deletes `key` only if it currently holds `expected` — the
    /// lock-release script. Never deletes another holder's value.
    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool, KvError>;

    /// Refreshes the TTL only if `key` currently holds `expected` — the
    /// leader-refresh script.
    async fn expire_if_equal(
        &self,
        key: &str,
        expected: &[u8],
        ttl: Duration,
    ) -> Result<bool, KvError>;

    /// Plain counter increment.
    async fn incr(&self, key: &str) -> Result<i64, KvError>;

    /// Increment that attaches `ttl` when it creates the key — the
    /// rate-limit script (`INCR` + `EXPIRE` in one round trip).
    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64, KvError>;

    /// Atomic read-modify-write of one key. Returns the bytes written,
    /// or `None` if the closure declined to write.
    async fn fetch_update(&self, key: &str, f: UpdateFn) -> Result<Option<Vec<u8>>, KvError>;

    // -- hashes ----------------------------------------------------------

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>, KvError>;

    async fn hset(&self, key: &str, field: &str, value: Vec<u8>) -> Result<(), KvError>;

    /// Sets a hash field only if absent. Returns whether it was written —
    /// the conditional-insert primitive behind short codes.
    async fn hset_nx(&self, key: &str, field: &str, value: Vec<u8>) -> Result<bool, KvError>;

    async fn hdel(&self, key: &str, field: &str) -> Result<bool, KvError>;

    // -- sorted sets -----------------------------------------------------

    /// Adds or rescores a member. Members with equal scores keep their
    /// insertion order (secondary ordering).
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), KvError>;

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, KvError>;

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, KvError>;

    /// Members with `score <= max`, lowest first, capped at `limit`.
    async fn zrange_by_score(
        &self,
        key: &str,
        max: f64,
        limit: usize,
    ) -> Result<Vec<String>, KvError>;

    /// Members by ascending rank, `start..start + count`.
    async fn zrange_by_rank(
        &self,
        key: &str,
        start: usize,
        count: usize,
    ) -> Result<Vec<String>, KvError>;

    /// Removes members with `score < min`. Returns how many went — used
    /// for pruning expired heartbeats.
    async fn zrem_below(&self, key: &str, min: f64) -> Result<u64, KvError>;

    async fn zcard(&self, key: &str) -> Result<u64, KvError>;
}
