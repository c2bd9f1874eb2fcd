//! In-process `Kv` engine.
//!
//! One interior mutex guards the whole keyspace, which makes every
//! operation — including the scripted ones — atomic exactly the way a
//! single-threaded store shard would be. No await point ever holds the
//! lock. TTLs are pruned lazily on access, so an expired key behaves as
//! absent without a background reaper.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::{Kv, KvError, UpdateFn};

enum Entry {
    Str(Vec<u8>),
    Hash(HashMap<String, Vec<u8>>),
    /// member → (score, insertion seq). The seq breaks score ties in
    /// insertion order and is refreshed when a member is re-added.
    Zset(HashMap<String, (f64, u64)>),
}

struct Stored {
    entry: Entry,
    expires_at: Option<Instant>,
}

impl Stored {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Default)]
struct Inner {
    map: HashMap<String, Stored>,
    seq: u64,
}

impl Inner {
    /// Drops the key if its TTL elapsed, then returns the live entry.
    fn live_entry(&mut self, key: &str) -> Option<&mut Stored> {
        let now = Instant::now();
        if let Some(stored) = self.map.get(key) {
            if !stored.live(now) {
                self.map.remove(key);
                return None;
            }
        }
        self.map.get_mut(key)
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }
}

/// The bundled in-memory engine.
#[derive(Default)]
pub struct MemoryKv {
    inner: Mutex<Inner>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, KvError> {
        self.inner.lock().map_err(|_| KvError::Poisoned)
    }
}

fn as_str(stored: &Stored, key: &str) -> Result<Vec<u8>, KvError> {
    match &stored.entry {
        Entry::Str(v) => Ok(v.clone()),
        _ => Err(KvError::WrongType(key.to_string())),
    }
}

fn hash_of<'a>(
    stored: &'a mut Stored,
    key: &str,
) -> Result<&'a mut HashMap<String, Vec<u8>>, KvError> {
    match &mut stored.entry {
        Entry::Hash(h) => Ok(h),
        _ => Err(KvError::WrongType(key.to_string())),
    }
}

fn zset_of<'a>(
    stored: &'a mut Stored,
    key: &str,
) -> Result<&'a mut HashMap<String, (f64, u64)>, KvError> {
    match &mut stored.entry {
        Entry::Zset(z) => Ok(z),
        _ => Err(KvError::WrongType(key.to_string())),
    }
}

/// Members sorted by `(score, insertion seq)`.
fn sorted_members(z: &HashMap<String, (f64, u64)>) -> Vec<(String, f64, u64)> {
    let mut members: Vec<(String, f64, u64)> = z
        .iter()
        .map(|(m, (score, seq))| (m.clone(), *score, *seq))
        .collect();
    members.sort_by(|a, b| {
        a.1.partial_cmp(&b.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.2.cmp(&b.2))
    });
    members
}

#[async_trait]
impl Kv for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let mut inner = self.lock()?;
        match inner.live_entry(key) {
            Some(stored) => Ok(Some(as_str(stored, key)?)),
            None => Ok(None),
        }
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, KvError> {
        let mut inner = self.lock()?;
        keys.iter()
            .map(|key| match inner.live_entry(key) {
                Some(stored) => as_str(stored, key).map(Some),
                None => Ok(None),
            })
            .collect()
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), KvError> {
        let mut inner = self.lock()?;
        inner.map.insert(
            key.to_string(),
            Stored { entry: Entry::Str(value), expires_at: None },
        );
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), KvError> {
        let mut inner = self.lock()?;
        inner.map.insert(
            key.to_string(),
            Stored {
                entry: Entry::Str(value),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn mset(&self, pairs: Vec<(String, Vec<u8>)>) -> Result<(), KvError> {
        let mut inner = self.lock()?;
        for (key, value) in pairs {
            inner
                .map
                .insert(key, Stored { entry: Entry::Str(value), expires_at: None });
        }
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<u64, KvError> {
        let mut inner = self.lock()?;
        let now = Instant::now();
        let mut removed = 0;
        for key in keys {
            if let Some(stored) = inner.map.remove(key) {
                if stored.live(now) {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, KvError> {
        let mut inner = self.lock()?;
        match inner.live_entry(key) {
            Some(stored) => {
                stored.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_nx_ex(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<bool, KvError> {
        let mut inner = self.lock()?;
        if inner.live_entry(key).is_some() {
            return Ok(false);
        }
        inner.map.insert(
            key.to_string(),
            Stored {
                entry: Entry::Str(value),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool, KvError> {
        let mut inner = self.lock()?;
        let matches = match inner.live_entry(key) {
            Some(stored) => as_str(stored, key)? == expected,
            None => false,
        };
        if matches {
            inner.map.remove(key);
        }
        Ok(matches)
    }

    async fn expire_if_equal(
        &self,
        key: &str,
        expected: &[u8],
        ttl: Duration,
    ) -> Result<bool, KvError> {
        let mut inner = self.lock()?;
        match inner.live_entry(key) {
            Some(stored) if as_str(stored, key)? == expected => {
                stored.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn incr(&self, key: &str) -> Result<i64, KvError> {
        let mut inner = self.lock()?;
        let current = match inner.live_entry(key) {
            Some(stored) => {
                let bytes = as_str(stored, key)?;
                std::str::from_utf8(&bytes)
                    .ok()
                    .and_then(|s| s.parse::<i64>().ok())
                    .ok_or_else(|| KvError::WrongType(key.to_string()))?
            }
            None => 0,
        };
        let next = current + 1;
        let expires_at = inner.map.get(key).and_then(|s| s.expires_at);
        inner.map.insert(
            key.to_string(),
            Stored {
                entry: Entry::Str(next.to_string().into_bytes()),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64, KvError> {
        let mut inner = self.lock()?;
        match inner.live_entry(key) {
            Some(stored) => {
                let bytes = as_str(stored, key)?;
                let current = std::str::from_utf8(&bytes)
                    .ok()
                    .and_then(|s| s.parse::<i64>().ok())
                    .ok_or_else(|| KvError::WrongType(key.to_string()))?;
                let next = current + 1;
                stored.entry = Entry::Str(next.to_string().into_bytes());
                Ok(next)
            }
            None => {
                inner.map.insert(
                    key.to_string(),
                    Stored {
                        entry: Entry::Str(b"1".to_vec()),
                        expires_at: Some(Instant::now() + ttl),
                    },
                );
                Ok(1)
            }
        }
    }

    async fn fetch_update(&self, key: &str, f: UpdateFn) -> Result<Option<Vec<u8>>, KvError> {
        let mut inner = self.lock()?;
        let current = match inner.live_entry(key) {
            Some(stored) => Some(as_str(stored, key)?),
            None => None,
        };
        match f(current.as_deref()) {
            Some(new_value) => {
                let expires_at = inner.map.get(key).and_then(|s| s.expires_at);
                inner.map.insert(
                    key.to_string(),
                    Stored { entry: Entry::Str(new_value.clone()), expires_at },
                );
                Ok(Some(new_value))
            }
            None => Ok(None),
        }
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>, KvError> {
        let mut inner = self.lock()?;
        match inner.live_entry(key) {
            Some(stored) => Ok(hash_of(stored, key)?.get(field).cloned()),
            None => Ok(None),
        }
    }

    async fn hset(&self, key: &str, field: &str, value: Vec<u8>) -> Result<(), KvError> {
        let mut inner = self.lock()?;
        if inner.live_entry(key).is_none() {
            inner.map.insert(
                key.to_string(),
                Stored { entry: Entry::Hash(HashMap::new()), expires_at: None },
            );
        }
        let stored = inner.map.get_mut(key).expect("just ensured present");
        hash_of(stored, key)?.insert(field.to_string(), value);
        Ok(())
    }

    async fn hset_nx(&self, key: &str, field: &str, value: Vec<u8>) -> Result<bool, KvError> {
        let mut inner = self.lock()?;
        if inner.live_entry(key).is_none() {
            inner.map.insert(
                key.to_string(),
                Stored { entry: Entry::Hash(HashMap::new()), expires_at: None },
            );
        }
        let stored = inner.map.get_mut(key).expect("just ensured present");
        let hash = hash_of(stored, key)?;
        if hash.contains_key(field) {
            return Ok(false);
        }
        hash.insert(field.to_string(), value);
        Ok(true)
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool, KvError> {
        let mut inner = self.lock()?;
        match inner.live_entry(key) {
            Some(stored) => Ok(hash_of(stored, key)?.remove(field).is_some()),
            None => Ok(false),
        }
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), KvError> {
        let mut inner = self.lock()?;
        let seq = inner.next_seq();
        if inner.live_entry(key).is_none() {
            inner.map.insert(
                key.to_string(),
                Stored { entry: Entry::Zset(HashMap::new()), expires_at: None },
            );
        }
        let stored = inner.map.get_mut(key).expect("just ensured present");
        zset_of(stored, key)?.insert(member.to_string(), (score, seq));
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, KvError> {
        let mut inner = self.lock()?;
        match inner.live_entry(key) {
            Some(stored) => Ok(zset_of(stored, key)?.remove(member).is_some()),
            None => Ok(false),
        }
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, KvError> {
        let mut inner = self.lock()?;
        match inner.live_entry(key) {
            Some(stored) => Ok(zset_of(stored, key)?.get(member).map(|(s, _)| *s)),
            None => Ok(None),
        }
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        max: f64,
        limit: usize,
    ) -> Result<Vec<String>, KvError> {
        let mut inner = self.lock()?;
        match inner.live_entry(key) {
            Some(stored) => {
                let z = zset_of(stored, key)?;
                Ok(sorted_members(z)
                    .into_iter()
                    .filter(|(_, score, _)| *score <= max)
                    .take(limit)
                    .map(|(member, _, _)| member)
                    .collect())
            }
            None => Ok(Vec::new()),
        }
    }

    async fn zrange_by_rank(
        &self,
        key: &str,
        start: usize,
        count: usize,
    ) -> Result<Vec<String>, KvError> {
        let mut inner = self.lock()?;
        match inner.live_entry(key) {
            Some(stored) => {
                let z = zset_of(stored, key)?;
                Ok(sorted_members(z)
                    .into_iter()
                    .skip(start)
                    .take(count)
                    .map(|(member, _, _)| member)
                    .collect())
            }
            None => Ok(Vec::new()),
        }
    }

    async fn zrem_below(&self, key: &str, min: f64) -> Result<u64, KvError> {
        let mut inner = self.lock()?;
        match inner.live_entry(key) {
            Some(stored) => {
                let z = zset_of(stored, key)?;
                let before = z.len();
                z.retain(|_, (score, _)| *score >= min);
                Ok((before - z.len()) as u64)
            }
            None => Ok(0),
        }
    }

    async fn zcard(&self, key: &str) -> Result<u64, KvError> {
        let mut inner = self.lock()?;
        match inner.live_entry(key) {
            Some(stored) => Ok(zset_of(stored, key)?.len() as u64),
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kv() -> MemoryKv {
        MemoryKv::new()
    }

    #[tokio::test]
    async fn test_get_set_round_trip() {
        let kv = kv();
        kv.set("k", b"v".to_vec()).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), Some(b"v".to_vec()));
        assert_eq!(kv.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_mget_aligns_with_keys() {
        let kv = kv();
        kv.set("a", b"1".to_vec()).await.unwrap();
        kv.set("c", b"3".to_vec()).await.unwrap();
        let out = kv
            .mget(&["a".into(), "b".into(), "c".into()])
            .await
            .unwrap();
        assert_eq!(out, vec![Some(b"1".to_vec()), None, Some(b"3".to_vec())]);
    }

    #[tokio::test]
    async fn test_set_nx_ex_only_first_wins() {
        let kv = kv();
        let ttl = Duration::from_secs(60);
        assert!(kv.set_nx_ex("lock", b"a".to_vec(), ttl).await.unwrap());
        assert!(!kv.set_nx_ex("lock", b"b".to_vec(), ttl).await.unwrap());
        assert_eq!(kv.get("lock").await.unwrap(), Some(b"a".to_vec()));
    }

    #[tokio::test]
    async fn test_set_nx_succeeds_after_expiry() {
        let kv = kv();
        assert!(kv
            .set_nx_ex("lock", b"a".to_vec(), Duration::ZERO)
            .await
            .unwrap());
        // TTL of zero is already elapsed — the key behaves as absent.
        assert!(kv
            .set_nx_ex("lock", b"b".to_vec(), Duration::from_secs(60))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_compare_and_delete_respects_holder() {
        let kv = kv();
        kv.set("lock", b"mine".to_vec()).await.unwrap();
        assert!(!kv.compare_and_delete("lock", b"theirs").await.unwrap());
        assert_eq!(kv.get("lock").await.unwrap(), Some(b"mine".to_vec()));
        assert!(kv.compare_and_delete("lock", b"mine").await.unwrap());
        assert_eq!(kv.get("lock").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expire_if_equal() {
        let kv = kv();
        kv.set("leader", b"w1".to_vec()).await.unwrap();
        assert!(kv
            .expire_if_equal("leader", b"w1", Duration::from_secs(15))
            .await
            .unwrap());
        assert!(!kv
            .expire_if_equal("leader", b"w2", Duration::from_secs(15))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_incr_with_ttl_counts_within_window() {
        let kv = kv();
        let ttl = Duration::from_secs(60);
        assert_eq!(kv.incr_with_ttl("rl", ttl).await.unwrap(), 1);
        assert_eq!(kv.incr_with_ttl("rl", ttl).await.unwrap(), 2);
        assert_eq!(kv.incr_with_ttl("rl", ttl).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_incr_with_ttl_resets_after_window() {
        let kv = kv();
        assert_eq!(kv.incr_with_ttl("rl", Duration::ZERO).await.unwrap(), 1);
        // The bucket expired instantly; the next touch starts over.
        assert_eq!(
            kv.incr_with_ttl("rl", Duration::from_secs(60)).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_fetch_update_writes_and_returns_new_value() {
        let kv = kv();
        kv.set("doc", b"1".to_vec()).await.unwrap();
        let out = kv
            .fetch_update(
                "doc",
                Box::new(|current| {
                    let mut v = current.unwrap().to_vec();
                    v.push(b'2');
                    Some(v)
                }),
            )
            .await
            .unwrap();
        assert_eq!(out, Some(b"12".to_vec()));
        assert_eq!(kv.get("doc").await.unwrap(), Some(b"12".to_vec()));
    }

    #[tokio::test]
    async fn test_fetch_update_decline_leaves_value() {
        let kv = kv();
        kv.set("doc", b"x".to_vec()).await.unwrap();
        let out = kv.fetch_update("doc", Box::new(|_| None)).await.unwrap();
        assert_eq!(out, None);
        assert_eq!(kv.get("doc").await.unwrap(), Some(b"x".to_vec()));
    }

    #[tokio::test]
    async fn test_hset_nx_is_conditional() {
        let kv = kv();
        assert!(kv.hset_nx("codes", "AB2CD", b"r1".to_vec()).await.unwrap());
        assert!(!kv.hset_nx("codes", "AB2CD", b"r2".to_vec()).await.unwrap());
        assert_eq!(
            kv.hget("codes", "AB2CD").await.unwrap(),
            Some(b"r1".to_vec())
        );
    }

    #[tokio::test]
    async fn test_zset_orders_by_score_then_insertion() {
        let kv = kv();
        kv.zadd("due", "room-b", 10.0).await.unwrap();
        kv.zadd("due", "room-a", 10.0).await.unwrap();
        kv.zadd("due", "room-c", 5.0).await.unwrap();

        let out = kv.zrange_by_score("due", 100.0, 10).await.unwrap();
        // room-c has the lowest score; b and a share a score and keep
        // insertion order.
        assert_eq!(out, vec!["room-c", "room-b", "room-a"]);
    }

    #[tokio::test]
    async fn test_zrange_by_score_respects_max_and_limit() {
        let kv = kv();
        for (m, s) in [("a", 1.0), ("b", 2.0), ("c", 3.0)] {
            kv.zadd("z", m, s).await.unwrap();
        }
        assert_eq!(
            kv.zrange_by_score("z", 2.0, 10).await.unwrap(),
            vec!["a", "b"]
        );
        assert_eq!(kv.zrange_by_score("z", 3.0, 1).await.unwrap(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_zadd_rescore_moves_member() {
        let kv = kv();
        kv.zadd("z", "m", 1.0).await.unwrap();
        kv.zadd("z", "m", 50.0).await.unwrap();
        assert_eq!(kv.zscore("z", "m").await.unwrap(), Some(50.0));
        assert_eq!(kv.zcard("z").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_zrem_below_prunes_stale_scores() {
        let kv = kv();
        kv.zadd("hb", "old", 100.0).await.unwrap();
        kv.zadd("hb", "new", 200.0).await.unwrap();
        assert_eq!(kv.zrem_below("hb", 150.0).await.unwrap(), 1);
        assert_eq!(kv.zrange_by_score("hb", f64::MAX, 10).await.unwrap(), vec!["new"]);
    }

    #[tokio::test]
    async fn test_wrong_type_access_is_an_error() {
        let kv = kv();
        kv.set("s", b"v".to_vec()).await.unwrap();
        let err = kv.hget("s", "f").await;
        assert!(matches!(err, Err(KvError::WrongType(_))));
        let err = kv.zadd("s", "m", 1.0).await;
        assert!(matches!(err, Err(KvError::WrongType(_))));
    }

    #[tokio::test]
    async fn test_del_counts_live_keys() {
        let kv = kv();
        kv.set("a", b"1".to_vec()).await.unwrap();
        kv.set("b", b"2".to_vec()).await.unwrap();
        let removed = kv
            .del(&["a".into(), "b".into(), "missing".into()])
            .await
            .unwrap();
        assert_eq!(removed, 2);
    }
}
