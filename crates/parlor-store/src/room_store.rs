//! Room persistence: state bytes, meta document, and the per-room lock.
//!
//! The store is the exclusive owner of every `game:*` key. Saving a room
//! also registers it in the registry indexes, so a room is discoverable
//! the moment its first write lands.

use std::sync::Arc;
use std::time::Duration;

use parlor_protocol::{decode_state, encode_state, GameState, MigrationRegistry, RoomId, RoomMeta};
use uuid::Uuid;

use crate::{keys, Kv, RoomRegistry, StoreError};

/// A held per-room lock. Release it with [`RoomStore::unlock`]; the
/// token makes release safe against another worker's lock.
#[derive(Debug)]
pub struct RoomLock {
    key: String,
    token: String,
}

impl RoomLock {
    pub fn token(&self) -> &str {
        &self.token
    }
}

pub struct RoomStore {
    kv: Arc<dyn Kv>,
    registry: Arc<RoomRegistry>,
    migrations: MigrationRegistry,
    /// Worker-unique prefix baked into every lock token, so tokens are
    /// attributable in logs.
    worker_id: String,
}

impl RoomStore {
    pub fn new(kv: Arc<dyn Kv>, registry: Arc<RoomRegistry>) -> Self {
        Self::with_migrations(kv, registry, MigrationRegistry::new())
    }

    pub fn with_migrations(
        kv: Arc<dyn Kv>,
        registry: Arc<RoomRegistry>,
        migrations: MigrationRegistry,
    ) -> Self {
        Self {
            kv,
            registry,
            migrations,
            worker_id: Uuid::new_v4().simple().to_string(),
        }
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    // -- load / save -----------------------------------------------------

    /// Loads a room's state and meta in one pipelined read.
    ///
    /// Returns `None` when the room is absent — and also when either half
    /// is missing or fails to decode: a partial or corrupt record is
    /// logged and treated as absent so the caller can decide whether to
    /// recreate.
    pub async fn load<S: GameState>(
        &self,
        game_type: &str,
        room_id: &RoomId,
    ) -> Result<Option<(S, RoomMeta)>, StoreError> {
        let read = self
            .kv
            .mget(&[
                keys::state_key(game_type, room_id),
                keys::meta_key(game_type, room_id),
            ])
            .await?;

        let (state_bytes, meta_bytes) = match (&read[0], &read[1]) {
            (Some(s), Some(m)) => (s, m),
            (None, None) => return Ok(None),
            _ => {
                tracing::warn!(
                    %room_id,
                    game_type,
                    has_state = read[0].is_some(),
                    has_meta = read[1].is_some(),
                    "partial room record, treating as absent"
                );
                return Ok(None);
            }
        };

        let state = match decode_state::<S>(state_bytes, &self.migrations) {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(%room_id, game_type, error = %e, "state decode failed");
                return Ok(None);
            }
        };
        let meta = match serde_json::from_slice::<RoomMeta>(meta_bytes) {
            Ok(meta) => meta,
            Err(e) => {
                tracing::warn!(%room_id, game_type, error = %e, "meta decode failed");
                return Ok(None);
            }
        };
        Ok(Some((state, meta)))
    }

    pub async fn load_meta(
        &self,
        game_type: &str,
        room_id: &RoomId,
    ) -> Result<Option<RoomMeta>, StoreError> {
        let bytes = self.kv.get(&keys::meta_key(game_type, room_id)).await?;
        match bytes {
            Some(bytes) => match serde_json::from_slice::<RoomMeta>(&bytes) {
                Ok(meta) => Ok(Some(meta)),
                Err(e) => {
                    tracing::warn!(%room_id, game_type, error = %e, "meta decode failed");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    /// Batched load; rooms that are absent or fail to decode are omitted.
    pub async fn load_many<S: GameState>(
        &self,
        game_type: &str,
        room_ids: &[RoomId],
    ) -> Result<Vec<(RoomId, S, RoomMeta)>, StoreError> {
        let mut read_keys = Vec::with_capacity(room_ids.len() * 2);
        for id in room_ids {
            read_keys.push(keys::state_key(game_type, id));
            read_keys.push(keys::meta_key(game_type, id));
        }
        let read = self.kv.mget(&read_keys).await?;

        let mut out = Vec::with_capacity(room_ids.len());
        for (i, id) in room_ids.iter().enumerate() {
            let (Some(state_bytes), Some(meta_bytes)) = (&read[i * 2], &read[i * 2 + 1])
            else {
                continue;
            };
            let Ok(state) = decode_state::<S>(state_bytes, &self.migrations) else {
                tracing::warn!(room_id = %id, game_type, "state decode failed in batch");
                continue;
            };
            let Ok(meta) = serde_json::from_slice::<RoomMeta>(meta_bytes) else {
                continue;
            };
            out.push((id.clone(), state, meta));
        }
        Ok(out)
    }

    pub async fn load_meta_many(
        &self,
        game_type: &str,
        room_ids: &[RoomId],
    ) -> Result<Vec<(RoomId, RoomMeta)>, StoreError> {
        let read_keys: Vec<String> = room_ids
            .iter()
            .map(|id| keys::meta_key(game_type, id))
            .collect();
        let read = self.kv.mget(&read_keys).await?;

        Ok(room_ids
            .iter()
            .zip(read)
            .filter_map(|(id, bytes)| {
                let meta = serde_json::from_slice::<RoomMeta>(&bytes?).ok()?;
                Some((id.clone(), meta))
            })
            .collect())
    }

    /// Writes state and meta in one pipeline, then registers the room in
    /// the registry indexes.
    pub async fn save<S: GameState>(
        &self,
        game_type: &str,
        room_id: &RoomId,
        state: &S,
        meta: &RoomMeta,
        now: i64,
    ) -> Result<(), StoreError> {
        let state_bytes = encode_state(state).inspect_err(|e| {
            tracing::error!(%room_id, game_type, error = %e, "state encode failed");
        })?;
        let meta_bytes = serde_json::to_vec(meta)?;

        self.kv
            .mset(vec![
                (keys::state_key(game_type, room_id), state_bytes),
                (keys::meta_key(game_type, room_id), meta_bytes),
            ])
            .await?;

        self.registry.register_room(game_type, room_id, now).await
    }

    /// Atomically mutates the meta document under the store's scripted
    /// read-modify-write. The closure returns `true` to commit its edit.
    /// Returns the updated meta when committed, `None` when the closure
    /// declined or the room is absent.
    pub async fn update_meta<F>(
        &self,
        game_type: &str,
        room_id: &RoomId,
        mutate: F,
    ) -> Result<Option<RoomMeta>, StoreError>
    where
        F: FnOnce(&mut RoomMeta) -> bool + Send + 'static,
    {
        let written = self
            .kv
            .fetch_update(
                &keys::meta_key(game_type, room_id),
                Box::new(move |current| {
                    let mut meta: RoomMeta =
                        serde_json::from_slice(current?).ok()?;
                    if !mutate(&mut meta) {
                        return None;
                    }
                    serde_json::to_vec(&meta).ok()
                }),
            )
            .await?;

        match written {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    // -- locking ---------------------------------------------------------

    /// Attempts the per-room lock. `None` means another worker holds it.
    pub async fn try_lock(
        &self,
        game_type: &str,
        room_id: &RoomId,
        ttl: Duration,
    ) -> Result<Option<RoomLock>, StoreError> {
        let key = keys::lock_key(game_type, room_id);
        let token = format!("{}:{}", self.worker_id, Uuid::new_v4().simple());
        let held = self
            .kv
            .set_nx_ex(&key, token.as_bytes().to_vec(), ttl)
            .await?;
        Ok(held.then_some(RoomLock { key, token }))
    }

    /// Releases a held lock via compare-and-delete; never deletes another
    /// worker's lock. Returns false if the lock had already expired and
    /// been re-acquired.
    pub async fn unlock(&self, lock: RoomLock) -> Result<bool, StoreError> {
        let released = self
            .kv
            .compare_and_delete(&lock.key, lock.token.as_bytes())
            .await?;
        if !released {
            tracing::warn!(key = %lock.key, "lock expired before release");
        }
        Ok(released)
    }

    /// Deletes a room's state, meta, and lock, and unregisters it from
    /// every index.
    pub async fn delete(&self, game_type: &str, room_id: &RoomId) -> Result<(), StoreError> {
        self.kv
            .del(&[
                keys::state_key(game_type, room_id),
                keys::meta_key(game_type, room_id),
                keys::lock_key(game_type, room_id),
            ])
            .await?;
        self.registry.unregister_room(game_type, room_id).await?;
        tracing::info!(%room_id, game_type, "room deleted");
        Ok(())
    }
}
