//! The room registry: every global index the runtime consults.
//!
//! The registry owns the `global:*`, `index:*`, and `ratelimit:*`
//! keyspace. It never touches a room's state or meta — that belongs to
//! the [`RoomStore`](crate::RoomStore) — and nothing else writes these
//! keys.

use std::sync::Arc;
use std::time::Duration;

use parlor_protocol::{ConnectionId, RoomId, UserId};

use crate::{keys, Kv, StoreError};

/// Short codes use a 32-character alphabet with no look-alikes
/// (no `0/O`, `1/I/L`).
pub const SHORT_CODE_ALPHABET: &[u8; 32] = b"23456789ABCDEFGHJKLMNPQRSTUVWXYZ";

/// Code length; 32^5 ≈ 33M distinct codes.
pub const SHORT_CODE_LEN: usize = 5;

/// How many conditional-insert attempts before giving up on a code.
const SHORT_CODE_ATTEMPTS: u32 = 10;

/// Heartbeat TTL: a connection entry is live for this long past its
/// last heartbeat, and a user is online while any entry is live.
pub(crate) const HEARTBEAT_TTL_SECS: i64 = 120;

/// Disconnect tickets outlive their grace period by this margin so the
/// per-user pointer is still readable when the sweep fires.
const TICKET_SLACK_SECS: u64 = 300;

pub struct RoomRegistry {
    kv: Arc<dyn Kv>,
}

impl RoomRegistry {
    pub fn new(kv: Arc<dyn Kv>) -> Self {
        Self { kv }
    }

    pub(crate) fn kv(&self) -> &Arc<dyn Kv> {
        &self.kv
    }

    // -- room registration ----------------------------------------------

    /// Registers a room in the global registry and the per-game-type
    /// creation and activity indexes. Idempotent: re-registering an
    /// existing room only refreshes its activity.
    pub async fn register_room(
        &self,
        game_type: &str,
        room_id: &RoomId,
        now: i64,
    ) -> Result<(), StoreError> {
        let fresh = self
            .kv
            .hset_nx(
                keys::ROOM_REGISTRY,
                room_id.as_str(),
                game_type.as_bytes().to_vec(),
            )
            .await?;
        if fresh {
            self.kv
                .zadd(&keys::rooms_index(game_type), room_id.as_str(), now as f64)
                .await?;
        }
        self.kv
            .zadd(&keys::activity_index(game_type), room_id.as_str(), now as f64)
            .await?;
        Ok(())
    }

    /// Removes a room from every index, including its short code.
    pub async fn unregister_room(
        &self,
        game_type: &str,
        room_id: &RoomId,
    ) -> Result<(), StoreError> {
        self.kv.hdel(keys::ROOM_REGISTRY, room_id.as_str()).await?;
        self.kv
            .zrem(&keys::rooms_index(game_type), room_id.as_str())
            .await?;
        self.kv
            .zrem(&keys::activity_index(game_type), room_id.as_str())
            .await?;
        self.kv
            .zrem(&keys::timeouts_index(game_type), room_id.as_str())
            .await?;

        if let Some(code) = self.short_code_of(room_id).await? {
            self.kv.hdel(keys::SHORT_CODES, &code).await?;
            self.kv
                .hdel(keys::ROOM_SHORT_CODES, room_id.as_str())
                .await?;
        }
        Ok(())
    }

    /// The game type a room was registered under.
    pub async fn game_type_of(&self, room_id: &RoomId) -> Result<Option<String>, StoreError> {
        Ok(self
            .kv
            .hget(keys::ROOM_REGISTRY, room_id.as_str())
            .await?
            .and_then(|bytes| String::from_utf8(bytes).ok()))
    }

    /// Rooms of a game type ordered by creation time, paged by rank.
    pub async fn rooms_by_game_type(
        &self,
        game_type: &str,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<RoomId>, StoreError> {
        let members = self
            .kv
            .zrange_by_rank(&keys::rooms_index(game_type), page * page_size, page_size)
            .await?;
        Ok(members.iter().filter_map(|m| RoomId::parse(m)).collect())
    }

    // -- activity --------------------------------------------------------

    pub async fn touch_activity(
        &self,
        game_type: &str,
        room_id: &RoomId,
        now: i64,
    ) -> Result<(), StoreError> {
        self.kv
            .zadd(&keys::activity_index(game_type), room_id.as_str(), now as f64)
            .await?;
        Ok(())
    }

    /// Rooms whose last activity is at or before `cutoff`, oldest first.
    pub async fn idle_rooms(
        &self,
        game_type: &str,
        cutoff: i64,
        limit: usize,
    ) -> Result<Vec<RoomId>, StoreError> {
        let members = self
            .kv
            .zrange_by_score(&keys::activity_index(game_type), cutoff as f64, limit)
            .await?;
        Ok(members.iter().filter_map(|m| RoomId::parse(m)).collect())
    }

    // -- turn timeouts ---------------------------------------------------

    pub async fn register_turn_timeout(
        &self,
        game_type: &str,
        room_id: &RoomId,
        due_at: i64,
    ) -> Result<(), StoreError> {
        self.kv
            .zadd(&keys::timeouts_index(game_type), room_id.as_str(), due_at as f64)
            .await?;
        Ok(())
    }

    pub async fn unregister_turn_timeout(
        &self,
        game_type: &str,
        room_id: &RoomId,
    ) -> Result<(), StoreError> {
        self.kv
            .zrem(&keys::timeouts_index(game_type), room_id.as_str())
            .await?;
        Ok(())
    }

    /// Rooms whose turn is due at or before `now`; equal due-times come
    /// back in insertion order.
    pub async fn rooms_due_for_timeout(
        &self,
        game_type: &str,
        now: i64,
        limit: usize,
    ) -> Result<Vec<RoomId>, StoreError> {
        let members = self
            .kv
            .zrange_by_score(&keys::timeouts_index(game_type), now as f64, limit)
            .await?;
        Ok(members.iter().filter_map(|m| RoomId::parse(m)).collect())
    }

    // -- short codes -----------------------------------------------------

    /// Allocates a short code for a room and records the bijection.
    ///
    /// Codes come from a monotonically incremented counter pushed through
    /// a double Knuth multiplier, which spreads numerically adjacent
    /// creations across the alphabet. Uniqueness is enforced by the
    /// conditional insert; a collision advances the counter and retries.
    pub async fn assign_short_code(&self, room_id: &RoomId) -> Result<String, StoreError> {
        for _ in 0..SHORT_CODE_ATTEMPTS {
            let n = self.kv.incr(keys::SHORT_CODE_COUNTER).await?;
            let code = short_code_from_counter(n as u64);
            let claimed = self
                .kv
                .hset_nx(keys::SHORT_CODES, &code, room_id.as_str().as_bytes().to_vec())
                .await?;
            if claimed {
                self.kv
                    .hset(
                        keys::ROOM_SHORT_CODES,
                        room_id.as_str(),
                        code.as_bytes().to_vec(),
                    )
                    .await?;
                return Ok(code);
            }
        }
        Err(StoreError::ShortCodeExhausted(SHORT_CODE_ATTEMPTS))
    }

    pub async fn room_by_short_code(&self, code: &str) -> Result<Option<RoomId>, StoreError> {
        let code = code.to_ascii_uppercase();
        Ok(self
            .kv
            .hget(keys::SHORT_CODES, &code)
            .await?
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .and_then(|s| RoomId::parse(&s)))
    }

    pub async fn short_code_of(&self, room_id: &RoomId) -> Result<Option<String>, StoreError> {
        Ok(self
            .kv
            .hget(keys::ROOM_SHORT_CODES, room_id.as_str())
            .await?
            .and_then(|bytes| String::from_utf8(bytes).ok()))
    }

    // -- user → room -----------------------------------------------------

    /// Claims the user's single active-room slot. Returns false if they
    /// are already in a room.
    pub async fn claim_user_room(
        &self,
        user_id: &UserId,
        room_id: &RoomId,
    ) -> Result<bool, StoreError> {
        Ok(self
            .kv
            .hset_nx(
                keys::USER_ROOMS,
                user_id.as_str(),
                room_id.as_str().as_bytes().to_vec(),
            )
            .await?)
    }

    pub async fn user_room(&self, user_id: &UserId) -> Result<Option<RoomId>, StoreError> {
        Ok(self
            .kv
            .hget(keys::USER_ROOMS, user_id.as_str())
            .await?
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .and_then(|s| RoomId::parse(&s)))
    }

    pub async fn clear_user_room(&self, user_id: &UserId) -> Result<(), StoreError> {
        self.kv.hdel(keys::USER_ROOMS, user_id.as_str()).await?;
        Ok(())
    }

    // -- connections and presence ---------------------------------------

    /// Records a connection for a user and refreshes their presence.
    pub async fn register_connection(
        &self,
        user_id: &UserId,
        connection_id: ConnectionId,
        now: i64,
    ) -> Result<(), StoreError> {
        self.heartbeat(user_id, connection_id, now).await
    }

    /// Refreshes a connection's heartbeat; prunes expired siblings on
    /// the way through.
    pub async fn heartbeat(
        &self,
        user_id: &UserId,
        connection_id: ConnectionId,
        now: i64,
    ) -> Result<(), StoreError> {
        let key = keys::user_connections(user_id);
        let floor = (now - HEARTBEAT_TTL_SECS) as f64;
        self.kv.zrem_below(&key, floor).await?;
        self.kv
            .zadd(&key, &connection_id.into_inner().to_string(), now as f64)
            .await?;
        self.kv
            .expire(&key, Duration::from_secs(HEARTBEAT_TTL_SECS as u64))
            .await?;
        self.kv
            .zadd(keys::ONLINE_USERS, user_id.as_str(), now as f64)
            .await?;
        Ok(())
    }

    /// Removes a connection; returns how many live connections the user
    /// still holds.
    pub async fn remove_connection(
        &self,
        user_id: &UserId,
        connection_id: ConnectionId,
        now: i64,
    ) -> Result<u64, StoreError> {
        let key = keys::user_connections(user_id);
        self.kv
            .zrem(&key, &connection_id.into_inner().to_string())
            .await?;
        self.kv
            .zrem_below(&key, (now - HEARTBEAT_TTL_SECS) as f64)
            .await?;
        Ok(self.kv.zcard(&key).await?)
    }

    /// A user is online iff they hold at least one non-expired
    /// connection entry.
    pub async fn is_online(&self, user_id: &UserId, now: i64) -> Result<bool, StoreError> {
        let key = keys::user_connections(user_id);
        self.kv
            .zrem_below(&key, (now - HEARTBEAT_TTL_SECS) as f64)
            .await?;
        Ok(self.kv.zcard(&key).await? > 0)
    }

    /// Users with a heartbeat inside the TTL window; prunes lazily.
    pub async fn online_users(&self, now: i64) -> Result<Vec<UserId>, StoreError> {
        self.kv
            .zrem_below(keys::ONLINE_USERS, (now - HEARTBEAT_TTL_SECS) as f64)
            .await?;
        let members = self
            .kv
            .zrange_by_score(keys::ONLINE_USERS, f64::MAX, usize::MAX)
            .await?;
        Ok(members.into_iter().map(UserId::new).collect())
    }

    // -- disconnect tickets ----------------------------------------------

    /// Writes a grace ticket for a user who lost their last connection
    /// while seated in a room.
    pub async fn add_disconnect_ticket(
        &self,
        user_id: &UserId,
        room_id: &RoomId,
        expires_at: i64,
        grace: Duration,
    ) -> Result<(), StoreError> {
        self.kv
            .zadd(keys::DISCONNECTED_INDEX, user_id.as_str(), expires_at as f64)
            .await?;
        self.kv
            .set_ex(
                &keys::disconnected_player(user_id),
                room_id.as_str().as_bytes().to_vec(),
                grace + Duration::from_secs(TICKET_SLACK_SECS),
            )
            .await?;
        Ok(())
    }

    /// Consumes a user's ticket if one exists, returning the room it
    /// pointed at. Used on reconnect.
    pub async fn take_disconnect_ticket(
        &self,
        user_id: &UserId,
    ) -> Result<Option<RoomId>, StoreError> {
        let key = keys::disconnected_player(user_id);
        let room = self
            .kv
            .get(&key)
            .await?
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .and_then(|s| RoomId::parse(&s));
        if room.is_some() {
            self.kv.del(&[key]).await?;
            self.kv.zrem(keys::DISCONNECTED_INDEX, user_id.as_str()).await?;
        }
        Ok(room)
    }

    /// Tickets whose grace expired at or before `now`, with the room each
    /// pointed at. Tickets whose pointer is gone are dropped from the
    /// index as they are seen.
    pub async fn expired_tickets(
        &self,
        now: i64,
        limit: usize,
    ) -> Result<Vec<(UserId, RoomId)>, StoreError> {
        let members = self
            .kv
            .zrange_by_score(keys::DISCONNECTED_INDEX, now as f64, limit)
            .await?;

        let mut out = Vec::with_capacity(members.len());
        for member in members {
            let user = UserId::new(member);
            match self.take_disconnect_ticket(&user).await? {
                Some(room) => out.push((user, room)),
                None => {
                    self.kv
                        .zrem(keys::DISCONNECTED_INDEX, user.as_str())
                        .await?;
                }
            }
        }
        Ok(out)
    }

    // -- rate limiting ---------------------------------------------------

    /// Returns true iff the user's minute bucket is at or under `max`
    /// after this touch.
    pub async fn check_rate_limit(
        &self,
        user_id: &UserId,
        max: i64,
        window: Duration,
    ) -> Result<bool, StoreError> {
        let count = self
            .kv
            .incr_with_ttl(&keys::rate_limit(user_id), window)
            .await?;
        Ok(count <= max)
    }
}

/// Maps a counter value onto a 5-character code.
///
/// Two rounds of the Knuth multiplicative hash (with an xor-fold between
/// them) mix the counter's low bits into the high bits, so consecutive
/// counters produce unrelated codes.
fn short_code_from_counter(n: u64) -> String {
    const KNUTH: u32 = 2_654_435_761;
    let mut h = (n as u32).wrapping_mul(KNUTH);
    h ^= h >> 16;
    h = h.wrapping_mul(KNUTH);
    // 5 characters × 5 bits = 25 bits of code space.
    let mut value = h & 0x01FF_FFFF;
    let mut code = [0u8; SHORT_CODE_LEN];
    for slot in code.iter_mut().rev() {
        *slot = SHORT_CODE_ALPHABET[(value & 31) as usize];
        value >>= 5;
    }
    String::from_utf8(code.to_vec()).expect("alphabet is ascii")
}
