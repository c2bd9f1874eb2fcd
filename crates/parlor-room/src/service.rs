//! The create/join/leave/delete flow shared by game modules.
//!
//! Join order of operations matters and is fixed:
//!
//! 1. reject if the user is already in a room (registry claim);
//! 2. reserve the entry fee;
//! 3. run the seat-allocation script against the meta key (atomic
//!    read → decode → mutate → write, so two concurrent joins can never
//!    double-book a seat);
//! 4. commit the reservation — or refund it if the seat write failed.

use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parlor_protocol::{GameState, RoomId, RoomMeta, UserId};
use parlor_economy::Economy;
use parlor_store::{RoomRegistry, RoomStore};

use crate::{RoomError, RoomService};

pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// The stock [`RoomService`] used by every bundled module.
///
/// Generic over the module's state type so `create_room` can write the
/// initial state; everything else is state-agnostic.
pub struct StandardRoomService<S, F>
where
    S: GameState,
    F: Fn(&RoomMeta) -> S + Send + Sync,
{
    game_type: String,
    store: Arc<RoomStore>,
    registry: Arc<RoomRegistry>,
    economy: Arc<Economy>,
    initial_state: F,
}

impl<S, F> StandardRoomService<S, F>
where
    S: GameState,
    F: Fn(&RoomMeta) -> S + Send + Sync,
{
    pub fn new(
        game_type: impl Into<String>,
        store: Arc<RoomStore>,
        economy: Arc<Economy>,
        initial_state: F,
    ) -> Self {
        let registry = store.registry().clone();
        Self {
            game_type: game_type.into(),
            store,
            registry,
            economy,
            initial_state,
        }
    }
}

/// Outcome cell smuggled into the seat-allocation script so the precise
/// rejection reason survives the closure boundary.
#[derive(Debug, Clone, Copy, PartialEq)]
enum SeatOutcome {
    Seated(u8),
    AlreadySeated(u8),
    Full,
}

#[async_trait]
impl<S, F> RoomService for StandardRoomService<S, F>
where
    S: GameState,
    F: Fn(&RoomMeta) -> S + Send + Sync,
{
    async fn create_room(&self, meta: RoomMeta) -> Result<RoomId, RoomError> {
        let room_id = RoomId::new();
        let state = (self.initial_state)(&meta);
        self.store
            .save(&self.game_type, &room_id, &state, &meta, unix_now())
            .await?;
        let code = self.registry.assign_short_code(&room_id).await?;
        tracing::info!(%room_id, game_type = %self.game_type, code, "room created");
        Ok(room_id)
    }

    async fn join_room(&self, room_id: &RoomId, user_id: &UserId) -> Result<u8, RoomError> {
        // One active room per user, enforced by the registry's
        // conditional insert.
        if !self.registry.claim_user_room(user_id, room_id).await? {
            let current = self.registry.user_room(user_id).await?;
            if current.as_ref() != Some(room_id) {
                return Err(RoomError::AlreadyInRoom(user_id.clone()));
            }
            // Re-joining the same room falls through; the seat script
            // reports their existing seat.
        }

        let Some(meta) = self.store.load_meta(&self.game_type, room_id).await? else {
            self.registry.clear_user_room(user_id).await?;
            return Err(RoomError::NotFound(room_id.clone()));
        };

        // Reserve the fee before the seat becomes visible.
        let reservation = if meta.entry_fee > 0 {
            match self
                .economy
                .reserve_entry_fee(user_id, meta.entry_fee, room_id)
                .await
            {
                Ok(r) => Some(r),
                Err(e) => {
                    self.registry.clear_user_room(user_id).await?;
                    return Err(e.into());
                }
            }
        } else {
            None
        };

        let outcome = Arc::new(Mutex::new(None::<SeatOutcome>));
        let cell = Arc::clone(&outcome);
        let joining = user_id.clone();
        let updated = self
            .store
            .update_meta(&self.game_type, room_id, move |meta| {
                let mut cell = cell.lock().expect("outcome cell");
                if let Some(seat) = meta.seat_of(&joining) {
                    *cell = Some(SeatOutcome::AlreadySeated(seat));
                    return false;
                }
                let Some(seat) = meta.lowest_free_seat() else {
                    *cell = Some(SeatOutcome::Full);
                    return false;
                };
                meta.seats.insert(joining.clone(), seat);
                *cell = Some(SeatOutcome::Seated(seat));
                true
            })
            .await?;

        let outcome = outcome.lock().expect("outcome cell").take();
        match (updated, outcome) {
            (Some(_), Some(SeatOutcome::Seated(seat))) => {
                if let Some(reservation) = reservation {
                    self.economy.commit_entry_fee(&reservation).await?;
                }
                self.registry
                    .touch_activity(&self.game_type, room_id, unix_now())
                    .await?;
                tracing::info!(%room_id, %user_id, seat, "player joined");
                Ok(seat)
            }
            (None, Some(SeatOutcome::AlreadySeated(seat))) => {
                // Their reservation (if any) must not double-charge a
                // seat they already hold.
                if let Some(reservation) = reservation {
                    self.economy.refund_entry_fee(&reservation).await?;
                }
                Ok(seat)
            }
            (None, Some(SeatOutcome::Full)) => {
                if let Some(reservation) = reservation {
                    self.economy.refund_entry_fee(&reservation).await?;
                }
                self.registry.clear_user_room(user_id).await?;
                Err(RoomError::Full(room_id.clone()))
            }
            // The script never ran its body: the meta key vanished
            // between the load above and the script.
            _ => {
                if let Some(reservation) = reservation {
                    self.economy.refund_entry_fee(&reservation).await?;
                }
                self.registry.clear_user_room(user_id).await?;
                Err(RoomError::NotFound(room_id.clone()))
            }
        }
    }

    async fn leave_room(&self, room_id: &RoomId, user_id: &UserId) -> Result<(), RoomError> {
        let leaving = user_id.clone();
        let updated = self
            .store
            .update_meta(&self.game_type, room_id, move |meta| {
                meta.disconnect_grace.remove(&leaving);
                meta.seats.remove(&leaving).is_some()
            })
            .await?;

        self.registry.clear_user_room(user_id).await?;

        if updated.is_none() {
            return Err(RoomError::NotInRoom(user_id.clone(), room_id.clone()));
        }
        self.registry
            .touch_activity(&self.game_type, room_id, unix_now())
            .await?;
        tracing::info!(%room_id, %user_id, "player left");
        Ok(())
    }

    async fn room_meta(&self, room_id: &RoomId) -> Result<Option<RoomMeta>, RoomError> {
        Ok(self.store.load_meta(&self.game_type, room_id).await?)
    }

    async fn delete_room(&self, room_id: &RoomId) -> Result<(), RoomError> {
        if let Some(meta) = self.store.load_meta(&self.game_type, room_id).await? {
            for user in meta.seats.keys() {
                self.registry.clear_user_room(user).await?;
            }
        }
        self.store.delete(&self.game_type, room_id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parlor_economy::{MemoryWallet, WalletRepository};
    use parlor_store::{Kv, MemoryKv};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct MiniState {
        started: u8,
    }

    impl GameState for MiniState {
        const VERSION: u8 = 1;
        const ENCODED_SIZE: usize = 1;
    }

    struct Rig {
        service: StandardRoomService<MiniState, fn(&RoomMeta) -> MiniState>,
        wallet: Arc<MemoryWallet>,
        registry: Arc<RoomRegistry>,
    }

    fn initial(_meta: &RoomMeta) -> MiniState {
        MiniState { started: 0 }
    }

    fn rig() -> Rig {
        let kv: Arc<dyn Kv> = Arc::new(MemoryKv::new());
        let registry = Arc::new(RoomRegistry::new(kv.clone()));
        let store = Arc::new(RoomStore::new(kv, registry.clone()));
        let wallet = Arc::new(MemoryWallet::new());
        let economy = Arc::new(Economy::new(wallet.clone(), 500, 3));
        Rig {
            service: StandardRoomService::new(
                "mini",
                store,
                economy,
                initial as fn(&RoomMeta) -> MiniState,
            ),
            wallet,
            registry,
        }
    }

    fn uid(s: &str) -> UserId {
        UserId::new(s)
    }

    fn meta(max_seats: u8, fee: i64) -> RoomMeta {
        let mut m = RoomMeta::new("mini", max_seats, unix_now());
        m.entry_fee = fee;
        m
    }

    #[tokio::test]
    async fn test_create_room_registers_and_assigns_code() {
        let rig = rig();
        let room = rig.service.create_room(meta(2, 0)).await.unwrap();

        assert_eq!(
            rig.registry.game_type_of(&room).await.unwrap(),
            Some("mini".into())
        );
        assert!(rig.registry.short_code_of(&room).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_join_allocates_lowest_free_seat() {
        let rig = rig();
        let room = rig.service.create_room(meta(3, 0)).await.unwrap();

        assert_eq!(rig.service.join_room(&room, &uid("a")).await.unwrap(), 0);
        assert_eq!(rig.service.join_room(&room, &uid("b")).await.unwrap(), 1);

        // Seat 0 frees up and is re-used before seat 2.
        rig.service.leave_room(&room, &uid("a")).await.unwrap();
        assert_eq!(rig.service.join_room(&room, &uid("c")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_join_full_room_is_rejected() {
        let rig = rig();
        let room = rig.service.create_room(meta(1, 0)).await.unwrap();
        rig.service.join_room(&room, &uid("a")).await.unwrap();

        let err = rig.service.join_room(&room, &uid("b")).await;
        assert!(matches!(err, Err(RoomError::Full(_))));
        // The loser's user→room claim was rolled back.
        assert_eq!(rig.registry.user_room(&uid("b")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_join_second_room_is_rejected() {
        let rig = rig();
        let r1 = rig.service.create_room(meta(2, 0)).await.unwrap();
        let r2 = rig.service.create_room(meta(2, 0)).await.unwrap();
        rig.service.join_room(&r1, &uid("a")).await.unwrap();

        let err = rig.service.join_room(&r2, &uid("a")).await;
        assert!(matches!(err, Err(RoomError::AlreadyInRoom(_))));
    }

    #[tokio::test]
    async fn test_rejoin_same_room_reports_existing_seat() {
        let rig = rig();
        let room = rig.service.create_room(meta(2, 0)).await.unwrap();
        assert_eq!(rig.service.join_room(&room, &uid("a")).await.unwrap(), 0);
        assert_eq!(rig.service.join_room(&room, &uid("a")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_join_reserves_and_commits_entry_fee() {
        let rig = rig();
        let room = rig.service.create_room(meta(2, 100)).await.unwrap();
        rig.service.join_room(&room, &uid("a")).await.unwrap();

        assert_eq!(rig.wallet.balance(&uid("a")).await.unwrap(), Some(400));
        let ledger = rig.wallet.ledger(&uid("a")).await.unwrap();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].amount, -100);
    }

    #[tokio::test]
    async fn test_join_insufficient_funds_leaves_no_claim() {
        let rig = rig();
        let room = rig.service.create_room(meta(2, 900)).await.unwrap();

        let err = rig.service.join_room(&room, &uid("a")).await;
        assert!(matches!(
            err,
            Err(RoomError::Economy(
                parlor_economy::EconomyError::InsufficientFunds { .. }
            ))
        ));
        assert_eq!(rig.registry.user_room(&uid("a")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_join_full_room_refunds_reservation() {
        let rig = rig();
        let room = rig.service.create_room(meta(1, 100)).await.unwrap();
        rig.service.join_room(&room, &uid("a")).await.unwrap();

        let err = rig.service.join_room(&room, &uid("b")).await;
        assert!(matches!(err, Err(RoomError::Full(_))));

        // Reserve then refund: net zero, two paired ledger entries.
        assert_eq!(rig.wallet.balance(&uid("b")).await.unwrap(), Some(500));
        let ledger = rig.wallet.ledger(&uid("b")).await.unwrap();
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger[0].amount, -100);
        assert_eq!(ledger[1].amount, 100);
        assert!(ledger[1]
            .idempotency_key
            .starts_with(&format!("refund:{}", ledger[0].idempotency_key)));
    }

    #[tokio::test]
    async fn test_concurrent_joins_never_double_book() {
        let rig = rig();
        let room = rig.service.create_room(meta(1, 0)).await.unwrap();
        let service = Arc::new(rig.service);

        let mut tasks = Vec::new();
        for name in ["x", "y"] {
            let service = Arc::clone(&service);
            let room = room.clone();
            tasks.push(tokio::spawn(async move {
                service.join_room(&room, &uid(name)).await
            }));
        }
        let results: Vec<_> = futures_util::future::join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        let won = results.iter().filter(|r| r.is_ok()).count();
        let full = results
            .iter()
            .filter(|r| matches!(r, Err(RoomError::Full(_))))
            .count();
        assert_eq!((won, full), (1, 1));
    }

    #[tokio::test]
    async fn test_leave_unknown_user_errors() {
        let rig = rig();
        let room = rig.service.create_room(meta(2, 0)).await.unwrap();
        let err = rig.service.leave_room(&room, &uid("ghost")).await;
        assert!(matches!(err, Err(RoomError::NotInRoom(_, _))));
    }

    #[tokio::test]
    async fn test_delete_room_clears_user_claims() {
        let rig = rig();
        let room = rig.service.create_room(meta(2, 0)).await.unwrap();
        rig.service.join_room(&room, &uid("a")).await.unwrap();

        rig.service.delete_room(&room).await.unwrap();

        assert_eq!(rig.registry.user_room(&uid("a")).await.unwrap(), None);
        assert!(rig.service.room_meta(&room).await.unwrap().is_none());
    }
}
