//! The money rules the room runtime relies on.
//!
//! Joins reserve the entry fee before the seat is final and refund it if
//! the seat write fails, so a failed join is always balance-neutral.
//! Game-end payouts deduct a fixed rake and distribute the remainder by
//! winner-take-all, a ranked table, or equal refund. Every award carries
//! a deterministic idempotency key so outbox retries can never
//! double-credit.

use std::collections::BTreeMap;
use std::sync::Arc;

use parlor_protocol::{RoomId, UserId};
use uuid::Uuid;

use crate::{EconomyError, WalletRepository};

/// A reserved entry fee. Commit it once the seat is written, or refund
/// it when the join fails.
#[derive(Debug, Clone)]
pub struct Reservation {
    pub reservation_id: String,
    pub user_id: UserId,
    pub amount: i64,
}

pub struct Economy {
    wallet: Arc<dyn WalletRepository>,
    initial_coins: i64,
    rake_percent: i64,
}

impl Economy {
    pub fn new(wallet: Arc<dyn WalletRepository>, initial_coins: i64, rake_percent: i64) -> Self {
        Self {
            wallet,
            initial_coins,
            rake_percent,
        }
    }

    pub fn wallet(&self) -> &Arc<dyn WalletRepository> {
        &self.wallet
    }

    /// Debits `fee` from the user and writes a ledger entry keyed by the
    /// fresh reservation id. Fails with `InsufficientFunds` when the
    /// balance cannot cover the fee.
    pub async fn reserve_entry_fee(
        &self,
        user_id: &UserId,
        fee: i64,
        room_id: &RoomId,
    ) -> Result<Reservation, EconomyError> {
        let reservation_id = Uuid::new_v4().simple().to_string();
        self.wallet
            .apply_transaction(
                user_id,
                -fee,
                "entry_fee",
                "entry fee reservation",
                &format!("room:{room_id}"),
                &reservation_id,
                self.initial_coins,
            )
            .await?;
        tracing::debug!(%user_id, %room_id, fee, reservation_id, "entry fee reserved");
        Ok(Reservation {
            reservation_id,
            user_id: user_id.clone(),
            amount: fee,
        })
    }

    /// Marks the reservation as confirmed. Bookkeeping only — the debit
    /// already happened at reserve time.
    pub async fn commit_entry_fee(&self, reservation: &Reservation) -> Result<(), EconomyError> {
        tracing::debug!(
            user_id = %reservation.user_id,
            reservation_id = %reservation.reservation_id,
            "entry fee committed"
        );
        Ok(())
    }

    /// Credits the fee back under `refund:<reservationId>`. A repeated
    /// refund is absorbed by the idempotency key.
    pub async fn refund_entry_fee(&self, reservation: &Reservation) -> Result<(), EconomyError> {
        let key = format!("refund:{}", reservation.reservation_id);
        match self
            .wallet
            .apply_transaction(
                &reservation.user_id,
                reservation.amount,
                "entry_fee_refund",
                "entry fee refund",
                &reservation.reservation_id,
                &key,
                self.initial_coins,
            )
            .await
        {
            Ok(_) => Ok(()),
            // Already refunded by a previous attempt.
            Err(EconomyError::DuplicateTransaction(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Distributes a finished game's pot.
    ///
    /// A fixed rake comes off the top, then:
    /// - winner-take-all when `winner` is set and there is no ranking;
    /// - the ranked payout table over `ranking` otherwise;
    /// - an equal refund of the full pot (no rake) when nobody won.
    ///
    /// Each award is keyed `win:<roomId>:<userId>`; an award that was
    /// already applied by an earlier attempt is skipped.
    pub async fn process_game_payouts(
        &self,
        room_id: &RoomId,
        game_type: &str,
        total_pot: i64,
        seats: &BTreeMap<UserId, u8>,
        winner: Option<&UserId>,
        ranking: Option<&[UserId]>,
    ) -> Result<(), EconomyError> {
        if total_pot <= 0 || seats.is_empty() {
            return Ok(());
        }

        let awards: Vec<(UserId, i64)> = match (winner, ranking) {
            (Some(winner), None) => {
                vec![(winner.clone(), self.after_rake(total_pot))]
            }
            (_, Some(ranking)) if !ranking.is_empty() => {
                let pot = self.after_rake(total_pot);
                split_by_ranking(pot, ranking)
            }
            _ => {
                // Nobody won: give everyone their stake back, no rake.
                let share = total_pot / seats.len() as i64;
                seats.keys().map(|u| (u.clone(), share)).collect()
            }
        };

        for (user_id, amount) in awards {
            if amount <= 0 {
                continue;
            }
            let key = format!("win:{room_id}:{user_id}");
            match self
                .wallet
                .apply_transaction(
                    &user_id,
                    amount,
                    "game_payout",
                    &format!("{game_type} payout"),
                    &format!("room:{room_id}"),
                    &key,
                    self.initial_coins,
                )
                .await
            {
                Ok(_) => {
                    tracing::info!(%room_id, %user_id, amount, "payout applied");
                }
                Err(EconomyError::DuplicateTransaction(_)) => {
                    tracing::debug!(%room_id, %user_id, "payout already applied, skipping");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn after_rake(&self, pot: i64) -> i64 {
        pot - pot * self.rake_percent / 100
    }
}

/// Splits a pot across a ranking.
///
/// Fixed tables cover 2–4 ranked players; larger fields use a harmonic
/// series normalized to 1 across the top half. Rounding remainders go to
/// first place.
fn split_by_ranking(pot: i64, ranking: &[UserId]) -> Vec<(UserId, i64)> {
    let shares: Vec<f64> = match ranking.len() {
        1 => vec![1.0],
        2 => vec![0.7, 0.3],
        3 => vec![0.5, 0.3, 0.2],
        4 => vec![0.4, 0.3, 0.2, 0.1],
        n => {
            let paid = n.div_ceil(2);
            let total: f64 = (1..=paid).map(|i| 1.0 / i as f64).sum();
            (1..=paid).map(|i| (1.0 / i as f64) / total).collect()
        }
    };

    let mut awards: Vec<(UserId, i64)> = ranking
        .iter()
        .zip(&shares)
        .map(|(user, share)| (user.clone(), (pot as f64 * share).floor() as i64))
        .collect();

    let distributed: i64 = awards.iter().map(|(_, a)| a).sum();
    if let Some(first) = awards.first_mut() {
        first.1 += pot - distributed;
    }
    awards
}
