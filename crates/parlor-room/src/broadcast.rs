//! Room-scoped fan-out of typed messages.
//!
//! Subscribers are per-connection unbounded channels; the connection
//! handler pumps them onto the socket. Publishing walks the room's
//! subscriber list in order, so messages originating on one node reach
//! every subscriber in the same per-room order. A dead subscriber is
//! pruned in passing and never blocks delivery to the rest.

use dashmap::DashMap;
use parlor_protocol::{ConnectionId, RoomId, RoomMessage, UserId};
use tokio::sync::mpsc;

use crate::engine::ActionResult;

/// The channel a connection handler drains onto its socket. Every frame
/// is tagged with the room it came from, so one connection can watch
/// several rooms.
pub type RoomFeed = mpsc::UnboundedSender<(RoomId, RoomMessage)>;

struct Subscriber {
    connection_id: ConnectionId,
    user_id: Option<UserId>,
    sender: RoomFeed,
}

#[derive(Default)]
pub struct Broadcaster {
    rooms: DashMap<RoomId, Vec<Subscriber>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes a connection to a room's feed. `user_id` is `None` for
    /// spectators.
    pub fn subscribe(
        &self,
        room_id: &RoomId,
        connection_id: ConnectionId,
        user_id: Option<UserId>,
        sender: RoomFeed,
    ) {
        let mut subs = self.rooms.entry(room_id.clone()).or_default();
        // Re-subscribing replaces the old channel (reconnect case).
        subs.retain(|s| s.connection_id != connection_id);
        subs.push(Subscriber {
            connection_id,
            user_id,
            sender,
        });
    }

    pub fn unsubscribe(&self, room_id: &RoomId, connection_id: ConnectionId) {
        if let Some(mut subs) = self.rooms.get_mut(room_id) {
            subs.retain(|s| s.connection_id != connection_id);
        }
        self.rooms.remove_if(room_id, |_, subs| subs.is_empty());
    }

    /// Drops a connection from every room it watches — the socket-closed
    /// path.
    pub fn unsubscribe_all(&self, connection_id: ConnectionId) {
        for mut entry in self.rooms.iter_mut() {
            entry.value_mut().retain(|s| s.connection_id != connection_id);
        }
        self.rooms.retain(|_, subs| !subs.is_empty());
    }

    /// Forgets a room entirely (deletion path).
    pub fn drop_room(&self, room_id: &RoomId) {
        self.rooms.remove(room_id);
    }

    /// Publishes one message to every subscriber of the room.
    ///
    /// Best-effort per subscriber: a closed channel is pruned, the rest
    /// still receive the message.
    pub fn publish(&self, room_id: &RoomId, message: RoomMessage) {
        let Some(mut subs) = self.rooms.get_mut(room_id) else {
            return;
        };
        subs.retain(|sub| match sub.sender.send((room_id.clone(), message.clone())) {
            Ok(()) => true,
            Err(_) => {
                tracing::debug!(
                    %room_id,
                    connection_id = %sub.connection_id,
                    "dropping dead subscriber"
                );
                false
            }
        });
    }

    /// Delivers a message to one user's subscriptions in the room only
    /// (the `ActionError` path: failures never broadcast).
    pub fn publish_to_user(&self, room_id: &RoomId, user_id: &UserId, message: RoomMessage) {
        let Some(subs) = self.rooms.get(room_id) else {
            return;
        };
        for sub in subs.iter() {
            if sub.user_id.as_ref() == Some(user_id) {
                let _ = sub.sender.send((room_id.clone(), message.clone()));
            }
        }
    }

    /// Broadcasts a successful [`ActionResult`]: every event first, then
    /// the state snapshot if one is present.
    pub fn publish_result(&self, room_id: &RoomId, result: &ActionResult, now: i64) {
        for event in &result.events {
            self.publish(
                room_id,
                RoomMessage::GameEvent {
                    name: event.name.clone(),
                    data: event.data.clone(),
                    timestamp: now,
                },
            );
        }
        if let Some(state) = &result.new_state {
            self.publish(room_id, RoomMessage::GameState { state: state.clone() });
        }
    }

    pub fn subscriber_count(&self, room_id: &RoomId) -> usize {
        self.rooms.get(room_id).map(|s| s.len()).unwrap_or(0)
    }
}
