//! Connection tracking over the shared registry.
//!
//! State lives in the KV registry, not in process memory, so a user who
//! reconnects through a different node still resumes their room, and a
//! node crash never strands presence data past its TTL.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parlor_protocol::{ConnectionId, RoomId, RoomMessage, UserId};
use parlor_room::Broadcaster;
use parlor_store::RoomRegistry;

use crate::SessionError;

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// What `connect` learned about the arriving user.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectOutcome {
    /// The room a disconnect ticket pointed at, if the user reconnected
    /// inside their grace window. The caller should resume them into it.
    pub resumed_room: Option<RoomId>,
}

pub struct SessionTracker {
    registry: Arc<RoomRegistry>,
    broadcaster: Arc<Broadcaster>,
    grace: Duration,
}

impl SessionTracker {
    pub fn new(registry: Arc<RoomRegistry>, broadcaster: Arc<Broadcaster>, grace: Duration) -> Self {
        Self {
            registry,
            broadcaster,
            grace,
        }
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Registers a fresh connection, marks the user online, and reclaims
    /// any pending disconnect ticket.
    pub async fn connect(
        &self,
        user_id: &UserId,
        user_name: &str,
        connection_id: ConnectionId,
    ) -> Result<ConnectOutcome, SessionError> {
        let now = unix_now();
        self.registry
            .register_connection(user_id, connection_id, now)
            .await?;

        let resumed_room = self.registry.take_disconnect_ticket(user_id).await?;
        if let Some(room_id) = &resumed_room {
            tracing::info!(%user_id, %room_id, "player reconnected within grace");
            self.broadcaster.publish(
                room_id,
                RoomMessage::PlayerReconnected {
                    user_id: user_id.clone(),
                    user_name: user_name.to_string(),
                },
            );
        } else {
            tracing::info!(%user_id, %connection_id, "session connected");
        }

        Ok(ConnectOutcome { resumed_room })
    }

    /// Refreshes a connection's heartbeat.
    pub async fn heartbeat(
        &self,
        user_id: &UserId,
        connection_id: ConnectionId,
    ) -> Result<(), SessionError> {
        self.registry
            .heartbeat(user_id, connection_id, unix_now())
            .await?;
        Ok(())
    }

    /// Handles a transport close. When the user's last connection goes
    /// while they are seated in a room, writes a grace ticket and tells
    /// the room.
    pub async fn disconnect(
        &self,
        user_id: &UserId,
        user_name: &str,
        connection_id: ConnectionId,
    ) -> Result<(), SessionError> {
        let now = unix_now();
        let remaining = self
            .registry
            .remove_connection(user_id, connection_id, now)
            .await?;
        if remaining > 0 {
            return Ok(());
        }

        let Some(room_id) = self.registry.user_room(user_id).await? else {
            tracing::debug!(%user_id, "last connection closed, not in a room");
            return Ok(());
        };

        let expires_at = now + self.grace.as_secs() as i64;
        self.registry
            .add_disconnect_ticket(user_id, &room_id, expires_at, self.grace)
            .await?;
        tracing::info!(
            %user_id,
            %room_id,
            grace_secs = self.grace.as_secs(),
            "player disconnected, grace period started"
        );
        self.broadcaster.publish(
            &room_id,
            RoomMessage::PlayerDisconnected {
                user_id: user_id.clone(),
                user_name: user_name.to_string(),
                grace_period_seconds: self.grace.as_secs(),
            },
        );
        Ok(())
    }

    pub async fn is_online(&self, user_id: &UserId) -> Result<bool, SessionError> {
        Ok(self.registry.is_online(user_id, unix_now()).await?)
    }
}
