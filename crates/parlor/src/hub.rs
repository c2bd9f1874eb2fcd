//! The realtime hub: the authenticated command surface.
//!
//! Every method (i) validates its inputs, (ii) spends a rate-limit
//! permit, (iii) consults the registry, and only then mutates anything —
//! writes flow through the dispatcher's per-room timeline inside the
//! [`CommandExecutor`]. Failures surface as a reply to the caller plus an
//! `ActionError` frame on their own feed; they are never broadcast.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parlor_protocol::{
    validate, ActionError, ConnectionId, RoomId, RoomMessage, RoomMeta, ServerReply, UserId,
};
use parlor_room::{CommandExecutor, ModuleRegistry, RoomError, RoomFeed};
use parlor_session::SessionTracker;
use parlor_store::{RoomRegistry, SHORT_CODE_ALPHABET, SHORT_CODE_LEN};

use crate::RoomTemplate;

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// One authenticated connection as the hub sees it.
#[derive(Clone)]
pub struct HubConnection {
    pub user_id: UserId,
    pub user_name: String,
    pub connection_id: ConnectionId,
    /// The feed the connection handler drains onto the socket.
    pub feed: RoomFeed,
}

pub struct Hub {
    registry: Arc<RoomRegistry>,
    modules: Arc<ModuleRegistry>,
    executor: Arc<CommandExecutor>,
    sessions: Arc<SessionTracker>,
    templates: HashMap<String, RoomTemplate>,
    permit_limit: i64,
    rate_window: Duration,
}

impl Hub {
    pub fn new(
        registry: Arc<RoomRegistry>,
        executor: Arc<CommandExecutor>,
        sessions: Arc<SessionTracker>,
        templates: HashMap<String, RoomTemplate>,
        permit_limit: i64,
        rate_window: Duration,
    ) -> Arc<Self> {
        let modules = executor.modules().clone();
        Arc::new(Self {
            registry,
            modules,
            executor,
            sessions,
            templates,
            permit_limit,
            rate_window,
        })
    }

    pub fn sessions(&self) -> &Arc<SessionTracker> {
        &self.sessions
    }

    /// Connection arrival: registers presence and, if a disconnect
    /// ticket is pending, resubscribes the connection to its room.
    pub async fn on_connect(&self, conn: &HubConnection) -> Result<(), ActionError> {
        let outcome = self
            .sessions
            .connect(&conn.user_id, &conn.user_name, conn.connection_id)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "session connect failed");
                ActionError::SystemOverloaded
            })?;

        if let Some(room_id) = outcome.resumed_room {
            self.executor.broadcaster().subscribe(
                &room_id,
                conn.connection_id,
                Some(conn.user_id.clone()),
                conn.feed.clone(),
            );
        }
        Ok(())
    }

    /// Transport close: presence bookkeeping plus feed cleanup.
    pub async fn on_disconnect(&self, conn: &HubConnection) {
        self.executor.broadcaster().unsubscribe_all(conn.connection_id);
        if let Err(e) = self
            .sessions
            .disconnect(&conn.user_id, &conn.user_name, conn.connection_id)
            .await
        {
            tracing::warn!(user_id = %conn.user_id, error = %e, "disconnect handling failed");
        }
    }

    pub async fn heartbeat(&self, conn: &HubConnection) {
        if let Err(e) = self
            .sessions
            .heartbeat(&conn.user_id, conn.connection_id)
            .await
        {
            tracing::warn!(user_id = %conn.user_id, error = %e, "heartbeat failed");
        }
    }

    // -- room lifecycle --------------------------------------------------

    pub async fn create_room(&self, conn: &HubConnection, template_name: &str) -> ServerReply {
        if !validate::valid_template_name(template_name) {
            return created_err("invalid template name");
        }
        if let Err(reply) = self.spend_permit(conn, "CreateRoom").await {
            return reply;
        }
        let Some(template) = self.templates.get(template_name) else {
            return created_err("unknown template");
        };
        let Some(module) = self.modules.get(&template.game_type) else {
            return created_err("template names an unregistered game type");
        };

        let mut meta = RoomMeta::new(&template.game_type, template.max_seats, unix_now());
        meta.entry_fee = template.entry_fee;
        meta.visibility = template.visibility;
        meta.config = template.config.clone();

        let room_id = match module.service.create_room(meta).await {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(error = %e, template_name, "room creation failed");
                return created_err("room creation failed");
            }
        };

        // Creator takes the first seat.
        match module.service.join_room(&room_id, &conn.user_id).await {
            Ok(seat) => {
                self.subscribe_and_announce(conn, &room_id, seat);
                let short_code = self
                    .registry
                    .short_code_of(&room_id)
                    .await
                    .ok()
                    .flatten();
                ServerReply::RoomCreated {
                    success: true,
                    room_id: Some(room_id.to_string()),
                    short_code,
                    error: None,
                }
            }
            Err(e) => {
                // The empty room stays; an activity sweep will collect it.
                tracing::warn!(%room_id, error = %e, "creator join failed");
                created_err(&e.to_action_error().to_string())
            }
        }
    }

    pub async fn join_room(&self, conn: &HubConnection, room_ref: &str) -> ServerReply {
        if let Err(reply) = self.spend_permit_joined(conn, "JoinRoom").await {
            return reply;
        }
        let Some(room_id) = self.resolve_room_ref(room_ref).await else {
            return joined_err("Room not found");
        };
        let Some(module) = self.module_of(&room_id).await else {
            return joined_err("Room not found");
        };

        match module.service.join_room(&room_id, &conn.user_id).await {
            Ok(seat) => {
                self.subscribe_and_announce(conn, &room_id, seat);
                ServerReply::RoomJoined {
                    success: true,
                    room_id: Some(room_id.to_string()),
                    seat_index: Some(seat),
                    error: None,
                }
            }
            Err(RoomError::Full(_)) => joined_err("Room is full"),
            Err(e) => joined_err(&e.to_action_error().to_string()),
        }
    }

    pub async fn leave_room(&self, conn: &HubConnection, room_id: &str) -> Option<ActionError> {
        let room_id = match self.checked_room(conn, "LeaveRoom", room_id).await {
            Ok(id) => id,
            Err(e) => return Some(e),
        };
        let module = self.module_of(&room_id).await?;

        match module.service.leave_room(&room_id, &conn.user_id).await {
            Ok(()) => {
                self.executor
                    .broadcaster()
                    .unsubscribe(&room_id, conn.connection_id);
                self.executor.broadcaster().publish(
                    &room_id,
                    RoomMessage::PlayerLeft {
                        user_id: conn.user_id.clone(),
                        user_name: conn.user_name.clone(),
                    },
                );
                None
            }
            Err(e) => Some(e.to_action_error()),
        }
    }

    // -- spectating ------------------------------------------------------

    pub async fn spectate(&self, conn: &HubConnection, room_id: &str) -> Option<ActionError> {
        let room_id = match self.checked_room(conn, "SpectateRoom", room_id).await {
            Ok(id) => id,
            Err(e) => return Some(e),
        };
        if self.module_of(&room_id).await.is_none() {
            return Some(ActionError::RoomNotFound);
        }
        self.executor.broadcaster().subscribe(
            &room_id,
            conn.connection_id,
            Some(conn.user_id.clone()),
            conn.feed.clone(),
        );
        tracing::debug!(user_id = %conn.user_id, %room_id, "spectating");
        None
    }

    pub async fn stop_spectating(&self, conn: &HubConnection, room_id: &str) -> Option<ActionError> {
        let Some(room_id) = RoomId::parse(room_id) else {
            return Some(ActionError::InvalidInput("bad room id".into()));
        };
        self.executor
            .broadcaster()
            .unsubscribe(&room_id, conn.connection_id);
        None
    }

    // -- gameplay --------------------------------------------------------

    /// Runs one action through the room's serialized timeline. The reply
    /// goes to the caller; on failure an `ActionError` frame lands on
    /// their feed and nothing is broadcast.
    pub async fn perform_action(
        &self,
        conn: &HubConnection,
        room_id: &str,
        action: &str,
        payload: serde_json::Value,
        command_id: Option<String>,
    ) -> ServerReply {
        let room_id = match self.checked_room(conn, "PerformAction", room_id).await {
            Ok(id) => id,
            Err(e) => return self.action_failure(conn, None, action, e, command_id),
        };
        if !valid_action_name(action) {
            return self.action_failure(
                conn,
                Some(&room_id),
                action,
                ActionError::InvalidInput("bad action name".into()),
                command_id,
            );
        }
        // Only seated players act.
        match self.registry.user_room(&conn.user_id).await {
            Ok(Some(current)) if current == room_id => {}
            Ok(_) => {
                return self.action_failure(
                    conn,
                    Some(&room_id),
                    action,
                    ActionError::NotInRoom,
                    command_id,
                )
            }
            Err(e) => {
                tracing::error!(error = %e, "registry lookup failed");
                return self.action_failure(
                    conn,
                    Some(&room_id),
                    action,
                    ActionError::SystemOverloaded,
                    command_id,
                );
            }
        }

        match self
            .executor
            .perform_action(&room_id, &conn.user_id, action, payload)
            .await
        {
            Ok(result) if result.success => ServerReply::ActionAck {
                success: true,
                error: None,
                new_state: result.new_state,
                command_id,
            },
            Ok(result) => {
                let message = result.error.unwrap_or_else(|| "action rejected".into());
                self.executor.broadcaster().publish_to_user(
                    &room_id,
                    &conn.user_id,
                    RoomMessage::ActionError {
                        action: action.to_string(),
                        message: message.clone(),
                    },
                );
                ServerReply::ActionAck {
                    success: false,
                    error: Some(message),
                    new_state: None,
                    command_id,
                }
            }
            Err(e) => {
                self.action_failure(conn, Some(&room_id), action, e.to_action_error(), command_id)
            }
        }
    }

    pub async fn legal_actions(&self, conn: &HubConnection, room_id: &str) -> ServerReply {
        let parsed = match self.checked_room(conn, "GetLegalActions", room_id).await {
            Ok(id) => id,
            Err(e) => {
                return ServerReply::Error {
                    code: 400,
                    message: e.to_string(),
                }
            }
        };
        let Some(module) = self.module_of(&parsed).await else {
            return ServerReply::Error {
                code: 404,
                message: ActionError::RoomNotFound.to_string(),
            };
        };
        match module.engine.legal_actions(&parsed, &conn.user_id).await {
            Ok(actions) => ServerReply::LegalActions {
                room_id: parsed.to_string(),
                actions,
            },
            Err(e) => ServerReply::Error {
                code: 400,
                message: e.to_action_error().to_string(),
            },
        }
    }

    pub async fn get_state(&self, conn: &HubConnection, room_id: &str) -> ServerReply {
        let parsed = match self.checked_room(conn, "GetState", room_id).await {
            Ok(id) => id,
            Err(e) => {
                return ServerReply::Error {
                    code: 400,
                    message: e.to_string(),
                }
            }
        };
        let Some(module) = self.module_of(&parsed).await else {
            return ServerReply::State { response: None };
        };
        match module.engine.state(&parsed).await {
            Ok(Some(resp)) => {
                let meta = serde_json::to_value(&resp.meta).unwrap_or_default();
                ServerReply::State {
                    response: Some(serde_json::json!({
                        "room_id": resp.room_id.to_string(),
                        "game_type": resp.game_type,
                        "meta": meta,
                        "state": resp.state,
                        "legal_moves": resp.legal_moves,
                    })),
                }
            }
            Ok(None) => ServerReply::State { response: None },
            Err(e) => ServerReply::Error {
                code: 500,
                message: e.to_action_error().to_string(),
            },
        }
    }

    pub async fn send_chat(
        &self,
        conn: &HubConnection,
        room_id: &str,
        message: &str,
    ) -> Option<ActionError> {
        let room_id = match self.checked_room(conn, "SendChatMessage", room_id).await {
            Ok(id) => id,
            Err(e) => return Some(e),
        };
        if !validate::valid_chat_message(message) {
            return Some(ActionError::InvalidInput("bad chat message".into()));
        }
        // Chat is for the seated.
        match self.registry.user_room(&conn.user_id).await {
            Ok(Some(current)) if current == room_id => {}
            _ => return Some(ActionError::NotInRoom),
        }

        self.executor.broadcaster().publish(
            &room_id,
            RoomMessage::ChatMessage {
                user_id: conn.user_id.clone(),
                user_name: conn.user_name.clone(),
                text: message.to_string(),
                timestamp: unix_now(),
            },
        );
        None
    }

    // -- internals -------------------------------------------------------

    /// Validation + rate limit for methods addressed at a parsed room id.
    async fn checked_room(
        &self,
        conn: &HubConnection,
        method: &str,
        room_id: &str,
    ) -> Result<RoomId, ActionError> {
        let Some(parsed) = RoomId::parse(room_id) else {
            return Err(ActionError::InvalidInput("bad room id".into()));
        };
        match self.spend_permit(conn, method).await {
            Err(_) => Err(ActionError::RateLimited),
            Ok(()) => Ok(parsed),
        }
    }

    async fn spend_permit(&self, conn: &HubConnection, method: &str) -> Result<(), ServerReply> {
        match self
            .registry
            .check_rate_limit(&conn.user_id, self.permit_limit, self.rate_window)
            .await
        {
            Ok(true) => Ok(()),
            Ok(false) => {
                tracing::debug!(user_id = %conn.user_id, method, "rate limited");
                Err(created_err(&ActionError::RateLimited.to_string()))
            }
            Err(e) => {
                tracing::error!(error = %e, "rate limit check failed");
                Err(created_err(&ActionError::SystemOverloaded.to_string()))
            }
        }
    }

    async fn spend_permit_joined(
        &self,
        conn: &HubConnection,
        method: &str,
    ) -> Result<(), ServerReply> {
        self.spend_permit(conn, method).await.map_err(|reply| {
            // Same permit spend, join-shaped reply.
            match reply {
                ServerReply::RoomCreated { error, .. } => ServerReply::RoomJoined {
                    success: false,
                    room_id: None,
                    seat_index: None,
                    error,
                },
                other => other,
            }
        })
    }

    /// `room_ref` is either a 5-character short code or a hex room id.
    async fn resolve_room_ref(&self, room_ref: &str) -> Option<RoomId> {
        let upper = room_ref.to_ascii_uppercase();
        if upper.len() == SHORT_CODE_LEN
            && upper.bytes().all(|b| SHORT_CODE_ALPHABET.contains(&b))
        {
            if let Ok(Some(room)) = self.registry.room_by_short_code(&upper).await {
                return Some(room);
            }
        }
        RoomId::parse(room_ref)
    }

    async fn module_of(&self, room_id: &RoomId) -> Option<parlor_room::GameModule> {
        let game_type = self.registry.game_type_of(room_id).await.ok()??;
        self.modules.get(&game_type).cloned()
    }

    fn subscribe_and_announce(&self, conn: &HubConnection, room_id: &RoomId, seat: u8) {
        self.executor.broadcaster().subscribe(
            room_id,
            conn.connection_id,
            Some(conn.user_id.clone()),
            conn.feed.clone(),
        );
        self.executor.broadcaster().publish(
            room_id,
            RoomMessage::PlayerJoined {
                user_id: conn.user_id.clone(),
                user_name: conn.user_name.clone(),
                seat_index: seat,
            },
        );
    }

    fn action_failure(
        &self,
        conn: &HubConnection,
        room_id: Option<&RoomId>,
        action: &str,
        error: ActionError,
        command_id: Option<String>,
    ) -> ServerReply {
        if let Some(room_id) = room_id {
            self.executor.broadcaster().publish_to_user(
                room_id,
                &conn.user_id,
                RoomMessage::ActionError {
                    action: action.to_string(),
                    message: error.to_string(),
                },
            );
        }
        ServerReply::ActionAck {
            success: false,
            error: Some(error.to_string()),
            new_state: None,
            command_id,
        }
    }
}

fn valid_action_name(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 50
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn created_err(message: &str) -> ServerReply {
    ServerReply::RoomCreated {
        success: false,
        room_id: None,
        short_code: None,
        error: Some(message.to_string()),
    }
}

fn joined_err(message: &str) -> ServerReply {
    ServerReply::RoomJoined {
        success: false,
        room_id: None,
        seat_index: None,
        error: Some(message.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_action_name() {
        assert!(valid_action_name("roll"));
        assert!(valid_action_name("move_token"));
        assert!(!valid_action_name(""));
        assert!(!valid_action_name("bad action"));
        assert!(!valid_action_name(&"x".repeat(51)));
    }
}
