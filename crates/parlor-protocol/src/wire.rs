//! Top-level wire format between clients and the realtime hub.
//!
//! Every frame is an [`Envelope`] carrying either a [`ClientCommand`]
//! (client → server) or a [`ServerReply`] (server → client). Both enums
//! are internally tagged so the JSON reads naturally in a browser
//! devtools pane.

use serde::{Deserialize, Serialize};

use crate::{RoomMessage, UserId};

/// Current protocol version. Clients must send it in their handshake or
/// be rejected.
pub const PROTOCOL_VERSION: u32 = 1;

/// Methods a client may invoke on the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientCommand {
    /// Must be the first frame on every connection.
    Handshake { version: u32, token: String },

    /// Keep-alive; refreshes the connection's heartbeat entry.
    Heartbeat { client_time: i64 },

    /// Create a room from a named template and seat the caller at 0.
    CreateRoom { template: String },

    /// Join by room id (hex) or 5-character short code.
    JoinRoom { room: String },

    LeaveRoom { room_id: String },

    SpectateRoom { room_id: String },

    StopSpectating { room_id: String },

    PerformAction {
        room_id: String,
        action: String,
        payload: serde_json::Value,
        #[serde(default)]
        command_id: Option<String>,
    },

    GetLegalActions { room_id: String },

    GetState { room_id: String },

    SendChatMessage { room_id: String, message: String },

    Disconnect { reason: String },
}

/// Frames the hub sends back to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerReply {
    HandshakeAck {
        user_id: UserId,
        server_time: i64,
    },

    HeartbeatAck {
        client_time: i64,
        server_time: i64,
    },

    RoomCreated {
        success: bool,
        #[serde(default)]
        room_id: Option<String>,
        #[serde(default)]
        short_code: Option<String>,
        #[serde(default)]
        error: Option<String>,
    },

    RoomJoined {
        success: bool,
        #[serde(default)]
        room_id: Option<String>,
        #[serde(default)]
        seat_index: Option<u8>,
        #[serde(default)]
        error: Option<String>,
    },

    ActionAck {
        success: bool,
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        new_state: Option<serde_json::Value>,
        #[serde(default)]
        command_id: Option<String>,
    },

    LegalActions {
        room_id: String,
        actions: Vec<String>,
    },

    /// Full state response; `response` is absent when the room is gone.
    State {
        #[serde(default)]
        response: Option<serde_json::Value>,
    },

    /// A room broadcast frame (state snapshot, join/leave, chat, …).
    Room {
        room_id: String,
        message: RoomMessage,
    },

    Error { code: u16, message: String },
}

/// What an envelope carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Payload {
    Command(ClientCommand),
    Reply(ServerReply),
}

/// The top-level frame. Every message on the wire is one envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Auto-incrementing per-direction sequence number.
    pub seq: u64,

    /// Unix milliseconds on the sending side.
    pub timestamp: i64,

    pub payload: Payload,
}

impl Envelope {
    pub fn command(seq: u64, timestamp: i64, cmd: ClientCommand) -> Self {
        Self {
            seq,
            timestamp,
            payload: Payload::Command(cmd),
        }
    }

    pub fn reply(seq: u64, timestamp: i64, reply: ServerReply) -> Self {
        Self {
            seq,
            timestamp,
            payload: Payload::Reply(reply),
        }
    }
}
