//! Per-connection handler: handshake, auth, and command routing.
//!
//! Each accepted connection gets its own task. The flow is:
//!   1. receive `Handshake` → validate version → authenticate token
//!   2. register the session, send `HandshakeAck`
//!   3. spawn the outbound pump (room feed → socket)
//!   4. loop: decode envelopes → hub methods → replies

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parlor_protocol::{
    ClientCommand, Envelope, Payload, ProtocolError, RoomId, RoomMessage, ServerReply,
    PROTOCOL_VERSION,
};
use parlor_session::Authenticator;
use parlor_transport::{Connection, WebSocketConnection};
use tokio::sync::mpsc;

use crate::{Hub, HubConnection, ParlorError};

/// Idle connections are dropped after this long without a frame; the
/// heartbeat cadence keeps live clients well inside it.
const READ_TIMEOUT: Duration = Duration::from_secs(120);

/// Handshakes must complete quickly or the socket is not worth keeping.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Drop guard: session and feed cleanup fire even if the handler errors.
struct ConnectionGuard {
    hub: Arc<Hub>,
    conn: HubConnection,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let hub = Arc::clone(&self.hub);
        let conn = self.conn.clone();
        tokio::spawn(async move {
            hub.on_disconnect(&conn).await;
        });
    }
}

pub(crate) async fn handle_connection<A: Authenticator>(
    socket: WebSocketConnection,
    hub: Arc<Hub>,
    auth: Arc<A>,
) -> Result<(), ParlorError> {
    let connection_id = socket.id();
    tracing::debug!(%connection_id, "handling new connection");

    let (feed_tx, mut feed_rx) = mpsc::unbounded_channel::<(RoomId, RoomMessage)>();
    let mut seq: u64 = 1;

    // --- Handshake ---
    let authed = perform_handshake(&socket, &auth, &mut seq).await?;
    let conn = HubConnection {
        user_id: authed.user_id.clone(),
        user_name: authed.display_name.clone(),
        connection_id,
        feed: feed_tx,
    };
    tracing::info!(%connection_id, user_id = %conn.user_id, "player authenticated");

    if let Err(e) = hub.on_connect(&conn).await {
        send_reply(
            &socket,
            &mut seq,
            ServerReply::Error {
                code: 500,
                message: e.to_string(),
            },
        )
        .await?;
        return Ok(());
    }
    let _guard = ConnectionGuard {
        hub: Arc::clone(&hub),
        conn: conn.clone(),
    };

    send_reply(
        &socket,
        &mut seq,
        ServerReply::HandshakeAck {
            user_id: conn.user_id.clone(),
            server_time: unix_millis(),
        },
    )
    .await?;

    // --- Outbound pump: room feed → socket ---
    let pump_socket = socket.clone();
    let pump = tokio::spawn(async move {
        let mut pump_seq: u64 = 1_000_000_000;
        while let Some((room_id, message)) = feed_rx.recv().await {
            let envelope = Envelope::reply(
                pump_seq,
                unix_millis(),
                ServerReply::Room {
                    room_id: room_id.to_string(),
                    message,
                },
            );
            pump_seq += 1;
            let Ok(bytes) = serde_json::to_vec(&envelope) else {
                continue;
            };
            if pump_socket.send(&bytes).await.is_err() {
                break;
            }
        }
    });

    // --- Inbound loop ---
    let result = command_loop(&socket, &hub, &conn, &mut seq).await;
    pump.abort();
    result
}

async fn command_loop(
    socket: &WebSocketConnection,
    hub: &Arc<Hub>,
    conn: &HubConnection,
    seq: &mut u64,
) -> Result<(), ParlorError> {
    loop {
        let frame = match tokio::time::timeout(READ_TIMEOUT, socket.recv()).await {
            Ok(Ok(Some(frame))) => frame,
            Ok(Ok(None)) => {
                tracing::info!(user_id = %conn.user_id, "connection closed cleanly");
                return Ok(());
            }
            Ok(Err(e)) => {
                tracing::debug!(user_id = %conn.user_id, error = %e, "recv error");
                return Ok(());
            }
            Err(_) => {
                tracing::info!(user_id = %conn.user_id, "connection timed out");
                return Ok(());
            }
        };

        let envelope: Envelope = match serde_json::from_slice(&frame) {
            Ok(env) => env,
            Err(e) => {
                tracing::debug!(user_id = %conn.user_id, error = %e, "bad envelope");
                continue;
            }
        };
        let Payload::Command(command) = envelope.payload else {
            tracing::debug!(user_id = %conn.user_id, "ignoring non-command payload");
            continue;
        };

        match command {
            ClientCommand::Handshake { .. } => {
                // Already handshaken; ignore.
            }
            ClientCommand::Heartbeat { client_time } => {
                hub.heartbeat(conn).await;
                send_reply(
                    socket,
                    seq,
                    ServerReply::HeartbeatAck {
                        client_time,
                        server_time: unix_millis(),
                    },
                )
                .await?;
            }
            ClientCommand::CreateRoom { template } => {
                let reply = hub.create_room(conn, &template).await;
                send_reply(socket, seq, reply).await?;
            }
            ClientCommand::JoinRoom { room } => {
                let reply = hub.join_room(conn, &room).await;
                send_reply(socket, seq, reply).await?;
            }
            ClientCommand::LeaveRoom { room_id } => {
                if let Some(e) = hub.leave_room(conn, &room_id).await {
                    send_error(socket, seq, 400, &e.to_string()).await?;
                }
            }
            ClientCommand::SpectateRoom { room_id } => {
                if let Some(e) = hub.spectate(conn, &room_id).await {
                    send_error(socket, seq, 404, &e.to_string()).await?;
                }
            }
            ClientCommand::StopSpectating { room_id } => {
                if let Some(e) = hub.stop_spectating(conn, &room_id).await {
                    send_error(socket, seq, 400, &e.to_string()).await?;
                }
            }
            ClientCommand::PerformAction {
                room_id,
                action,
                payload,
                command_id,
            } => {
                let reply = hub
                    .perform_action(conn, &room_id, &action, payload, command_id)
                    .await;
                send_reply(socket, seq, reply).await?;
            }
            ClientCommand::GetLegalActions { room_id } => {
                let reply = hub.legal_actions(conn, &room_id).await;
                send_reply(socket, seq, reply).await?;
            }
            ClientCommand::GetState { room_id } => {
                let reply = hub.get_state(conn, &room_id).await;
                send_reply(socket, seq, reply).await?;
            }
            ClientCommand::SendChatMessage { room_id, message } => {
                if let Some(e) = hub.send_chat(conn, &room_id, &message).await {
                    send_error(socket, seq, 400, &e.to_string()).await?;
                }
            }
            ClientCommand::Disconnect { reason } => {
                tracing::info!(user_id = %conn.user_id, %reason, "client disconnected");
                return Ok(());
            }
        }
    }
}

async fn perform_handshake<A: Authenticator>(
    socket: &WebSocketConnection,
    auth: &Arc<A>,
    seq: &mut u64,
) -> Result<parlor_session::AuthedUser, ParlorError> {
    let frame = match tokio::time::timeout(HANDSHAKE_TIMEOUT, socket.recv()).await {
        Ok(Ok(Some(frame))) => frame,
        Ok(Ok(None)) => {
            return Err(ProtocolError::InvalidMessage(
                "connection closed before handshake".into(),
            )
            .into());
        }
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => {
            return Err(ProtocolError::InvalidMessage("handshake timed out".into()).into());
        }
    };

    let envelope: Envelope =
        serde_json::from_slice(&frame).map_err(ProtocolError::Decode)?;
    let (version, token) = match envelope.payload {
        Payload::Command(ClientCommand::Handshake { version, token }) => (version, token),
        _ => {
            send_error(socket, seq, 400, "expected Handshake").await?;
            return Err(ProtocolError::InvalidMessage(
                "first message must be Handshake".into(),
            )
            .into());
        }
    };

    if version != PROTOCOL_VERSION {
        send_error(
            socket,
            seq,
            400,
            &format!("version mismatch: expected {PROTOCOL_VERSION}, got {version}"),
        )
        .await?;
        return Err(
            ProtocolError::InvalidMessage("protocol version mismatch".into()).into(),
        );
    }

    match auth.authenticate(&token).await {
        Ok(user) => Ok(user),
        Err(e) => {
            send_error(socket, seq, 401, "unauthorized").await?;
            Err(e.into())
        }
    }
}

async fn send_reply(
    socket: &WebSocketConnection,
    seq: &mut u64,
    reply: ServerReply,
) -> Result<(), ParlorError> {
    let envelope = Envelope::reply(next_seq(seq), unix_millis(), reply);
    let bytes = serde_json::to_vec(&envelope).map_err(ProtocolError::Encode)?;
    socket.send(&bytes).await?;
    Ok(())
}

async fn send_error(
    socket: &WebSocketConnection,
    seq: &mut u64,
    code: u16,
    message: &str,
) -> Result<(), ParlorError> {
    send_reply(
        socket,
        seq,
        ServerReply::Error {
            code,
            message: message.to_string(),
        },
    )
    .await
}

fn next_seq(seq: &mut u64) -> u64 {
    let current = *seq;
    *seq += 1;
    current
}
