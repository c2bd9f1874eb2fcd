//! Full-stack tests: a tungstenite client against a running server.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parlor::prelude::*;
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsClient = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

// A one-action game, enough to drive the wire protocol end to end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PingState {
    pings: u32,
}

impl GameState for PingState {
    const VERSION: u8 = 1;
    const ENCODED_SIZE: usize = 4;
}

struct PingEngine {
    store: Arc<RoomStore>,
}

#[async_trait]
impl GameEngine for PingEngine {
    fn game_type(&self) -> &str {
        "ping"
    }

    async fn execute(
        &self,
        room_id: &RoomId,
        command: Command,
    ) -> Result<ActionResult, RoomError> {
        let Some((mut state, meta)) = self.store.load::<PingState>("ping", room_id).await?
        else {
            return Err(RoomError::NotFound(room_id.clone()));
        };
        match command.action.as_str() {
            "ping" => {
                state.pings += 1;
                self.store.save("ping", room_id, &state, &meta, 0).await?;
                Ok(ActionResult::ok(serde_json::json!({ "pings": state.pings })))
            }
            other => Ok(ActionResult::error(format!("unknown action: {other}"))),
        }
    }

    async fn legal_actions(
        &self,
        _room_id: &RoomId,
        _user_id: &UserId,
    ) -> Result<Vec<String>, RoomError> {
        Ok(vec!["ping".into()])
    }

    async fn state(&self, room_id: &RoomId) -> Result<Option<StateResponse>, RoomError> {
        let Some((state, meta)) = self.store.load::<PingState>("ping", room_id).await?
        else {
            return Ok(None);
        };
        Ok(Some(StateResponse {
            room_id: room_id.clone(),
            game_type: "ping".into(),
            state: serde_json::json!({ "pings": state.pings }),
            legal_moves: vec!["ping".into()],
            meta,
        }))
    }

    async fn metas(
        &self,
        room_ids: &[RoomId],
    ) -> Result<Vec<(RoomId, RoomMeta)>, RoomError> {
        Ok(self.store.load_meta_many("ping", room_ids).await?)
    }
}

struct TokenAuth;

impl Authenticator for TokenAuth {
    async fn authenticate(&self, token: &str) -> Result<AuthedUser, SessionError> {
        if token.starts_with("user-") {
            Ok(AuthedUser {
                user_id: UserId::new(token),
                display_name: token.to_string(),
            })
        } else {
            Err(SessionError::AuthFailed("unknown token".into()))
        }
    }
}

async fn start_server() -> String {
    let mut config = ServerConfig::default().with_template(
        "Ping",
        RoomTemplate {
            game_type: "ping".into(),
            max_seats: 2,
            entry_fee: 0,
            visibility: Visibility::Public,
            config: Default::default(),
        },
    );
    config.bind_addr = "127.0.0.1:0".into();

    let server = ParlorServer::<TokenAuth>::builder()
        .config(config)
        .module(|ctx: &ModuleContext| {
            let service = Arc::new(StandardRoomService::new(
                "ping",
                ctx.store.clone(),
                ctx.economy.clone(),
                (|_: &RoomMeta| PingState { pings: 0 }) as fn(&RoomMeta) -> PingState,
            ));
            GameModule {
                game_type: "ping".into(),
                engine: Arc::new(PingEngine {
                    store: ctx.store.clone(),
                }),
                service,
                json_schema: None,
            }
        })
        .build(TokenAuth)
        .await
        .unwrap();

    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    format!("ws://{addr}")
}

async fn send_command(ws: &mut WsClient, seq: u64, cmd: ClientCommand) {
    let envelope = Envelope::command(seq, 0, cmd);
    ws.send(Message::Binary(
        serde_json::to_vec(&envelope).unwrap().into(),
    ))
    .await
    .unwrap();
}

async fn next_reply(ws: &mut WsClient) -> ServerReply {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("reply within 2s")
            .expect("socket open")
            .unwrap();
        let data = match msg {
            Message::Binary(data) => data.to_vec(),
            Message::Text(text) => text.as_bytes().to_vec(),
            _ => continue,
        };
        let envelope: Envelope = serde_json::from_slice(&data).unwrap();
        if let Payload::Reply(reply) = envelope.payload {
            return reply;
        }
    }
}

async fn connect_and_handshake(url: &str, token: &str) -> WsClient {
    let (mut ws, _) = connect_async(url).await.unwrap();
    send_command(
        &mut ws,
        1,
        ClientCommand::Handshake {
            version: PROTOCOL_VERSION,
            token: token.to_string(),
        },
    )
    .await;
    match next_reply(&mut ws).await {
        ServerReply::HandshakeAck { user_id, .. } => {
            assert_eq!(user_id, UserId::new(token));
        }
        other => panic!("expected HandshakeAck, got {other:?}"),
    }
    ws
}

#[tokio::test]
async fn test_handshake_and_heartbeat() {
    let url = start_server().await;
    let mut ws = connect_and_handshake(&url, "user-1").await;

    send_command(&mut ws, 2, ClientCommand::Heartbeat { client_time: 777 }).await;
    match next_reply(&mut ws).await {
        ServerReply::HeartbeatAck { client_time, .. } => assert_eq!(client_time, 777),
        other => panic!("expected HeartbeatAck, got {other:?}"),
    }
}

#[tokio::test]
async fn test_bad_token_is_rejected() {
    let url = start_server().await;
    let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
    send_command(
        &mut ws,
        1,
        ClientCommand::Handshake {
            version: PROTOCOL_VERSION,
            token: "intruder".into(),
        },
    )
    .await;
    match next_reply(&mut ws).await {
        ServerReply::Error { code, .. } => assert_eq!(code, 401),
        other => panic!("expected 401, got {other:?}"),
    }
}

#[tokio::test]
async fn test_wrong_protocol_version_is_rejected() {
    let url = start_server().await;
    let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
    send_command(
        &mut ws,
        1,
        ClientCommand::Handshake {
            version: 999,
            token: "user-1".into(),
        },
    )
    .await;
    match next_reply(&mut ws).await {
        ServerReply::Error { code, message } => {
            assert_eq!(code, 400);
            assert!(message.contains("version"));
        }
        other => panic!("expected 400, got {other:?}"),
    }
}

#[tokio::test]
async fn test_create_join_act_over_the_wire() {
    let url = start_server().await;
    let mut host = connect_and_handshake(&url, "user-a").await;
    let mut guest = connect_and_handshake(&url, "user-b").await;

    send_command(
        &mut host,
        2,
        ClientCommand::CreateRoom {
            template: "Ping".into(),
        },
    )
    .await;
    let room_id = match next_reply(&mut host).await {
        ServerReply::RoomCreated {
            success: true,
            room_id: Some(id),
            ..
        } => id,
        other => panic!("create failed: {other:?}"),
    };

    send_command(
        &mut guest,
        2,
        ClientCommand::JoinRoom {
            room: room_id.clone(),
        },
    )
    .await;
    match next_reply(&mut guest).await {
        ServerReply::RoomJoined {
            success: true,
            seat_index: Some(1),
            ..
        } => {}
        other => panic!("join failed: {other:?}"),
    }

    send_command(
        &mut host,
        3,
        ClientCommand::PerformAction {
            room_id: room_id.clone(),
            action: "ping".into(),
            payload: serde_json::json!({}),
            command_id: Some("c1".into()),
        },
    )
    .await;

    // The host sees the ack; the guest sees the state broadcast.
    loop {
        match next_reply(&mut host).await {
            ServerReply::ActionAck {
                success: true,
                command_id: Some(id),
                ..
            } => {
                assert_eq!(id, "c1");
                break;
            }
            ServerReply::Room { .. } => continue,
            other => panic!("expected ack, got {other:?}"),
        }
    }
    loop {
        match next_reply(&mut guest).await {
            ServerReply::Room {
                message: RoomMessage::GameState { state },
                ..
            } => {
                assert_eq!(state["pings"], 1);
                break;
            }
            ServerReply::Room { .. } => continue,
            other => panic!("expected room frame, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_get_state_over_the_wire() {
    let url = start_server().await;
    let mut ws = connect_and_handshake(&url, "user-a").await;

    send_command(
        &mut ws,
        2,
        ClientCommand::CreateRoom {
            template: "Ping".into(),
        },
    )
    .await;
    let room_id = match next_reply(&mut ws).await {
        ServerReply::RoomCreated {
            room_id: Some(id), ..
        } => id,
        other => panic!("create failed: {other:?}"),
    };

    send_command(&mut ws, 3, ClientCommand::GetState { room_id }).await;
    loop {
        match next_reply(&mut ws).await {
            ServerReply::State { response: Some(v) } => {
                assert_eq!(v["game_type"], "ping");
                assert_eq!(v["state"]["pings"], 0);
                break;
            }
            ServerReply::Room { .. } => continue,
            other => panic!("expected state, got {other:?}"),
        }
    }
}
