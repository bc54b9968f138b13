//! Player socket: authenticate, attach to a battle, relay messages both ways

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::app::AppState;
use crate::battle::{BattleHandle, BattleInput, Envelope, PlayerInput};
use crate::http::middleware::verify_jwt;
use crate::util::rate_limit::InputGate;
use crate::util::time::unix_millis;
use crate::ws::protocol::{ClientMsg, ServerMsg};

/// `GET /ws?token=<player token>`
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: String,
}

/// Upgrade only when the token verifies
pub async fn ws_handler(
    upgrade: WebSocketUpgrade,
    Query(WsQuery { token }): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    let claims = match verify_jwt(&token, &state.config.jwt_secret) {
        Ok(claims) => claims,
        Err(e) => {
            warn!(error = %e, "Rejected socket upgrade");
            return (StatusCode::UNAUTHORIZED, e.to_string()).into_response();
        }
    };
    let user_id = claims.sub;
    upgrade.on_upgrade(move |socket| handle_socket(socket, user_id, state))
}

/// The battle a socket is currently attached to
struct Attachment {
    battle: BattleHandle,
    forwarder: JoinHandle<()>,
}

async fn handle_socket(socket: WebSocket, user_id: Uuid, state: AppState) {
    info!(user_id = %user_id, "Player connected");

    let (ws_sink, ws_stream) = socket.split();
    let (out_tx, out_rx) = mpsc::channel::<ServerMsg>(256);

    let writer = tokio::spawn(write_loop(user_id, ws_sink, out_rx));

    let greeting = ServerMsg::Welcome {
        user_id,
        server_time: state.clock.now_ms(),
    };
    if out_tx.send(greeting).await.is_err() {
        error!(user_id = %user_id, "Failed to queue welcome");
        return;
    }

    let attachment = read_loop(user_id, &state, ws_stream, &out_tx).await;

    if let Some(attachment) = attachment {
        detach(user_id, attachment, true).await;
    }
    drop(out_tx);
    let _ = writer.await;

    info!(user_id = %user_id, "Player disconnected");
}

/// Reader loop: WebSocket -> battle session
async fn read_loop(
    user_id: Uuid,
    state: &AppState,
    mut ws_stream: SplitStream<WebSocket>,
    out_tx: &mpsc::Sender<ServerMsg>,
) -> Option<Attachment> {
    let mut gate = InputGate::new();
    let mut attachment: Option<Attachment> = None;

    while let Some(frame) = ws_stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                if !gate.admit() {
                    debug!(user_id = %user_id, dropped = gate.dropped(), "Rate limited input message");
                    continue;
                }

                let client_msg = match serde_json::from_str::<ClientMsg>(&text) {
                    Ok(msg) => msg,
                    Err(e) => {
                        debug!(user_id = %user_id, error = %e, "Unparseable client message");
                        let _ = out_tx
                            .send(ServerMsg::error("bad_message", e.to_string()))
                            .await;
                        continue;
                    }
                };

                if let ClientMsg::JoinBattle { battle_id } = &client_msg {
                    let Some(battle) = state.battles.get(battle_id) else {
                        let _ = out_tx
                            .send(ServerMsg::error("unknown_battle", format!("No battle {battle_id}")))
                            .await;
                        continue;
                    };
                    if let Some(previous) = attachment.take() {
                        detach(user_id, previous, true).await;
                    }
                    let forwarder = spawn_forwarder(user_id, battle.subscribe(), out_tx.clone());
                    attachment = Some(Attachment { battle, forwarder });
                }

                let leaving = matches!(client_msg, ClientMsg::LeaveBattle);
                let Some(current) = &attachment else {
                    if let ClientMsg::Ping { t } = client_msg {
                        let _ = out_tx
                            .send(ServerMsg::Pong {
                                t,
                                server_time: state.clock.now_ms(),
                            })
                            .await;
                    } else {
                        let _ = out_tx
                            .send(ServerMsg::error("not_joined", "Join a battle first"))
                            .await;
                    }
                    continue;
                };

                let input = BattleInput::Player(PlayerInput {
                    user_id,
                    msg: client_msg,
                    received_at: unix_millis(),
                });
                if current.battle.input_tx.send(input).await.is_err() {
                    debug!(user_id = %user_id, "Battle input channel closed");
                    if let Some(gone) = attachment.take() {
                        gone.forwarder.abort();
                    }
                    continue;
                }

                if leaving {
                    if let Some(left) = attachment.take() {
                        detach(user_id, left, false).await;
                    }
                }
            }
            Ok(Message::Binary(_)) => {
                let _ = out_tx
                    .send(ServerMsg::error("bad_message", "Binary frames are not supported"))
                    .await;
            }
            // Control frames are answered by axum
            Ok(Message::Ping(_) | Message::Pong(_)) => {}
            Ok(Message::Close(frame)) => {
                debug!(user_id = %user_id, ?frame, "Close frame");
                break;
            }
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Socket read failed");
                break;
            }
        }
    }

    if gate.dropped() > 0 {
        warn!(user_id = %user_id, dropped = gate.dropped(), "Inbound messages were rate limited");
    }
    attachment
}

/// Stop forwarding battle events; optionally tell the session the player is gone
async fn detach(user_id: Uuid, attachment: Attachment, notify: bool) {
    attachment.forwarder.abort();
    if notify {
        let _ = attachment
            .battle
            .input_tx
            .send(BattleInput::Disconnected { user_id })
            .await;
    }
}

/// Battle broadcast -> this socket, keeping only messages addressed to it
fn spawn_forwarder(
    user_id: Uuid,
    mut events: broadcast::Receiver<Envelope>,
    out_tx: mpsc::Sender<ServerMsg>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(envelope) => {
                    if !envelope.is_for(user_id) {
                        continue;
                    }
                    if out_tx.send(envelope.msg).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(user_id = %user_id, skipped, "Slow socket missed battle events");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Writer task: outbound queue -> WebSocket
async fn write_loop(
    user_id: Uuid,
    mut ws_sink: SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::Receiver<ServerMsg>,
) {
    while let Some(msg) = out_rx.recv().await {
        let text = match serde_json::to_string(&msg) {
            Ok(text) => text,
            Err(e) => {
                error!(user_id = %user_id, error = %e, "Unserializable server message");
                continue;
            }
        };
        if let Err(e) = ws_sink.send(Message::Text(text)).await {
            debug!(user_id = %user_id, error = %e, "Socket write failed");
            break;
        }
    }
    let _ = ws_sink.close().await;
}
