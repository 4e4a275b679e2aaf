//! Socket transport: one task per connection, multiplexing engine
//! broadcasts out and client frames in.
//!
//! The identity/auth collaborator has already authenticated the user before
//! the upgrade; every inbound event's acting identity is checked against it,
//! so a session can never act as someone else. A bad frame earns the
//! offending connection a targeted `error` event and nothing more.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::conversation::{personal_room, room_involves};
use crate::services::SendRequest;
use crate::state::AppState;
use crate::websocket::message_types::{OutboundEvent, WsInboundEvent};

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub user_id: String,
}

pub async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if params.user_id.is_empty() {
        return StatusCode::BAD_REQUEST.into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(state, params.user_id, socket))
}

async fn handle_socket(state: AppState, user_id: String, socket: WebSocket) {
    let registry = state.engine.registry().clone();
    let (conn_id, mut rx) = registry.connect().await;

    // Personal room first, then the catch-up sweep: anything arriving after
    // the join lands in rx, anything before it is swept out of the store.
    registry.join(&personal_room(&user_id), conn_id).await;
    if let Err(e) = state.engine.on_connect(&user_id).await {
        warn!(user = %user_id, error = %e, "offline catch-up failed");
    }
    debug!(user = %user_id, conn = %conn_id, "session connected");

    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            maybe = rx.recv() => {
                match maybe {
                    Some(event) => {
                        if sender.send(Message::Text(event.to_json())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = receiver.next() => {
                if !handle_client_frame(&incoming, &state, &user_id, conn_id).await {
                    break;
                }
            }
        }
    }

    registry.remove_connection(conn_id).await;
    debug!(user = %user_id, conn = %conn_id, "session disconnected");
}

/// Returns false when the connection should be torn down.
async fn handle_client_frame(
    incoming: &Option<Result<Message, axum::Error>>,
    state: &AppState,
    user_id: &str,
    conn_id: Uuid,
) -> bool {
    match incoming {
        Some(Ok(Message::Text(txt))) => {
            match serde_json::from_str::<WsInboundEvent>(txt) {
                Ok(evt) => dispatch_event(evt, state, user_id, conn_id).await,
                Err(e) => {
                    send_error(state, conn_id, format!("malformed event: {e}")).await;
                }
            }
            true
        }
        Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_))) => true,
        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => false,
    }
}

async fn dispatch_event(evt: WsInboundEvent, state: &AppState, user_id: &str, conn_id: Uuid) {
    let engine = &state.engine;
    let result = match evt {
        WsInboundEvent::Join { room } => {
            if room == user_id {
                engine.registry().join(&personal_room(user_id), conn_id).await;
                Ok(())
            } else if room_involves(&room, user_id) {
                engine.registry().join(&room, conn_id).await;
                Ok(())
            } else {
                Err(crate::error::AppError::InvalidRequest(
                    "cannot join a room you are not part of".into(),
                ))
            }
        }
        WsInboundEvent::Send {
            from,
            to,
            text,
            attachment_url,
            attachment_kind,
            client_temp_id,
        } => {
            if from != user_id {
                Err(identity_mismatch())
            } else {
                engine
                    .send(
                        Some(conn_id),
                        SendRequest {
                            from,
                            to,
                            text,
                            attachment_url,
                            attachment_kind,
                            client_temp_id,
                        },
                    )
                    .await
                    .map(|_| ())
            }
        }
        WsInboundEvent::Revoke { id } => engine.revoke(id, Some(user_id)).await,
        WsInboundEvent::BulkRevoke { ids } => engine.bulk_revoke(&ids, Some(user_id)).await,
        WsInboundEvent::DeleteForMe { id, user_id: who } => {
            if who != user_id {
                Err(identity_mismatch())
            } else {
                engine.delete_for_user(id, &who).await
            }
        }
        WsInboundEvent::BulkDeleteForMe { ids, user_id: who } => {
            if who != user_id {
                Err(identity_mismatch())
            } else {
                engine.bulk_delete_for_user(&ids, &who).await
            }
        }
        WsInboundEvent::MarkRead { sender, receiver } => {
            if receiver != user_id {
                Err(identity_mismatch())
            } else {
                engine.mark_read(&sender, &receiver).await
            }
        }
        WsInboundEvent::MarkDelivered {
            msg_id,
            sender,
            receiver,
        } => {
            if receiver != user_id {
                Err(identity_mismatch())
            } else {
                engine.mark_delivered(msg_id, &sender, &receiver).await
            }
        }
        WsInboundEvent::Typing { from, to, typing } => {
            if from != user_id {
                Err(identity_mismatch())
            } else {
                engine.typing(Some(conn_id), &from, &to, typing).await;
                Ok(())
            }
        }
    };

    if let Err(e) = result {
        send_error(state, conn_id, e.to_string()).await;
    }
}

fn identity_mismatch() -> crate::error::AppError {
    crate::error::AppError::InvalidRequest(
        "event identity does not match the authenticated session".into(),
    )
}

async fn send_error(state: &AppState, conn_id: Uuid, message: String) {
    state
        .engine
        .registry()
        .send_to_conn(conn_id, OutboundEvent::Error { message })
        .await;
}
