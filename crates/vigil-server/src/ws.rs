//! Alert WebSocket Endpoint
//!
//! `GET /ws/alerts/{user_id}?token=...` upgrades and binds the socket to the
//! user's alert channel. The token must identify the path user; a mismatch
//! closes the fresh socket with 4401 so browser clients can observe the
//! reason. The read half only feeds the heartbeat and logs acks; everything
//! outbound goes through the hub's writer.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::auth;
use crate::hub::{WsMessage, CLOSE_UNAUTHENTICATED};
use crate::routes::AppState;

#[derive(Debug, Deserialize)]
pub struct AlertSocketQuery {
    pub token: Option<String>,
}

pub async fn alerts_ws(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Query(query): Query<AlertSocketQuery>,
    upgrade: WebSocketUpgrade,
) -> Response {
    let authorized = query
        .token
        .as_deref()
        .and_then(|token| auth::verify_token(&state.config.jwt_secret, token).ok())
        .is_some_and(|ctx| ctx.user_id == user_id);

    upgrade.on_upgrade(move |socket| async move {
        if !authorized {
            reject_unauthenticated(socket).await;
            return;
        }
        serve_alert_socket(state, user_id, socket).await;
    })
}

async fn reject_unauthenticated(mut socket: WebSocket) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: CLOSE_UNAUTHENTICATED,
            reason: "unauthenticated".into(),
        })))
        .await;
}

async fn serve_alert_socket(state: AppState, user_id: Uuid, socket: WebSocket) {
    let (ws_tx, mut ws_rx) = socket.split();
    let channel_id = state.hub.attach(user_id, ws_tx);

    while let Some(frame) = ws_rx.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                debug!(user = %user_id, error = %e, "alert socket read failed");
                break;
            }
        };

        // any client traffic refreshes the heartbeat
        state.hub.touch(user_id);

        match frame {
            Message::Text(text) => match serde_json::from_str::<WsMessage>(text.as_str()) {
                Ok(WsMessage::Ack { stream_id }) => {
                    info!(user = %user_id, stream = %stream_id, "alert acknowledged");
                }
                Ok(WsMessage::Pong { .. }) | Ok(WsMessage::Ping { .. }) => {}
                Ok(_) => {}
                Err(_) => {
                    debug!(user = %user_id, "unparseable client frame ignored");
                }
            },
            Message::Close(_) => break,
            // axum answers protocol-level pings itself
            _ => {}
        }
    }

    state.hub.detach(user_id, channel_id);
}
