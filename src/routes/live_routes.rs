// src/routes/live_routes.rs

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use chrono::Utc;
use futures::{sink::SinkExt, stream::StreamExt};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use crate::{middleware::auth_context::AuthContext, models::AppState};

pub fn router() -> Router<AppState> {
    Router::new().route("/live", get(live_socket))
}

pub async fn live_socket(
    State(state): State<AppState>,
    auth: AuthContext,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, auth))
}

fn hello_frame(connection_id: Uuid) -> String {
    json!({
        "type": "connected",
        "connection_id": connection_id,
        "server_time": Utc::now(),
    })
    .to_string()
}

/// Application-level keepalive. Protocol ping frames are answered by the
/// websocket layer itself.
fn is_text_ping(text: &str) -> bool {
    text.trim().eq_ignore_ascii_case("ping")
}

async fn handle_socket(socket: WebSocket, state: AppState, auth: AuthContext) {
    let connection_id = Uuid::new_v4();
    // Subscribe before the hello so nothing published in between is missed.
    let mut events = state.live.subscribe();
    let (mut sender, mut receiver) = socket.split();

    tracing::info!(
        %connection_id,
        session_id = ?auth.session_id,
        listeners = state.live.connection_count(),
        "live connection opened"
    );

    if sender
        .send(Message::Text(hello_frame(connection_id).into()))
        .await
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let text = match serde_json::to_string(&event) {
                        Ok(t) => t,
                        Err(e) => {
                            tracing::error!(%connection_id, error = %e, "could not encode live event");
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(%connection_id, skipped, "live connection lagging; events skipped");
                }
                Err(RecvError::Closed) => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) if is_text_ping(text.as_str()) => {
                    let pong = json!({ "type": "pong", "server_time": Utc::now() }).to_string();
                    if sender.send(Message::Text(pong.into())).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(%connection_id, error = %e, "live connection read error");
                    break;
                }
            },
        }
    }

    tracing::info!(%connection_id, "live connection closed");
}
