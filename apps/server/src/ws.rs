//! The `/api/ws/dlq-events` WebSocket endpoint: forwards every broadcast
//! engine event to the connected observer as a JSON text frame. Grounded on
//! `engine::broadcaster::Broadcaster`'s "subscribe, stream until lagged or
//! closed" contract — no pack example wires a websocket, so the only new
//! idiom here is the axum upgrade handler itself.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new().route("/api/ws/dlq-events", get(upgrade)).with_state(state)
}

async fn upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let mut events = state.broadcaster.subscribe();

    loop {
        match events.recv().await {
            Ok(event) => {
                let Ok(text) = serde_json::to_string(&event) else {
                    continue;
                };
                if socket.send(Message::Text(text.into())).await.is_err() {
                    return;
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "websocket observer lagged, dropping buffered events");
                continue;
            }
            Err(RecvError::Closed) => return,
        }
    }
}
