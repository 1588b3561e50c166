use axum::{
    Json, Router,
    extract::{
        WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use tracing::*;

use crate::web::AppState;

#[instrument(level = "trace")]
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(log_websocket_handler))
        .route("/history", get(log_history))
}

async fn log_history() -> Json<Vec<String>> {
    let (_, history) = crate::logger::HISTORY
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .subscribe();
    Json(history)
}

async fn log_websocket_handler(ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(log_websocket_connection)
}

#[instrument(level = "debug", skip_all)]
async fn log_websocket_connection(socket: WebSocket) {
    let (mut websocket_sender, mut _websocket_receiver) = socket.split();
    let (mut receiver, history) = crate::logger::HISTORY
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .subscribe();

    for message in history {
        if websocket_sender
            .send(Message::Text(message.into()))
            .await
            .is_err()
        {
            return;
        }
    }

    while let Ok(message) = receiver.recv().await {
        if websocket_sender
            .send(Message::Text(message.into()))
            .await
            .is_err()
        {
            break;
        }
    }
}
