use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures::{sink::SinkExt, stream::StreamExt};
use serde_json::json;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{debug, error, warn};

use crate::api::{ApiError, AppState};
use crate::sync::{ProgressEvent, SessionController};

pub fn routes() -> Router<AppState> {
    Router::new().route("/:id", get(websocket_handler))
}

async fn websocket_handler(
    ws: WebSocketUpgrade,
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    let session = match state.sessions.get(&id) {
        Ok(session) => session,
        Err(e) => return ApiError::from(e).into_response(),
    };
    let events = match state.sessions.subscribe(&id) {
        Ok(events) => events,
        Err(e) => return ApiError::from(e).into_response(),
    };
    ws.on_upgrade(move |socket| handle_socket(socket, session, BroadcastStream::new(events)))
}

async fn handle_socket(
    socket: WebSocket,
    session: SessionController,
    mut events: BroadcastStream<ProgressEvent>,
) {
    let (mut sender, mut receiver) = socket.split();

    // Late joiners get the current totals before the live stream.
    let msg = json!({
        "type": "status",
        "data": session.status()
    });
    if let Err(e) = sender.send(Message::Text(msg.to_string())).await {
        error!("Failed to send initial status: {}", e);
        return;
    }

    let session_id = session.id().to_string();
    let mut send_task = tokio::spawn(async move {
        while let Some(item) = events.next().await {
            let msg = match item {
                Ok(event) => json!({
                    "type": "progress",
                    "data": event
                }),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    // Percent is cumulative, so the next event catches the client up.
                    warn!("WebSocket for session {} lagged by {} events", session_id, skipped);
                    continue;
                }
            };

            if sender.send(Message::Text(msg.to_string())).await.is_err() {
                break;
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    debug!("Received WebSocket message: {}", text);
                }
                Message::Close(_) => {
                    debug!("WebSocket closed by client");
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = (&mut send_task) => {
            recv_task.abort();
        }
        _ = (&mut recv_task) => {
            send_task.abort();
        }
    }

    debug!("WebSocket connection closed");
}
