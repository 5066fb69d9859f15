//! WebSocket event feed: every collector event is pushed to the client as a JSON text frame.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::collections::HashMap;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::state::AppState;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(q): Query<HashMap<String, String>>,
) -> Response {
    if !state.authorized(q.get("token").map(String::as_str)) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    // Subscribe before anything else so no event between upgrade and loop is lost.
    let mut events = state.collector.subscribe();
    loop {
        tokio::select! {
            msg = socket.recv() => match msg {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                // pings are answered by the protocol layer; nothing else is expected
                Some(Ok(_)) => {}
            },
            ev = events.recv() => match ev {
                Ok(ev) => {
                    let Ok(js) = serde_json::to_string(&ev) else { continue };
                    if socket.send(Message::Text(js)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => warn!(missed = n, "ws client lagging behind events"),
                Err(RecvError::Closed) => break,
            },
        }
    }
    debug!("ws client disconnected");
}
