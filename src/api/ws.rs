// =============================================================================
// WebSocket Handler — push-based instance event stream (component L)
// =============================================================================
//
// Clients connect to `/api/v1/instances/:instance_id/ws?token=<token>` and
// receive every `PushEvent` published to that instance's push bus — object
// state changes and series deltas — as newline-delimited JSON frames, as
// soon as they happen. No polling: the connection handler is a `select!`
// between the push subscriber and the client's own frames, mirroring the
// teacher's ping/pong/close handling.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::api::auth::validate_token;
use crate::api::rest::AppState;

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let token = query.token.unwrap_or_default();
    if !validate_token(&token) {
        warn!(instance_id = %instance_id, "WebSocket connection rejected: invalid token");
        return (axum::http::StatusCode::FORBIDDEN, "Invalid or missing token").into_response();
    }

    let push_bus = match state.controller.push_bus_of(&instance_id) {
        Ok(bus) => bus,
        Err(_) => return (axum::http::StatusCode::NOT_FOUND, "Instance not found").into_response(),
    };

    info!(instance_id = %instance_id, "WebSocket connection accepted — upgrading");
    ws.on_upgrade(move |socket| handle_ws_connection(socket, instance_id, push_bus))
        .into_response()
}

async fn handle_ws_connection(socket: WebSocket, instance_id: String, push_bus: Arc<crate::push_bus::PushBus>) {
    let (mut sender, mut receiver) = socket.split();
    let mut subscriber = push_bus.subscribe();

    loop {
        tokio::select! {
            event = subscriber.recv() => {
                match event {
                    Ok(event) => {
                        match serde_json::to_string(&event) {
                            Ok(json) => {
                                if let Err(e) = sender.send(Message::Text(json.into())).await {
                                    debug!(error = %e, "WebSocket send failed — disconnecting");
                                    break;
                                }
                            }
                            Err(e) => warn!(error = %e, "failed to serialize push event"),
                        }
                    }
                    Err(e) => {
                        warn!(instance_id = %instance_id, error = %e, "push subscriber error — disconnecting");
                        let _ = sender.send(Message::Text(serde_json::json!({
                            "error": { "code": e.code(), "message": e.to_string() }
                        }).to_string().into())).await;
                        break;
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        info!(instance_id = %instance_id, "WebSocket Close frame received — disconnecting");
                        break;
                    }
                    Some(Ok(Message::Text(_) | Message::Binary(_))) => {}
                    Some(Err(e)) => {
                        warn!(instance_id = %instance_id, error = %e, "WebSocket receive error — disconnecting");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    info!(instance_id = %instance_id, "WebSocket connection closed");
}
