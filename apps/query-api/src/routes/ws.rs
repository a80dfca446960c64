use crate::hub::Subscriber;
use crate::state::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

const SEND_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
pub(crate) struct WsQuery {
    api_key: Option<String>,
}

/// Subprotocol: clients send `{"subscribe": [topics]}` /
/// `{"unsubscribe": [topics]}`, the server emits `{topic, payload}`.
#[derive(Debug, Deserialize)]
struct ClientCommand {
    #[serde(default)]
    subscribe: Vec<String>,
    #[serde(default)]
    unsubscribe: Vec<String>,
}

/// Browsers cannot set headers on WebSocket dials, so the key is accepted
/// from the query string as well.
pub(crate) async fn ws_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let raw_key = headers
        .get(crate::auth::API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or(query.api_key);

    let Some(raw_key) = raw_key else {
        return crate::error::ApiError::unauthorized("Missing or invalid API key").into_response();
    };
    match state.keys.resolve(&raw_key).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            return crate::error::ApiError::unauthorized("Missing or invalid API key")
                .into_response();
        }
        Err(err) => return crate::error::map_db_error(err).into_response(),
    }

    ws.on_upgrade(move |socket| client_session(state, socket))
}

async fn client_session(state: AppState, socket: WebSocket) {
    let subscriber = state.hub.register();
    tracing::debug!(subscriber_id = subscriber.id(), "websocket subscriber connected");

    let (mut sender, mut receiver) = socket.split();
    loop {
        tokio::select! {
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => handle_command(&subscriber, text.as_str()),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        tracing::debug!(error = %err, "websocket receive error");
                        break;
                    }
                }
            }
            event = subscriber.next() => {
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(err) => {
                        tracing::warn!(error = %err, "event serialization failed");
                        continue;
                    }
                };
                let send = sender.send(Message::Text(text.into()));
                match tokio::time::timeout(SEND_TIMEOUT, send).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) | Err(_) => break,
                }
            }
        }
    }

    state.hub.remove(subscriber.id());
    tracing::debug!(subscriber_id = subscriber.id(), "websocket subscriber disconnected");
}

fn handle_command(subscriber: &Arc<Subscriber>, text: &str) {
    match serde_json::from_str::<ClientCommand>(text) {
        Ok(command) => {
            if !command.subscribe.is_empty() {
                subscriber.subscribe(&command.subscribe);
            }
            if !command.unsubscribe.is_empty() {
                subscriber.unsubscribe(&command.unsubscribe);
            }
        }
        Err(err) => {
            tracing::debug!(error = %err, "ignoring malformed websocket command");
        }
    }
}
