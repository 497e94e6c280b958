/// Client-facing WebSocket endpoint. Clients connect with a token and a
/// user id, subscribe by topic and user-broker filter, bootstrap via
/// replay(after_seq), and dedupe redeliveries by seq.
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::events::EventBus;
use crate::hub::broadcast::{BroadcastHub, ClientFrame, ServerFrame};

const REPLAY_PAGE: usize = 1000;

#[derive(Clone)]
pub struct WsState {
    pub hub: Arc<BroadcastHub>,
    pub bus: Arc<EventBus>,
    pub auth_token: String,
}

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
    user_id: Option<String>,
}

pub fn router(state: WsState) -> Router {
    Router::new().route("/ws", get(ws_handler)).with_state(state)
}

/// Bind and serve the hub endpoint
pub async fn serve(state: WsState, bind_addr: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .map_err(|e| EngineError::Config(format!("hub bind {} failed: {}", bind_addr, e)))?;
    info!("Hub listening on {}", bind_addr);
    axum::serve(listener, router(state))
        .await
        .map_err(|e| EngineError::Internal(format!("hub server: {}", e)))?;
    Ok(())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<WsState>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let token = query.token.unwrap_or_default();
    if token != state.auth_token {
        warn!("WebSocket connection rejected: invalid token");
        return (axum::http::StatusCode::FORBIDDEN, "Invalid or missing token").into_response();
    }
    let user_id = match query.user_id {
        Some(user_id) if !user_id.is_empty() => user_id,
        _ => {
            return (axum::http::StatusCode::BAD_REQUEST, "user_id required").into_response();
        }
    };
    ws.on_upgrade(move |socket| handle_connection(socket, state, user_id))
        .into_response()
}

async fn handle_connection(socket: WebSocket, state: WsState, user_id: String) {
    use futures_util::{SinkExt, StreamExt};
    let (mut sender, mut receiver) = socket.split();

    let (frame_tx, mut frame_rx) = mpsc::channel::<ServerFrame>(256);
    let session_id = state.hub.register_session(&user_id, frame_tx).await;

    loop {
        tokio::select! {
            frame = frame_rx.recv() => {
                match frame {
                    Some(frame) => {
                        let json = match serde_json::to_string(&frame) {
                            Ok(json) => json,
                            Err(e) => {
                                warn!("Frame serialization failed: {}", e);
                                continue;
                            }
                        };
                        if sender.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientFrame>(&text) {
                            Ok(frame) => {
                                if handle_client_frame(&state, session_id, &user_id, frame, &mut sender)
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                            }
                            Err(e) => debug!("Bad client frame: {}", e),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("WebSocket receive error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    state.hub.unregister(session_id).await;
    info!("Hub session {} closed", session_id);
}

async fn handle_client_frame<S>(
    state: &WsState,
    session_id: u64,
    user_id: &str,
    frame: ClientFrame,
    sender: &mut S,
) -> std::result::Result<(), ()>
where
    S: futures_util::Sink<Message> + Unpin,
{
    use futures_util::SinkExt;
    match frame {
        ClientFrame::Subscribe { topics, user_broker_ids, after_seq } => {
            state
                .hub
                .subscribe_session(session_id, topics.clone(), user_broker_ids.clone(), after_seq)
                .await;
            // Bootstrap: replay persisted events the client has not seen,
            // under the same scope filter the live path applies
            if let Some(after) = after_seq {
                let mut cursor = after;
                loop {
                    let page = match state.bus.replay(cursor, REPLAY_PAGE) {
                        Ok(page) => page,
                        Err(e) => {
                            warn!("Replay failed: {}", e);
                            break;
                        }
                    };
                    if page.is_empty() {
                        break;
                    }
                    cursor = page.iter().filter_map(|e| e.seq).max().unwrap_or(cursor);
                    let visible: Vec<_> = page
                        .into_iter()
                        .filter(|event| replay_visible(event, user_id, &user_broker_ids, &topics))
                        .collect();
                    if visible.is_empty() {
                        continue;
                    }
                    let frame = ServerFrame::Batch { events: visible };
                    let json = serde_json::to_string(&frame).map_err(|_| ())?;
                    sender.send(Message::Text(json)).await.map_err(|_| ())?;
                }
                state.hub.ack(session_id, cursor).await;
            }
            let ack = serde_json::to_string(&ServerFrame::Ack { seq: 0 }).map_err(|_| ())?;
            sender.send(Message::Text(ack)).await.map_err(|_| ())?;
        }
        ClientFrame::Ack { seq } => {
            state.hub.ack(session_id, seq).await;
        }
        ClientFrame::Ping => {
            let pong = serde_json::to_string(&ServerFrame::Pong).map_err(|_| ())?;
            sender.send(Message::Text(pong)).await.map_err(|_| ())?;
        }
    }
    Ok(())
}

/// Replay-side scope filter, mirroring the live hub filter
fn replay_visible(
    event: &crate::events::Event,
    user_id: &str,
    user_broker_ids: &[String],
    topics: &[String],
) -> bool {
    use crate::events::EventScope;
    let scope_ok = match event.scope {
        EventScope::Global => true,
        EventScope::User => event.user_id.as_deref() == Some(user_id),
        EventScope::UserBroker => {
            event.user_id.as_deref() == Some(user_id)
                && event
                    .user_broker_id
                    .as_deref()
                    .map(|ub| user_broker_ids.iter().any(|s| s == ub))
                    .unwrap_or(false)
        }
    };
    scope_ok && (topics.is_empty() || topics.iter().any(|t| t == event.event_type.as_str()))
}
