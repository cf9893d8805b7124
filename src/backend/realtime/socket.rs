/**
 * WebSocket Endpoint
 *
 * `GET /ws` authenticates the caller, attaches a hub session, then runs
 * one loop per connection that selects between:
 *
 * - inbound frames from the client, dispatched in arrival order
 * - envelopes from the session's bounded outbound queue, written in
 *   enqueue order
 *
 * The loop ends when the client closes, a write fails, or the hub drops
 * the session (reap or shutdown), which closes the outbound queue.
 *
 * # Handshake
 *
 * The bearer token is read from `?token=` or the `Authorization` header.
 * A bad credential answers 401 and a full per-user ceiling answers 429,
 * both with the JSON error envelope and before the upgrade happens.
 */
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;

use crate::backend::auth::sessions::user_id_from_token;
use crate::backend::middleware::bearer_token;
use crate::backend::realtime::hub::{DetachReason, SessionHandle};
use crate::backend::realtime::protocol::{FrameOutcome, SessionContext};
use crate::backend::server::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> Response {
    let token = query
        .token
        .as_deref()
        .filter(|t| !t.is_empty())
        .or_else(|| bearer_token(&headers));
    let user_id = match token {
        Some(token) => match user_id_from_token(token, &state.config.auth.jwt_secret) {
            Ok(user_id) => Some(user_id),
            Err(e) => return e.into_response(),
        },
        None => None,
    };

    let handle = match state.hub.attach(user_id).await {
        Ok(handle) => handle,
        Err(e) => return e.into_response(),
    };

    let hub = state.hub.clone();
    let session_id = handle.id;
    ws.on_failed_upgrade(move |e| {
        tracing::warn!("[Hub] Upgrade for session {} failed: {}", session_id, e);
        tokio::spawn(async move {
            hub.detach_with(session_id, DetachReason::TransportError).await;
        });
    })
    .on_upgrade(move |socket| run_session(socket, state, handle))
}

async fn run_session(socket: WebSocket, state: AppState, mut handle: SessionHandle) {
    let (mut sender, mut receiver) = socket.split();
    let ctx = SessionContext {
        session_id: handle.id,
        user_id: handle.user_id,
        hub: state.hub.clone(),
        delivery: state.delivery.clone(),
        clock: state.clock.clone(),
    };

    // None once the hub already removed the session
    let reason: Option<DetachReason> = loop {
        tokio::select! {
            inbound = receiver.next() => {
                let outcome = match inbound {
                    Some(Ok(Message::Text(text))) => ctx.handle_text(text.as_str()).await,
                    Some(Ok(Message::Binary(_))) => ctx.handle_binary().await,
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                        state.hub.touch(handle.id).await;
                        FrameOutcome::Silent
                    }
                    Some(Ok(Message::Close(_))) | None => break Some(DetachReason::Closed),
                    Some(Err(e)) => {
                        tracing::debug!("[Hub] Read error on session {}: {}", handle.id, e);
                        break Some(DetachReason::TransportError);
                    }
                };
                match outcome {
                    FrameOutcome::Silent => {}
                    FrameOutcome::Reaped => break None,
                    FrameOutcome::Reply(envelope) => {
                        let text = match envelope.to_json() {
                            Ok(text) => text,
                            Err(e) => {
                                tracing::error!("[Hub] Failed to serialize reply: {}", e);
                                continue;
                            }
                        };
                        if sender.send(Message::Text(text.into())).await.is_err() {
                            break Some(DetachReason::TransportError);
                        }
                    }
                }
            }
            outbound = handle.outbound.recv() => {
                let Some(envelope) = outbound else {
                    break None;
                };
                let text = match envelope.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!("[Hub] Failed to serialize envelope: {}", e);
                        continue;
                    }
                };
                if sender.send(Message::Text(text.into())).await.is_err() {
                    break Some(DetachReason::TransportError);
                }
            }
        }
    };

    match reason {
        Some(reason) => {
            state.hub.detach_with(handle.id, reason).await;
        }
        None => {
            let _ = sender.send(Message::Close(None)).await;
        }
    }
}
