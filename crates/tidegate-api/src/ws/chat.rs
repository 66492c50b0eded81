//! WebSocket chat session loop.
//!
//! One task per connection. Outbound frames go through a single writer
//! task so chunk ordering is never interleaved; a dedicated heartbeat
//! task pings on an interval. The message loop itself is sequential: a
//! second user turn is only read after the previous turn's terminal
//! frame, which is what guarantees in-order streaming per session.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use tidegate_core::{ChatRole, ChatTurn};
use tidegate_llm::GenerationRequest;

use crate::history::{HistoryStore, StoredTurn};
use crate::server::AppState;

use super::frames::{Inbound, Outbound};
use super::session::{SessionHandle, SessionKey, SessionPhase};

#[derive(Debug, Deserialize)]
pub struct ChatQuery {
    pub user_id: String,
}

/// `GET /ws/chat/:chat_id?user_id=...` upgraded to a chat session.
pub async fn ws_chat_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    Query(query): Query<ChatQuery>,
) -> Response {
    ws.on_upgrade(move |socket| run_session(socket, state, query.user_id, chat_id))
}

async fn run_session(socket: WebSocket, state: AppState, user_id: String, chat_id: String) {
    let key = SessionKey::new(user_id.clone(), chat_id.clone());
    let (mut sink, mut receiver) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(64);

    // Single writer; everything outbound funnels through this task.
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(error = %e, "dropping unserializable frame");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                // Dropping the receiver makes later sends fail fast.
                break;
            }
        }
    });

    let heartbeat_tx = out_tx.clone();
    let heartbeat_interval = state.gateway.config().heartbeat_interval();
    let heartbeat = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(heartbeat_interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let ping = Outbound::Ping {
                timestamp: Utc::now(),
            };
            if heartbeat_tx.send(ping).await.is_err() {
                return;
            }
        }
    });

    let handle = Arc::new(SessionHandle::new(
        state.gateway.config().liveness_timeout(),
        heartbeat,
    ));
    state.sessions.register(key.clone(), handle.clone());

    let connected = Outbound::Connected {
        chat_id: chat_id.clone(),
        user_id: user_id.clone(),
    };
    if out_tx.send(connected).await.is_err() {
        state.sessions.teardown(&key, &handle);
        return;
    }
    handle.advance(SessionPhase::Open);
    tracing::info!(%user_id, %chat_id, "session opened");

    let receive_timeout = state.gateway.config().receive_timeout();
    loop {
        let frame = match tokio::time::timeout(receive_timeout, receiver.next()).await {
            Err(_) => {
                if handle.liveness.is_stale() {
                    tracing::info!(%user_id, %chat_id, "session stale, closing");
                    break;
                }
                continue;
            }
            Ok(None) | Ok(Some(Err(_))) => break,
            Ok(Some(Ok(frame))) => frame,
        };

        let text = match frame {
            Message::Text(text) => text,
            Message::Close(_) => break,
            // Transport-level ping/pong and binary frames still prove the
            // client is alive.
            _ => {
                handle.liveness.mark_active();
                continue;
            }
        };
        handle.liveness.mark_active();

        match serde_json::from_str::<Inbound>(&text) {
            Ok(Inbound::Ping) => {
                let pong = Outbound::Pong {
                    timestamp: Utc::now(),
                };
                if out_tx.send(pong).await.is_err() {
                    break;
                }
            }
            Ok(Inbound::Pong) => {
                // mark_active above already refreshed liveness.
            }
            Ok(Inbound::Message {
                content,
                model,
                temperature,
                max_tokens,
            }) => {
                let turn = TurnParams {
                    content,
                    model,
                    temperature,
                    max_tokens,
                };
                if !process_turn(&state, &key, &out_tx, turn).await {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "malformed inbound frame");
                let err = Outbound::Error {
                    error: "malformed frame".to_string(),
                };
                if out_tx.send(err).await.is_err() {
                    break;
                }
            }
        }
    }

    handle.advance(SessionPhase::Closing);
    state.sessions.teardown(&key, &handle);
    writer.abort();
    tracing::info!(%user_id, %chat_id, "session closed");
}

struct TurnParams {
    content: String,
    model: Option<String>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
}

/// Handle one user turn end to end. Returns false when the client is
/// gone and the session loop should stop.
async fn process_turn(
    state: &AppState,
    key: &SessionKey,
    out: &mpsc::Sender<Outbound>,
    params: TurnParams,
) -> bool {
    let user_turn = StoredTurn::new(ChatRole::User, params.content.clone());
    let (message_id, created_at) = (user_turn.id, user_turn.created_at);
    if let Err(e) = state
        .history
        .append_turn(&key.user_id, &key.chat_id, user_turn)
        .await
    {
        tracing::warn!(error = %e, "failed to persist user turn");
        let err = Outbound::Error {
            error: e.to_string(),
        };
        return out.send(err).await.is_ok();
    }

    let ack = Outbound::UserMessage {
        message_id,
        content: params.content,
        created_at,
    };
    if out.send(ack).await.is_err() {
        return false;
    }

    let turns: Vec<ChatTurn> = match state.history.list_turns(&key.user_id, &key.chat_id).await {
        Ok(stored) => stored.iter().map(ChatTurn::from).collect(),
        Err(e) => {
            let err = Outbound::Error {
                error: e.to_string(),
            };
            return out.send(err).await.is_ok();
        }
    };
    let context = state
        .context
        .build(&turns, None, state.summarizer.as_deref())
        .await;

    let assistant_id = Uuid::new_v4();
    if out
        .send(Outbound::StreamStart {
            message_id: assistant_id,
        })
        .await
        .is_err()
    {
        return false;
    }

    let mut request = GenerationRequest::new(context);
    request.model = params.model;
    request.max_tokens = params.max_tokens;
    if let Some(temperature) = params.temperature {
        request.temperature = temperature;
    }

    let generation = match state.gateway.stream(&request).await {
        Ok(generation) => generation,
        Err(e) => {
            tracing::warn!(error = %e, "stream setup failed");
            let err = Outbound::StreamError {
                message_id: assistant_id,
                error: e.to_string(),
            };
            return out.send(err).await.is_ok();
        }
    };
    let model = generation.model;
    let mut stream = generation.fragments;

    let mut full = String::new();
    let mut fragments = 0u32;
    while let Some(item) = stream.next().await {
        match item {
            Ok(fragment) => {
                full.push_str(&fragment);
                fragments += 1;
                let chunk = Outbound::StreamChunk {
                    message_id: assistant_id,
                    content: fragment,
                };
                if out.send(chunk).await.is_err() {
                    // Client gone mid-stream; dropping `stream` cancels
                    // the upstream request and the turn stays unpersisted.
                    return false;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, fragments, "stream failed mid-generation");
                let err = Outbound::StreamError {
                    message_id: assistant_id,
                    error: e.to_string(),
                };
                return out.send(err).await.is_ok();
            }
        }
    }

    // The streaming path exposes no usage object, so the delivered
    // fragment count stands in for tokens_used.
    let tokens_used = fragments;
    let assistant_turn = StoredTurn {
        id: assistant_id,
        role: ChatRole::Assistant,
        content: full.clone(),
        model: Some(model),
        tokens_used: Some(tokens_used),
        created_at: Utc::now(),
    };
    if let Err(e) = state
        .history
        .append_turn(&key.user_id, &key.chat_id, assistant_turn)
        .await
    {
        tracing::warn!(error = %e, "failed to persist assistant turn");
    }

    tracing::debug!(fragments, "turn complete");
    let end = Outbound::StreamEnd {
        message_id: assistant_id,
        content: full,
        tokens_used,
        complete: true,
    };
    out.send(end).await.is_ok()
}
