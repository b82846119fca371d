//! Chat gateway: WebSocket fan-out between authenticated clients and a
//! session's control channel.
//!
//! Protocol: the first client frame must be `{"type":"auth","token":…}`.
//! Auth failure closes with 4001; a token bound to a different session
//! closes with 4003; session termination emits a `session_closed` frame
//! and closes with 4000.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use chrono::Utc;
use futures::{SinkExt, StreamExt, stream::SplitSink};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;
use uuid::Uuid;

use crate::sessions::SessionEvent;
use crate::state::AppState;

pub const CLOSE_SESSION_ENDED: u16 = 4000;
pub const CLOSE_UNAUTHORIZED: u16 = 4001;
pub const CLOSE_WRONG_SESSION: u16 = 4003;

/// How long the client has to present its auth frame.
const AUTH_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Auth { token: String },
    Message { text: String },
    Heartbeat,
}

/// `GET /ws/sessions/:id` (upgrade).
pub async fn session_ws(
    ws: WebSocketUpgrade,
    Path(session_id): Path<Uuid>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_session_ws(socket, state, session_id))
}

async fn send_json(sink: &mut SplitSink<WebSocket, Message>, value: &serde_json::Value) -> bool {
    let Ok(text) = serde_json::to_string(value) else {
        return true;
    };
    sink.send(Message::Text(text.into())).await.is_ok()
}

async fn close_with(sink: &mut SplitSink<WebSocket, Message>, code: u16, reason: &'static str) {
    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

async fn handle_session_ws(socket: WebSocket, state: AppState, session_id: Uuid) {
    let (mut sink, mut stream) = socket.split();

    // First frame must authenticate.
    let auth_token = match tokio::time::timeout(AUTH_DEADLINE, stream.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => {
            match serde_json::from_str::<ClientFrame>(&text) {
                Ok(ClientFrame::Auth { token }) => token,
                _ => {
                    close_with(&mut sink, CLOSE_UNAUTHORIZED, "expected auth frame").await;
                    return;
                }
            }
        }
        _ => {
            close_with(&mut sink, CLOSE_UNAUTHORIZED, "no auth frame").await;
            return;
        }
    };

    let resolved = state
        .store
        .get_account_by_token(&auth_token, Utc::now())
        .await
        .ok()
        .flatten();
    let Some((account, record)) = resolved else {
        close_with(&mut sink, CLOSE_UNAUTHORIZED, "invalid token").await;
        return;
    };

    if record.bound_session_id != Some(session_id) {
        close_with(&mut sink, CLOSE_WRONG_SESSION, "token not bound to this session").await;
        return;
    }

    let Some(live) = state.registry.get(session_id) else {
        let _ = send_json(
            &mut sink,
            &json!({
                "type": "session_closed",
                "reason": "not_live",
                "message": "session is not running",
            }),
        )
        .await;
        close_with(&mut sink, CLOSE_SESSION_ENDED, "session ended").await;
        return;
    };

    let Some(mut events) = state.registry.add_peer(session_id) else {
        close_with(&mut sink, CLOSE_SESSION_ENDED, "session ended").await;
        return;
    };

    debug!(session_id = %session_id, account_id = %account.id, "chat peer attached");

    // Hello frame with the connection summary.
    let connection = state
        .store
        .get_connection(account.id, live.connection_id)
        .await
        .ok()
        .flatten();
    let hello = json!({
        "type": "session",
        "connection": connection.as_ref().map(|c| json!({
            "id": c.id,
            "host": c.host,
            "port": c.port,
            "username": c.username,
            "label": c.label,
        })),
    });
    if !send_json(&mut sink, &hello).await {
        state.registry.remove_peer(session_id);
        return;
    }

    loop {
        tokio::select! {
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        state.registry.touch(session_id, Utc::now());
                        match serde_json::from_str::<ClientFrame>(&text) {
                            Ok(ClientFrame::Message { text }) => {
                                if state
                                    .manager
                                    .send_message(session_id, text, Utc::now())
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                            }
                            Ok(ClientFrame::Heartbeat) => {
                                if !send_json(&mut sink, &json!({ "type": "heartbeat_ack" })).await {
                                    break;
                                }
                            }
                            Ok(ClientFrame::Auth { .. }) => {} // already authenticated
                            Err(e) => {
                                debug!(error = %e, "ignoring malformed client frame");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // binary/ping/pong
                    Some(Err(_)) => break,
                }
            }
            event = events.recv() => {
                match event {
                    Ok(SessionEvent::SessionClosed { reason, message }) => {
                        let _ = send_json(&mut sink, &json!({
                            "type": "session_closed",
                            "reason": reason,
                            "message": message,
                        })).await;
                        close_with(&mut sink, CLOSE_SESSION_ENDED, "session ended").await;
                        break;
                    }
                    Ok(event) => {
                        let Ok(value) = serde_json::to_value(&event) else { continue };
                        if !send_json(&mut sink, &value).await {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "chat peer lagged behind fan-out");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    state.registry.remove_peer(session_id);
    debug!(session_id = %session_id, "chat peer detached");
}
