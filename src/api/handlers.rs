use std::path::PathBuf;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
    Json,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};

use crate::session::{ExecuteOutcome, SessionId, SessionStatus};

use super::error::ApiError;
use super::AppState;

#[derive(Serialize)]
pub(super) struct HealthResponse {
    status: &'static str,
}

pub(super) async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

#[derive(Deserialize)]
pub(super) struct CreateSessionRequest {
    project_id: String,
    user_id: String,
}

#[derive(Serialize)]
pub(super) struct CreateSessionResponse {
    session_id: SessionId,
    cwd: PathBuf,
}

pub(super) async fn session_create(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<Json<CreateSessionResponse>, ApiError> {
    if req.user_id.trim().is_empty() {
        return Err(ApiError::InvalidRequest("user_id must not be empty".into()));
    }
    let cwd = state.resolver.resolve(&req.project_id)?;
    let session = state.sessions.create(req.project_id, req.user_id, cwd);
    Ok(Json(CreateSessionResponse {
        session_id: session.id().clone(),
        cwd: session.cwd().to_path_buf(),
    }))
}

#[derive(Deserialize)]
pub(super) struct ExecuteRequest {
    command: String,
}

#[derive(Serialize)]
pub(super) struct ExecuteResponse {
    success: bool,
    output: String,
    exit_code: Option<i32>,
    signal: Option<i32>,
    streaming: bool,
    pid: Option<u32>,
}

impl From<ExecuteOutcome> for ExecuteResponse {
    fn from(outcome: ExecuteOutcome) -> Self {
        let success = outcome.success();
        match outcome {
            ExecuteOutcome::Completed { pid, output, exit } => Self {
                success,
                output,
                exit_code: exit.code,
                signal: exit.signal,
                streaming: false,
                pid,
            },
            ExecuteOutcome::Streaming { pid } => Self {
                success,
                output: String::new(),
                exit_code: None,
                signal: None,
                streaming: true,
                pid,
            },
        }
    }
}

pub(super) async fn session_execute(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ExecuteRequest>,
) -> Result<Json<ExecuteResponse>, ApiError> {
    let outcome = state.sessions.execute(&SessionId::from(id), &req.command).await?;
    Ok(Json(outcome.into()))
}

#[derive(Deserialize)]
pub(super) struct InputRequest {
    text: String,
}

#[derive(Serialize)]
pub(super) struct InputResponse {
    success: bool,
}

pub(super) async fn session_input(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<InputRequest>,
) -> Result<Json<InputResponse>, ApiError> {
    state.sessions.send_input(&SessionId::from(id), &req.text)?;
    Ok(Json(InputResponse { success: true }))
}

#[derive(Serialize)]
pub(super) struct KillResponse {
    success: bool,
    killed: bool,
}

pub(super) async fn session_kill(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<KillResponse>, ApiError> {
    let killed = state.sessions.kill(&SessionId::from(id)).await?;
    Ok(Json(KillResponse {
        success: true,
        killed,
    }))
}

pub(super) async fn session_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionStatus>, ApiError> {
    Ok(Json(state.sessions.status(&SessionId::from(id))?))
}

pub(super) async fn session_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = SessionId::from(id);
    // Reject unknown sessions before upgrading.
    state.sessions.get(&id)?;
    Ok(ws.on_upgrade(move |socket| handle_session_ws(socket, state, id)))
}

/// Forward output chunks as JSON text frames; incoming text frames are
/// written to the process's stdin.
async fn handle_session_ws(socket: WebSocket, state: AppState, id: SessionId) {
    let (_guard, mut shutdown_rx) = state.shutdown.register();
    let (mut ws_tx, mut ws_rx) = socket.split();

    // The session may have been reaped between the upgrade request and now.
    let subscribed = state.sessions.get(&id).and_then(|session| {
        let (subscription, rx) = state.sessions.subscribe_channel(&id)?;
        Ok((session, subscription, rx))
    });
    let (session, subscription, mut output_rx) = match subscribed {
        Ok(parts) => parts,
        Err(e) => {
            let _ = ws_tx.send(close_message(e.to_string())).await;
            return;
        }
    };
    let cancelled = session.cancelled();
    tracing::debug!(session = %id, "websocket subscribed");

    loop {
        tokio::select! {
            chunk = output_rx.recv() => {
                let Some(chunk) = chunk else { break };
                let json = match serde_json::to_string(&chunk) {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::warn!(session = %id, error = %e, "failed to encode chunk");
                        continue;
                    }
                };
                if ws_tx.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(e) = state.sessions.send_input(&id, text.as_str()) {
                            let err = ApiError::from(e);
                            let frame = serde_json::json!({
                                "error": { "code": err.code(), "message": err.message() }
                            });
                            if ws_tx.send(Message::Text(frame.to_string().into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(_)) => break,
                }
            }

            _ = cancelled.cancelled() => {
                let _ = ws_tx.send(close_message("session closed")).await;
                break;
            }

            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::debug!(session = %id, "websocket received shutdown signal, closing");
                    let _ = ws_tx.send(close_message("server shutting down")).await;
                    let _ = ws_tx.flush().await;
                    break;
                }
            }
        }
    }

    state.sessions.unsubscribe(&subscription);
    tracing::debug!(session = %id, "websocket closed");
}

fn close_message(reason: impl Into<String>) -> Message {
    Message::Close(Some(CloseFrame {
        code: axum::extract::ws::close_code::NORMAL,
        reason: reason.into().into(),
    }))
}
