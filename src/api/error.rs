use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::allowlist::REJECTED_EXIT_CODE;
use crate::process::SPAWN_FAILED_EXIT_CODE;
use crate::session::SessionError;
use crate::workspace::WorkspaceError;

/// Structured error type for all API handlers.
///
/// Each variant maps to an HTTP status code, a machine-readable code string,
/// and a human-readable message. Failures that stand in for a command result
/// also carry the exit indicator a shell would have reported.
#[derive(Debug)]
pub enum ApiError {
    /// 400 - Malformed or invalid request.
    InvalidRequest(String),
    /// 403 - Command rejected by the allowlist.
    CommandRejected(String),
    /// 404 - No session with this id.
    SessionNotFound(String),
    /// 409 - Input sent to a session with nothing running.
    NoActiveProcess(String),
    /// 503 - The process is not draining its input.
    InputBackpressure(String),
    /// 500 - The process could not be started.
    SpawnFailed(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::CommandRejected(_) => StatusCode::FORBIDDEN,
            ApiError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::NoActiveProcess(_) => StatusCode::CONFLICT,
            ApiError::InputBackpressure(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::SpawnFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::CommandRejected(_) => "command_not_allowed",
            ApiError::SessionNotFound(_) => "session_not_found",
            ApiError::NoActiveProcess(_) => "no_active_process",
            ApiError::InputBackpressure(_) => "input_backpressure",
            ApiError::SpawnFailed(_) => "spawn_failed",
        }
    }

    pub fn message(&self) -> String {
        match self {
            ApiError::InvalidRequest(detail) => format!("Invalid request: {}.", detail),
            ApiError::CommandRejected(detail) => detail.clone(),
            ApiError::SessionNotFound(id) => format!("Session not found: {}.", id),
            ApiError::NoActiveProcess(id) => format!("No active process in session {}.", id),
            ApiError::InputBackpressure(id) => {
                format!("Process in session {} is not reading its input.", id)
            }
            ApiError::SpawnFailed(detail) => format!("Failed to start process: {}.", detail),
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ApiError::CommandRejected(_) => Some(REJECTED_EXIT_CODE),
            ApiError::SpawnFailed(_) => Some(SPAWN_FAILED_EXIT_CODE),
            _ => None,
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Validation(e) => ApiError::CommandRejected(e.to_string()),
            SessionError::SessionNotFound(id) => ApiError::SessionNotFound(id.to_string()),
            SessionError::NoActiveProcess(id) => ApiError::NoActiveProcess(id.to_string()),
            SessionError::InputBackpressure(id) => ApiError::InputBackpressure(id.to_string()),
            SessionError::ProcessSpawn(e) => ApiError::SpawnFailed(e.to_string()),
        }
    }
}

impl From<WorkspaceError> for ApiError {
    fn from(err: WorkspaceError) -> Self {
        ApiError::InvalidRequest(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.message(),
            }
        });
        if let Some(code) = self.exit_code() {
            body["exit_code"] = code.into();
        }
        (self.status_code(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allowlist::ParsedCommand;
    use crate::session::SessionId;
    use axum::body::Body;
    use http_body_util::BodyExt;

    async fn response_parts(err: ApiError) -> (StatusCode, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let body = Body::new(response.into_body())
            .collect()
            .await
            .unwrap()
            .to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        (status, json)
    }

    #[tokio::test]
    async fn rejected_command_is_forbidden_with_exit_code() {
        let validation = ParsedCommand::parse("bash").unwrap_err();
        let err = ApiError::from(SessionError::from(validation));
        let (status, json) = response_parts(err).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(json["error"]["code"], "command_not_allowed");
        assert_eq!(json["exit_code"], 126);
        assert!(json["error"]["message"]
            .as_str()
            .unwrap()
            .contains("Allowed commands:"));
    }

    #[tokio::test]
    async fn session_not_found_is_404() {
        let err = ApiError::from(SessionError::SessionNotFound(SessionId::from("abc")));
        let (status, json) = response_parts(err).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["error"]["code"], "session_not_found");
        assert_eq!(json["error"]["message"], "Session not found: abc.");
        assert!(json.get("exit_code").is_none());
    }

    #[tokio::test]
    async fn no_active_process_is_conflict() {
        let err = ApiError::from(SessionError::NoActiveProcess(SessionId::from("abc")));
        let (status, json) = response_parts(err).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json["error"]["code"], "no_active_process");
    }

    #[tokio::test]
    async fn input_backpressure_is_service_unavailable() {
        let err = ApiError::from(SessionError::InputBackpressure(SessionId::from("abc")));
        let (status, json) = response_parts(err).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["error"]["code"], "input_backpressure");
        assert!(json.get("exit_code").is_none());
    }

    #[tokio::test]
    async fn spawn_failure_is_500_with_exit_code() {
        let (status, json) = response_parts(ApiError::SpawnFailed("boom".into())).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json["exit_code"], 127);
    }

    #[tokio::test]
    async fn invalid_project_id_is_bad_request() {
        let err = ApiError::from(WorkspaceError::InvalidProjectId("..".into()));
        let (status, json) = response_parts(err).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"]["code"], "invalid_request");
    }
}
