pub mod error;
mod handlers;

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    http::{HeaderName, HeaderValue},
    routing::{get, post},
    Router,
};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::session::SessionRegistry;
use crate::shutdown::ShutdownCoordinator;
use crate::workspace::WorkspaceResolver;

use handlers::*;

#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionRegistry,
    pub resolver: Arc<dyn WorkspaceResolver>,
    pub shutdown: ShutdownCoordinator,
}

pub fn router(state: AppState) -> Router {
    let session_routes = Router::new()
        .route("/sessions", post(session_create))
        .route("/sessions/{id}", get(session_status))
        .route("/sessions/{id}/execute", post(session_execute))
        .route("/sessions/{id}/input", post(session_input))
        .route("/sessions/{id}/kill", post(session_kill))
        .route("/sessions/{id}/ws", get(session_ws))
        .with_state(state);

    Router::new()
        .route("/health", get(health))
        .merge(session_routes)
        .layer(DefaultBodyLimit::max(1024 * 1024)) // 1 MB
        .layer(TraceLayer::new_for_http())
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("cache-control"),
            HeaderValue::from_static("no-store"),
        ))
}
