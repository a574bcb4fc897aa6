//! Integration tests for the HTTP and WebSocket API over a real listener.

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use futures::{SinkExt, StreamExt};
use http_body_util::BodyExt;
use tokio::net::TcpListener;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tower::ServiceExt;

use execd::api::{router, AppState};
use execd::session::{Session, SessionRegistry};
use execd::shutdown::ShutdownCoordinator;
use execd::workspace::DirectoryResolver;

use common::wait_until;

fn test_state(root: &std::path::Path) -> AppState {
    AppState {
        sessions: SessionRegistry::new(),
        resolver: Arc::new(DirectoryResolver::new(root)),
        shutdown: ShutdownCoordinator::new(),
    }
}

async fn start_server(state: AppState) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn next_json(
    ws: &mut (impl StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin),
) -> serde_json::Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn subscribed(session: &Session) {
    wait_until("websocket subscription", || session.subscriber_count() == 1).await;
}

#[tokio::test]
async fn create_then_execute_via_http() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("site")).unwrap();
    std::fs::write(dir.path().join("site/index.html"), "<h1>hi</h1>").unwrap();
    let state = test_state(dir.path());

    let create = Request::post("/sessions")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"project_id":"site","user_id":"u1"}"#))
        .unwrap();
    let response = router(state.clone()).oneshot(create).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let created: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let id = created["session_id"].as_str().unwrap().to_string();

    let execute = Request::post(format!("/sessions/{id}/execute"))
        .header("content-type", "application/json")
        .body(Body::from(r#"{"command":"ls"}"#))
        .unwrap();
    let response = router(state).oneshot(execute).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let result: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(result["output"], "index.html\n");
    assert_eq!(result["exit_code"], 0);
    assert!(result["pid"].as_u64().is_some());
}

#[tokio::test]
async fn websocket_streams_output_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path());
    let session = state.sessions.create("p", "u", dir.path());
    let addr = start_server(state.clone()).await;

    let url = format!("ws://{addr}/sessions/{}/ws", session.id());
    let (mut ws, _response) = connect_async(&url).await.expect("connect");
    subscribed(&session).await;

    state.sessions.execute(session.id(), "echo over-the-wire").await.unwrap();

    let chunk = next_json(&mut ws).await;
    assert_eq!(chunk["kind"], "stdout");
    assert_eq!(chunk["text"], "over-the-wire\n");
    assert!(chunk["timestamp"].as_u64().unwrap() > 0);

    let exit = next_json(&mut ws).await;
    assert_eq!(exit["kind"], "exit");
    assert_eq!(exit["text"], "Process exited with code 0");
}

#[tokio::test]
async fn websocket_text_frames_are_process_input() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path());
    let session = state.sessions.create("p", "u", dir.path());
    let addr = start_server(state.clone()).await;

    let url = format!("ws://{addr}/sessions/{}/ws", session.id());
    let (mut ws, _response) = connect_async(&url).await.expect("connect");
    subscribed(&session).await;

    // Nothing running yet: the input is refused with an error frame.
    ws.send(Message::Text("early\n".into())).await.unwrap();
    let err = next_json(&mut ws).await;
    assert_eq!(err["error"]["code"], "no_active_process");

    let sessions = state.sessions.clone();
    let id = session.id().clone();
    let run = tokio::spawn(async move { sessions.execute(&id, "cat").await });
    wait_until("cat to start", || session.is_active()).await;

    ws.send(Message::Text("typed\n".into())).await.unwrap();
    let echoed = next_json(&mut ws).await;
    assert_eq!(echoed["text"], "typed\n");

    state.sessions.kill(session.id()).await.unwrap();
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn websocket_unsubscribes_on_disconnect() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path());
    let session = state.sessions.create("p", "u", dir.path());
    let addr = start_server(state.clone()).await;

    let url = format!("ws://{addr}/sessions/{}/ws", session.id());
    let (mut ws, _response) = connect_async(&url).await.expect("connect");
    subscribed(&session).await;

    ws.close(None).await.unwrap();
    wait_until("connection released", || {
        session.subscriber_count() == 0 && state.shutdown.active_connections() == 0
    })
    .await;
}

#[tokio::test]
async fn websocket_unknown_session_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_server(test_state(dir.path())).await;
    let url = format!("ws://{addr}/sessions/does-not-exist/ws");
    assert!(connect_async(&url).await.is_err());
}

#[tokio::test]
async fn websocket_receives_close_frame_on_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path());
    let session = state.sessions.create("p", "u", dir.path());
    let addr = start_server(state.clone()).await;

    let url = format!("ws://{addr}/sessions/{}/ws", session.id());
    let (mut ws, _response) = connect_async(&url).await.expect("connect");
    subscribed(&session).await;

    state.shutdown.shutdown();

    let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("timed out waiting for close")
        .expect("stream ended")
        .expect("websocket error");
    match msg {
        Message::Close(Some(frame)) => assert_eq!(frame.reason.as_str(), "server shutting down"),
        other => panic!("expected close frame, got {other:?}"),
    }
}

#[tokio::test]
async fn websocket_closes_when_session_is_reaped() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path());
    let session = state.sessions.create("p", "u", dir.path());
    let addr = start_server(state.clone()).await;

    let url = format!("ws://{addr}/sessions/{}/ws", session.id());
    let (mut ws, _response) = connect_async(&url).await.expect("connect");
    subscribed(&session).await;

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(state.sessions.reap_idle(Duration::from_millis(10)).len(), 1);

    let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("timed out waiting for close");
    assert!(
        matches!(msg, None | Some(Ok(Message::Close(_))) | Some(Err(_))),
        "unexpected frame: {msg:?}"
    );
}
