//! Idle reclamation against a live registry.

mod common;

use std::time::Duration;

use execd::reaper::{Reaper, ReaperConfig};
use execd::session::{SessionError, SessionEvent, SessionRegistry};

use common::{install_fake_npm, pid_alive, registry_with_bin, wait_until};

fn fast_reaper(registry: &SessionRegistry, idle_ms: u64) -> Reaper {
    Reaper::spawn(
        registry.clone(),
        ReaperConfig {
            interval: Duration::from_millis(25),
            idle_timeout: Duration::from_millis(idle_ms),
        },
    )
}

#[tokio::test]
async fn idle_session_with_dev_server_is_reaped_and_process_terminated() {
    let dir = tempfile::tempdir().unwrap();
    let bin = install_fake_npm(dir.path());
    let registry = registry_with_bin(&bin);
    let mut events = registry.subscribe_events();
    let session = registry.create("p", "u", dir.path());

    let outcome = registry.execute(session.id(), "npm run dev").await.unwrap();
    let pid = outcome.pid().unwrap();
    assert!(outcome.is_streaming());

    let reaper = fast_reaper(&registry, 100);
    wait_until("session reaped", || registry.is_empty()).await;
    wait_until("dev server terminated", || !pid_alive(pid)).await;

    let reaped = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            if let SessionEvent::Reaped { id, key } = events.recv().await.unwrap() {
                return (id, key);
            }
        }
    })
    .await
    .expect("reaped event");
    assert_eq!(&reaped.0, session.id());
    assert_eq!(reaped.1.project_id, "p");

    assert!(matches!(
        registry.status(session.id()),
        Err(SessionError::SessionNotFound(_))
    ));
    reaper.shutdown().await;
}

#[tokio::test]
async fn activity_keeps_session_alive() {
    let dir = tempfile::tempdir().unwrap();
    let registry = SessionRegistry::new();
    let session = registry.create("p", "u", dir.path());
    let reaper = fast_reaper(&registry, 150);

    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(25)).await;
        registry.status(session.id()).unwrap();
    }
    assert_eq!(registry.len(), 1);

    wait_until("session reaped once idle", || registry.is_empty()).await;
    reaper.shutdown().await;
}

#[tokio::test]
async fn long_blocking_execute_is_not_reaped() {
    let dir = tempfile::tempdir().unwrap();
    let registry = SessionRegistry::new();
    let session = registry.create("p", "u", dir.path());

    let reg = registry.clone();
    let id = session.id().clone();
    let run = tokio::spawn(async move { reg.execute(&id, "sleep 1").await });
    wait_until("sleep to start", || session.is_active()).await;

    let reaper = fast_reaper(&registry, 50);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(registry.len(), 1, "session with a running execute was reaped");

    let outcome = run.await.unwrap().unwrap();
    assert!(outcome.success());
    wait_until("session reaped after run", || registry.is_empty()).await;
    reaper.shutdown().await;
}

#[tokio::test]
async fn reaped_key_can_be_recreated() {
    let dir = tempfile::tempdir().unwrap();
    let registry = SessionRegistry::new();
    let old = registry.create("p", "u", dir.path());
    let reaper = fast_reaper(&registry, 30);
    wait_until("session reaped", || registry.is_empty()).await;
    reaper.shutdown().await;

    let fresh = registry.create("p", "u", dir.path());
    assert_ne!(fresh.id(), old.id());
    assert!(fresh.output_history().is_empty());
}
