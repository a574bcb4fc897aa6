use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::activity::ActivityTracker;
use crate::allowlist::{ParsedCommand, ValidationError, REJECTED_EXIT_CODE};
use crate::broker::{OutputBroker, OutputCallback, OutputChunk, OutputKind, SubscriberId};
use crate::config::SessionConfig;
use crate::process::{
    self, InputError, ProcessExit, ProcessHandle, SpawnError, SPAWN_FAILED_EXIT_CODE,
};

/// Identity a session is bound to. At most one session exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SessionKey {
    pub project_id: String,
    pub user_id: String,
}

impl SessionKey {
    pub fn new(project_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            user_id: user_id.into(),
        }
    }
}

/// Opaque session identifier handed to callers by `create`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("no active process in session {0}")]
    NoActiveProcess(SessionId),

    #[error("process in session {0} is not reading its input")]
    InputBackpressure(SessionId),

    #[error(transparent)]
    ProcessSpawn(#[from] SpawnError),
}

impl SessionError {
    /// Exit indicator for failures that stand in for a command result.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            SessionError::Validation(_) => Some(REJECTED_EXIT_CODE),
            SessionError::ProcessSpawn(_) => Some(SPAWN_FAILED_EXIT_CODE),
            _ => None,
        }
    }
}

/// Result of a successful `execute`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecuteOutcome {
    /// The command ran to completion. Non-zero exit codes land here too.
    Completed {
        pid: Option<u32>,
        output: String,
        exit: ProcessExit,
    },
    /// A dev-server command was started; output continues to subscribers.
    Streaming { pid: Option<u32> },
}

impl ExecuteOutcome {
    pub fn pid(&self) -> Option<u32> {
        match self {
            ExecuteOutcome::Completed { pid, .. } | ExecuteOutcome::Streaming { pid } => *pid,
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, ExecuteOutcome::Streaming { .. })
    }

    /// Streaming starts count as success; completed runs need exit code 0.
    pub fn success(&self) -> bool {
        match self {
            ExecuteOutcome::Completed { exit, .. } => exit.success(),
            ExecuteOutcome::Streaming { .. } => true,
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ExecuteOutcome::Completed { exit, .. } => exit.code,
            ExecuteOutcome::Streaming { .. } => None,
        }
    }

    pub fn output(&self) -> &str {
        match self {
            ExecuteOutcome::Completed { output, .. } => output,
            ExecuteOutcome::Streaming { .. } => "",
        }
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub session_id: SessionId,
    pub active: bool,
    pub pid: Option<u32>,
    pub cwd: PathBuf,
    pub buffered_output: Vec<OutputChunk>,
    /// Milliseconds since the Unix epoch.
    pub last_activity_at: u64,
}

/// Returned by `subscribe`; pass back to `unsubscribe`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    session_id: SessionId,
    subscriber: SubscriberId,
}

impl SubscriptionHandle {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }
}

struct LiveProcess {
    handle: ProcessHandle,
    generation: u64,
    /// Set by `kill`. The slot stays occupied until the exit is observed so
    /// a following `execute` still waits for the process to go away.
    terminating: bool,
}

#[derive(Default)]
struct ProcessSlot {
    live: Option<LiveProcess>,
    next_generation: u64,
}

struct SessionInner {
    id: SessionId,
    key: SessionKey,
    cwd: PathBuf,
    broker: OutputBroker,
    activity: ActivityTracker,
    slot: Mutex<ProcessSlot>,
    /// Serialises process-slot transitions and reaping. Never held while a
    /// blocking `execute` waits for its process.
    op_lock: tokio::sync::Mutex<()>,
    in_flight: Arc<AtomicUsize>,
    /// Fires when the session is reaped or drained.
    cancelled: CancellationToken,
}

/// RAII guard marking a blocking `execute` in progress.
struct InFlightGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Release);
    }
}

/// Subscriber that accumulates the text of one blocking run.
struct OutputCollector {
    broker: OutputBroker,
    id: SubscriberId,
    text: Arc<Mutex<String>>,
}

impl OutputCollector {
    fn start(broker: &OutputBroker) -> Self {
        let text = Arc::new(Mutex::new(String::new()));
        let sink = text.clone();
        let callback: OutputCallback = Arc::new(move |chunk: &OutputChunk| {
            if chunk.kind != OutputKind::Exit {
                sink.lock().push_str(&chunk.text);
            }
        });
        let id = broker.subscribe(callback);
        Self {
            broker: broker.clone(),
            id,
            text,
        }
    }

    fn take(&self) -> String {
        std::mem::take(&mut *self.text.lock())
    }
}

impl Drop for OutputCollector {
    fn drop(&mut self) {
        self.broker.unsubscribe(self.id);
    }
}

/// A per-(project, user) terminal bound to at most one live process.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("key", &self.inner.key)
            .field("cwd", &self.inner.cwd)
            .finish_non_exhaustive()
    }
}

impl Session {
    fn new(key: SessionKey, cwd: PathBuf, history_limit: usize) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id: SessionId::generate(),
                key,
                cwd,
                broker: OutputBroker::with_limit(history_limit),
                activity: ActivityTracker::new(),
                slot: Mutex::new(ProcessSlot::default()),
                op_lock: tokio::sync::Mutex::new(()),
                in_flight: Arc::new(AtomicUsize::new(0)),
                cancelled: CancellationToken::new(),
            }),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.inner.id
    }

    pub fn key(&self) -> &SessionKey {
        &self.inner.key
    }

    pub fn cwd(&self) -> &Path {
        &self.inner.cwd
    }

    pub fn activity(&self) -> &ActivityTracker {
        &self.inner.activity
    }

    /// Token cancelled when the session leaves the registry.
    pub fn cancelled(&self) -> CancellationToken {
        self.inner.cancelled.clone()
    }

    /// Whether a process is running and has not been asked to terminate.
    pub fn is_active(&self) -> bool {
        matches!(&self.inner.slot.lock().live, Some(live) if !live.terminating)
    }

    /// PID of the active process, if any.
    pub fn pid(&self) -> Option<u32> {
        match &self.inner.slot.lock().live {
            Some(live) if !live.terminating => live.handle.pid(),
            _ => None,
        }
    }

    /// Retained output, oldest first.
    pub fn output_history(&self) -> Vec<OutputChunk> {
        self.inner.broker.history()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.broker.subscriber_count()
    }

    fn touch(&self) {
        self.inner.activity.touch();
    }

    fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    fn enter_in_flight(&self) -> InFlightGuard {
        self.inner.in_flight.fetch_add(1, Ordering::AcqRel);
        InFlightGuard {
            counter: self.inner.in_flight.clone(),
        }
    }

    fn live_handle(&self) -> Option<ProcessHandle> {
        self.inner.slot.lock().live.as_ref().map(|l| l.handle.clone())
    }

    /// Validate and run `line`, replacing any running process.
    ///
    /// Dev-server commands return as soon as the process is spawned. All
    /// others block until exit and return the combined stdout and stderr of
    /// the run, independent of the history limit.
    pub async fn execute(
        &self,
        line: &str,
        config: &SessionConfig,
    ) -> Result<ExecuteOutcome, SessionError> {
        self.touch();
        let command = ParsedCommand::parse(line).inspect_err(|e| {
            tracing::warn!(session = %self.inner.id, error = %e, "command rejected");
        })?;
        let streaming = command.is_streaming();

        let (handle, collector, _in_flight) = {
            let _op = self.inner.op_lock.lock().await;
            if self.inner.cancelled.is_cancelled() {
                return Err(SessionError::SessionNotFound(self.inner.id.clone()));
            }
            self.release_slot(config.replace_grace()).await;

            let collector = (!streaming).then(|| OutputCollector::start(&self.inner.broker));
            let handle = self.spawn_into_slot(&command, config)?;
            tracing::info!(
                session = %self.inner.id,
                pid = ?handle.pid(),
                command = %command.display(),
                streaming,
                "executing command"
            );
            let in_flight = (!streaming).then(|| self.enter_in_flight());
            (handle, collector, in_flight)
        };

        let Some(collector) = collector else {
            return Ok(ExecuteOutcome::Streaming { pid: handle.pid() });
        };

        let exit = handle.wait().await;
        self.touch();
        Ok(ExecuteOutcome::Completed {
            pid: handle.pid(),
            output: collector.take(),
            exit,
        })
    }

    /// Spawn under the slot lock so the exit callback cannot run before the
    /// process is installed.
    fn spawn_into_slot(
        &self,
        command: &ParsedCommand,
        config: &SessionConfig,
    ) -> Result<ProcessHandle, SessionError> {
        let mut slot = self.inner.slot.lock();
        let generation = slot.next_generation;
        slot.next_generation += 1;

        let weak: Weak<SessionInner> = Arc::downgrade(&self.inner);
        let handle = process::spawn(
            command,
            &self.inner.cwd,
            &config.env,
            Arc::new(self.inner.broker.clone()),
            move |status| {
                let Some(inner) = weak.upgrade() else { return };
                let mut slot = inner.slot.lock();
                if slot.live.as_ref().is_some_and(|l| l.generation == generation) {
                    slot.live = None;
                }
                tracing::debug!(session = %inner.id, ?status, "process slot released");
            },
        )
        .inspect_err(|e| {
            tracing::warn!(session = %self.inner.id, error = %e, "process failed to start");
        })?;

        slot.live = Some(LiveProcess {
            handle: handle.clone(),
            generation,
            terminating: false,
        });
        Ok(handle)
    }

    /// Terminate the running process, if any, and wait for it to leave the
    /// slot. Escalates to SIGKILL after `grace`.
    async fn release_slot(&self, grace: Duration) {
        let Some(handle) = self.live_handle() else {
            return;
        };
        tracing::info!(session = %self.inner.id, pid = ?handle.pid(), "replacing running process");
        handle.terminate();
        if tokio::time::timeout(grace, handle.wait()).await.is_err() {
            tracing::warn!(
                session = %self.inner.id,
                pid = ?handle.pid(),
                "process ignored SIGTERM, sending SIGKILL"
            );
            handle.force_kill();
            handle.wait().await;
        }
    }

    /// Queue `text` verbatim for the running process's stdin. Never waits
    /// on the process.
    pub fn send_input(&self, text: &str) -> Result<(), SessionError> {
        let handle = match &self.inner.slot.lock().live {
            Some(live) if !live.terminating => live.handle.clone(),
            _ => return Err(SessionError::NoActiveProcess(self.inner.id.clone())),
        };
        handle
            .send_input(Bytes::copy_from_slice(text.as_bytes()))
            .map_err(|e| match e {
                InputError::Closed => SessionError::NoActiveProcess(self.inner.id.clone()),
                InputError::Full => SessionError::InputBackpressure(self.inner.id.clone()),
            })?;
        self.touch();
        Ok(())
    }

    /// Send SIGTERM to the running process. Returns `false` if nothing was
    /// running (or it was already being killed).
    ///
    /// Waits for an `execute` that is replacing a process to finish swapping
    /// it, which takes at most the replace grace period plus the output drain
    /// timeout.
    pub async fn kill(&self) -> bool {
        self.touch();
        let _op = self.inner.op_lock.lock().await;
        let handle = {
            let mut slot = self.inner.slot.lock();
            match slot.live.as_mut() {
                Some(live) if !live.terminating => {
                    live.terminating = true;
                    live.handle.clone()
                }
                _ => return false,
            }
        };
        let signalled = handle.terminate();
        tracing::info!(session = %self.inner.id, pid = ?handle.pid(), signalled, "process killed");
        true
    }

    pub fn status(&self) -> SessionStatus {
        self.touch();
        let pid = match &self.inner.slot.lock().live {
            Some(live) if !live.terminating => Some(live.handle.pid()),
            _ => None,
        };
        SessionStatus {
            session_id: self.inner.id.clone(),
            active: pid.is_some(),
            pid: pid.flatten(),
            cwd: self.inner.cwd.clone(),
            buffered_output: self.inner.broker.history(),
            last_activity_at: self.inner.activity.last_activity_ms(),
        }
    }

    /// Tear down after removal from the registry: cancel watchers, drop
    /// subscribers, SIGTERM the process. Returns the signalled PID.
    fn shutdown(&self) -> Option<u32> {
        self.inner.cancelled.cancel();
        self.inner.broker.clear_subscribers();
        let handle = self.live_handle()?;
        handle.terminate().then(|| handle.pid()).flatten()
    }
}

/// Server-level session lifecycle events.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Created { id: SessionId, key: SessionKey },
    Reaped { id: SessionId, key: SessionKey },
    Drained { id: SessionId },
}

struct RegistryInner {
    sessions: HashMap<SessionId, Session>,
    by_key: HashMap<SessionKey, SessionId>,
}

/// Shared table of sessions.
///
/// The map lock only covers lookups and membership changes and is never
/// held across an await; work on a session is serialised by that session's
/// own locks, so unrelated sessions never wait on each other.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RwLock<RegistryInner>>,
    config: Arc<SessionConfig>,
    events_tx: broadcast::Sender<SessionEvent>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::with_config(SessionConfig::default())
    }

    pub fn with_config(config: SessionConfig) -> Self {
        let (events_tx, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(RwLock::new(RegistryInner {
                sessions: HashMap::new(),
                by_key: HashMap::new(),
            })),
            config: Arc::new(config),
            events_tx,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Return the session for `(project_id, user_id)`, creating it with `cwd`
    /// if absent. An existing session keeps its original working directory.
    pub fn create(
        &self,
        project_id: impl Into<String>,
        user_id: impl Into<String>,
        cwd: impl Into<PathBuf>,
    ) -> Session {
        let key = SessionKey::new(project_id, user_id);
        let mut inner = self.inner.write();

        if let Some(existing) = inner.by_key.get(&key).and_then(|id| inner.sessions.get(id)) {
            existing.touch();
            return existing.clone();
        }

        let session = Session::new(key.clone(), cwd.into(), self.config.history_limit);
        let id = session.id().clone();
        inner.by_key.insert(key.clone(), id.clone());
        inner.sessions.insert(id.clone(), session.clone());
        drop(inner);

        tracing::info!(
            session = %id,
            project = %key.project_id,
            user = %key.user_id,
            cwd = %session.cwd().display(),
            "session created"
        );
        let _ = self.events_tx.send(SessionEvent::Created { id, key });
        session
    }

    pub fn get(&self, id: &SessionId) -> Result<Session, SessionError> {
        self.inner
            .read()
            .sessions
            .get(id)
            .cloned()
            .ok_or_else(|| SessionError::SessionNotFound(id.clone()))
    }

    pub async fn execute(
        &self,
        id: &SessionId,
        line: &str,
    ) -> Result<ExecuteOutcome, SessionError> {
        let session = self.get(id)?;
        session.execute(line, &self.config).await
    }

    pub fn send_input(&self, id: &SessionId, text: &str) -> Result<(), SessionError> {
        self.get(id)?.send_input(text)
    }

    pub async fn kill(&self, id: &SessionId) -> Result<bool, SessionError> {
        Ok(self.get(id)?.kill().await)
    }

    pub fn status(&self, id: &SessionId) -> Result<SessionStatus, SessionError> {
        Ok(self.get(id)?.status())
    }

    /// Register `callback` for every future chunk of the session's output.
    pub fn subscribe<F>(
        &self,
        id: &SessionId,
        callback: F,
    ) -> Result<SubscriptionHandle, SessionError>
    where
        F: Fn(&OutputChunk) + Send + Sync + 'static,
    {
        let session = self.get(id)?;
        session.touch();
        let subscriber = session.inner.broker.subscribe(Arc::new(callback));
        Ok(SubscriptionHandle {
            session_id: id.clone(),
            subscriber,
        })
    }

    /// Subscribe through a channel, for transports that forward chunks with
    /// I/O of their own. The receiver closes when the session is reaped.
    pub fn subscribe_channel(
        &self,
        id: &SessionId,
    ) -> Result<(SubscriptionHandle, mpsc::UnboundedReceiver<OutputChunk>), SessionError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = self.subscribe(id, move |chunk: &OutputChunk| {
            let _ = tx.send(chunk.clone());
        })?;
        Ok((handle, rx))
    }

    /// Remove a subscription. Unknown handles and reaped sessions are ignored.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        if let Ok(session) = self.get(&handle.session_id) {
            session.inner.broker.unsubscribe(handle.subscriber);
        }
    }

    pub fn list(&self) -> Vec<SessionId> {
        self.inner.read().sessions.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribe to session lifecycle events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    /// Remove every session idle for longer than `idle_timeout` and SIGTERM
    /// its process.
    ///
    /// A session whose operation lock is held, or that has a blocking
    /// `execute` waiting on its process, is in use and is left alone until
    /// a later sweep.
    pub fn reap_idle(&self, idle_timeout: Duration) -> Vec<SessionId> {
        let candidates: Vec<(Session, u64)> = self
            .inner
            .read()
            .sessions
            .values()
            .filter(|s| s.activity().is_idle(idle_timeout))
            .map(|s| (s.clone(), s.activity().generation()))
            .collect();

        let mut reaped = Vec::new();
        for (session, seen) in candidates {
            let Ok(_op) = session.inner.op_lock.try_lock() else {
                tracing::debug!(session = %session.id(), "idle session busy, skipping");
                continue;
            };
            if session.in_flight() > 0 {
                continue;
            }

            {
                let mut inner = self.inner.write();
                // Activity may have landed since the candidate scan.
                if session.activity().generation() != seen {
                    continue;
                }
                inner.sessions.remove(session.id());
                if inner.by_key.get(session.key()) == Some(session.id()) {
                    inner.by_key.remove(session.key());
                }
            }

            let pid = session.shutdown();
            tracing::info!(
                session = %session.id(),
                project = %session.key().project_id,
                user = %session.key().user_id,
                idle_secs = session.activity().idle_for().as_secs(),
                terminated_pid = ?pid,
                "reaped idle session"
            );
            let _ = self.events_tx.send(SessionEvent::Reaped {
                id: session.id().clone(),
                key: session.key().clone(),
            });
            reaped.push(session.id().clone());
        }
        reaped
    }

    /// Remove all sessions and SIGTERM their processes. Used at shutdown.
    ///
    /// Processes that ignore the signal are not escalated; they outlive the
    /// service the same way untracked processes would after a crash.
    pub fn drain(&self) -> usize {
        let drained: Vec<Session> = {
            let mut inner = self.inner.write();
            inner.by_key.clear();
            inner.sessions.drain().map(|(_, s)| s).collect()
        };
        for session in &drained {
            let pid = session.shutdown();
            tracing::debug!(session = %session.id(), terminated_pid = ?pid, "session drained");
            let _ = self.events_tx.send(SessionEvent::Drained {
                id: session.id().clone(),
            });
        }
        drained.len()
    }
}
