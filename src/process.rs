use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::ChildStdin;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::allowlist::ParsedCommand;
use crate::broker::{OutputBroker, OutputChunk, OutputKind};

/// Exit indicator reported when the OS refuses to start a process.
pub const SPAWN_FAILED_EXIT_CODE: i32 = 127;

const READ_BUFFER_SIZE: usize = 4096;

/// Capacity of the stdin channel. Input beyond this while the child is not
/// reading is refused rather than queued.
const INPUT_CHANNEL_CAPACITY: usize = 64;

/// How long the exit monitor waits for the output pipes to reach EOF after
/// the child has exited. A grandchild that inherited the pipes can keep them
/// open indefinitely.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("child {0} pipe was not captured")]
    MissingPipe(&'static str),
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputError {
    #[error("process input is closed")]
    Closed,

    #[error("process is not reading its input")]
    Full,
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Text of the `exit` chunk emitted for this outcome.
    pub fn describe(&self) -> String {
        match (self.code, self.signal) {
            (Some(code), _) => format!("Process exited with code {code}"),
            (None, Some(signal)) => format!("Process terminated by signal {signal}"),
            (None, None) => "Process exited with unknown status".to_string(),
        }
    }
}

impl From<std::process::ExitStatus> for ProcessExit {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

/// Destination for chunks produced by a running process.
pub trait OutputSink: Send + Sync + 'static {
    fn emit(&self, chunk: OutputChunk);
}

impl OutputSink for OutputBroker {
    fn emit(&self, chunk: OutputChunk) {
        self.publish(chunk);
    }
}

/// Handle to a spawned process.
///
/// Cheap to clone. The child itself is owned by the exit-monitor task; the
/// handle only talks to it through channels and signals.
#[derive(Clone)]
pub struct ProcessHandle {
    pid: Option<u32>,
    input_tx: mpsc::Sender<Bytes>,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
    exited: Arc<AtomicBool>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("exited", &self.has_exited())
            .finish_non_exhaustive()
    }
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the child has been reaped by the OS.
    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    /// Queue bytes for the child's stdin without waiting.
    ///
    /// Fails with [`InputError::Full`] once the pipe and the queue are both
    /// full, which happens when the child never reads stdin.
    pub fn send_input(&self, data: Bytes) -> Result<(), InputError> {
        if self.has_exited() {
            return Err(InputError::Closed);
        }
        self.input_tx.try_send(data).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => InputError::Full,
            mpsc::error::TrySendError::Closed(_) => InputError::Closed,
        })
    }

    /// Wait until the exit chunk has been published and return the outcome.
    pub async fn wait(&self) -> ProcessExit {
        let mut rx = self.exit_rx.clone();
        // An error means the monitor task is gone without reporting.
        let _ = rx.wait_for(Option::is_some).await;
        let status = *rx.borrow();
        status.unwrap_or(ProcessExit { code: None, signal: None })
    }

    /// Send SIGTERM to the process group.
    pub fn terminate(&self) -> bool {
        #[cfg(unix)]
        {
            self.signal(libc::SIGTERM)
        }
        #[cfg(not(unix))]
        {
            false
        }
    }

    /// Send SIGKILL to the process group.
    pub fn force_kill(&self) -> bool {
        #[cfg(unix)]
        {
            self.signal(libc::SIGKILL)
        }
        #[cfg(not(unix))]
        {
            false
        }
    }

    /// Deliver `signal` to the child's process group.
    ///
    /// The child is spawned as the leader of its own group, so signalling the
    /// negative PID also reaches anything it forked (a package manager's
    /// node server, for instance). Returns `false` without signalling once
    /// the child has been reaped, since the PID may have been recycled.
    #[cfg(unix)]
    pub fn signal(&self, signal: libc::c_int) -> bool {
        let Some(pid) = self.pid else {
            return false;
        };
        if pid == 0 || pid > i32::MAX as u32 {
            tracing::warn!(pid, "PID is 0 or exceeds i32::MAX, cannot send signal");
            return false;
        }
        if self.has_exited() {
            tracing::debug!(pid, signal, "child already exited, skipping signal");
            return false;
        }
        // SAFETY: kill(2) has no memory-safety preconditions.
        let rc = unsafe { libc::kill(-(pid as i32), signal) };
        if rc == 0 {
            return true;
        }
        // SAFETY: as above.
        unsafe { libc::kill(pid as i32, signal) == 0 }
    }
}

/// Spawn `command` in `cwd` with stdin, stdout and stderr piped.
///
/// Output chunks go to `sink` in the order they are read from each stream.
/// When the child exits the monitor task drains both pipes, emits one
/// [`OutputKind::Exit`] chunk, calls `on_exit`, and only then publishes the
/// outcome to [`ProcessHandle::wait`]. Anyone woken by `wait` therefore
/// observes the exit chunk and the effects of `on_exit`.
///
/// Must be called from within a tokio runtime.
pub fn spawn<F>(
    command: &ParsedCommand,
    cwd: &Path,
    env: &HashMap<String, String>,
    sink: Arc<dyn OutputSink>,
    on_exit: F,
) -> Result<ProcessHandle, SpawnError>
where
    F: FnOnce(&ProcessExit) + Send + 'static,
{
    let mut std_cmd = std::process::Command::new(&command.program);
    std_cmd
        .args(&command.args)
        .current_dir(cwd)
        .envs(env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        std_cmd.process_group(0);
    }

    let mut child = tokio::process::Command::from(std_cmd)
        .spawn()
        .map_err(|source| SpawnError::Spawn {
            program: command.program.clone(),
            source,
        })?;
    let pid = child.id();

    let stdin = child.stdin.take().ok_or(SpawnError::MissingPipe("stdin"))?;
    let stdout = child.stdout.take().ok_or(SpawnError::MissingPipe("stdout"))?;
    let stderr = child.stderr.take().ok_or(SpawnError::MissingPipe("stderr"))?;

    tracing::debug!(?pid, program = %command.program, cwd = %cwd.display(), "process spawned");

    let done = CancellationToken::new();
    let (input_tx, input_rx) = mpsc::channel::<Bytes>(INPUT_CHANNEL_CAPACITY);
    spawn_writer(stdin, input_rx, done.clone());

    let mut stdout_task = spawn_reader(stdout, OutputKind::Primary, sink.clone());
    let mut stderr_task = spawn_reader(stderr, OutputKind::Secondary, sink.clone());

    let exited = Arc::new(AtomicBool::new(false));
    let (exit_tx, exit_rx) = watch::channel::<Option<ProcessExit>>(None);

    let exited_flag = exited.clone();
    tokio::spawn(async move {
        let status = match child.wait().await {
            Ok(status) => ProcessExit::from(status),
            Err(e) => {
                tracing::error!(?e, ?pid, "error waiting for child");
                ProcessExit { code: None, signal: None }
            }
        };
        // Set before anything else so no signal can reach a recycled PID.
        exited_flag.store(true, Ordering::Release);
        done.cancel();

        let drained = tokio::time::timeout(READER_DRAIN_TIMEOUT, async {
            let _ = (&mut stdout_task).await;
            let _ = (&mut stderr_task).await;
        })
        .await;
        if drained.is_err() {
            tracing::warn!(?pid, "output pipes still open after exit, abandoning readers");
            stdout_task.abort();
            stderr_task.abort();
        }

        tracing::debug!(?pid, ?status, "process exited");
        sink.emit(OutputChunk::exit(status.describe()));
        on_exit(&status);
        let _ = exit_tx.send(Some(status));
    });

    Ok(ProcessHandle {
        pid,
        input_tx,
        exit_rx,
        exited,
    })
}

fn spawn_writer(
    mut stdin: ChildStdin,
    mut input_rx: mpsc::Receiver<Bytes>,
    done: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                data = input_rx.recv() => {
                    let Some(data) = data else { break };
                    if let Err(e) = stdin.write_all(&data).await {
                        tracing::debug!(?e, "stdin write failed, closing input");
                        break;
                    }
                    let _ = stdin.flush().await;
                }
                _ = done.cancelled() => break,
            }
        }
    })
}

fn spawn_reader<R>(mut reader: R, kind: OutputKind, sink: Arc<dyn OutputSink>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; READ_BUFFER_SIZE];
        let mut decoder = Utf8Carry::default();
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let text = decoder.decode(&buf[..n]);
                    if !text.is_empty() {
                        sink.emit(OutputChunk::new(kind, text));
                    }
                }
                Err(e) => {
                    tracing::debug!(?e, ?kind, "output read failed");
                    break;
                }
            }
        }
        let rest = decoder.finish();
        if !rest.is_empty() {
            sink.emit(OutputChunk::new(kind, rest));
        }
    })
}

/// Incremental UTF-8 decoder that holds back a sequence split across reads.
#[derive(Default)]
struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(s) => {
                    out.push_str(s);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        // Truncated sequence at the end: wait for more bytes.
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                    }
                }
            }
        }
    }

    fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}
