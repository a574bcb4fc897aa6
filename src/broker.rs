use std::collections::VecDeque;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use serde::Serialize;

use crate::activity::unix_millis;

/// Default number of chunks retained per session.
pub const DEFAULT_HISTORY_LIMIT: usize = 1000;

/// Which stream a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    #[serde(rename = "stdout")]
    Primary,
    #[serde(rename = "stderr")]
    Secondary,
    Exit,
}

/// One unit of process output as delivered to history and subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputChunk {
    pub text: String,
    pub kind: OutputKind,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl OutputChunk {
    pub fn new(kind: OutputKind, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            kind,
            timestamp: unix_millis(SystemTime::now()),
        }
    }

    pub fn primary(text: impl Into<String>) -> Self {
        Self::new(OutputKind::Primary, text)
    }

    pub fn secondary(text: impl Into<String>) -> Self {
        Self::new(OutputKind::Secondary, text)
    }

    pub fn exit(text: impl Into<String>) -> Self {
        Self::new(OutputKind::Exit, text)
    }
}

/// Listener invoked for every published chunk.
///
/// Runs while the broker lock is held, so it must return quickly and must
/// not call back into the same session. Forward into a channel if the
/// consumer does any I/O.
pub type OutputCallback = Arc<dyn Fn(&OutputChunk) + Send + Sync>;

/// Identifies one subscription within a broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

struct BrokerInner {
    history: VecDeque<OutputChunk>,
    limit: usize,
    subscribers: Vec<(SubscriberId, OutputCallback)>,
    next_id: u64,
}

/// Per-session output fan-out.
///
/// `publish` appends to the bounded history and calls every subscriber in
/// one critical section. Chunks published by one stream's reader therefore
/// reach history and all subscribers in the same order, and concurrent
/// readers (stdout and stderr) cannot interleave inside a single delivery.
#[derive(Clone)]
pub struct OutputBroker {
    inner: Arc<Mutex<BrokerInner>>,
}

impl OutputBroker {
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_HISTORY_LIMIT)
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BrokerInner {
                history: VecDeque::with_capacity(limit.min(DEFAULT_HISTORY_LIMIT)),
                limit,
                subscribers: Vec::new(),
                next_id: 0,
            })),
        }
    }

    pub fn publish(&self, chunk: OutputChunk) {
        let mut inner = self.inner.lock();
        if inner.limit > 0 {
            while inner.history.len() >= inner.limit {
                inner.history.pop_front();
            }
            inner.history.push_back(chunk.clone());
        }

        let mut panicked = Vec::new();
        for (id, callback) in &inner.subscribers {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(&chunk)));
            if result.is_err() {
                tracing::error!(subscriber = id.0, "output subscriber panicked, removing it");
                panicked.push(*id);
            }
        }
        if !panicked.is_empty() {
            inner.subscribers.retain(|(id, _)| !panicked.contains(id));
        }
    }

    pub fn subscribe(&self, callback: OutputCallback) -> SubscriberId {
        let mut inner = self.inner.lock();
        let id = SubscriberId(inner.next_id);
        inner.next_id += 1;
        inner.subscribers.push((id, callback));
        id
    }

    /// Remove a subscriber. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.subscribers.len();
        inner.subscribers.retain(|(sid, _)| *sid != id);
        inner.subscribers.len() != before
    }

    /// Snapshot of retained chunks, oldest first.
    pub fn history(&self) -> Vec<OutputChunk> {
        self.inner.lock().history.iter().cloned().collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    /// Drop every subscriber. Channel-backed subscribers see their receiver
    /// close once the last sender clone is gone.
    pub fn clear_subscribers(&self) {
        self.inner.lock().subscribers.clear();
    }
}

impl Default for OutputBroker {
    fn default() -> Self {
        Self::new()
    }
}
