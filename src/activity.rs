use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// Milliseconds since the Unix epoch, saturating at zero for pre-epoch clocks.
pub fn unix_millis(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy)]
struct Stamp {
    monotonic: Instant,
    wall: SystemTime,
}

impl Stamp {
    fn now() -> Self {
        Self {
            monotonic: Instant::now(),
            wall: SystemTime::now(),
        }
    }
}

/// Tracks when a session was last operated on.
///
/// Idle math uses the monotonic clock. The wall-clock copy is only reported.
/// The generation counts touches, so the reaper can tell whether a session
/// was used between its idle scan and the removal.
#[derive(Clone)]
pub struct ActivityTracker {
    last: Arc<Mutex<Stamp>>,
    generation: Arc<AtomicU64>,
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityTracker {
    /// Create a new tracker seeded with the current instant.
    pub fn new() -> Self {
        Self {
            last: Arc::new(Mutex::new(Stamp::now())),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Record activity. Safe to call from blocking threads.
    pub fn touch(&self) {
        self.generation.fetch_add(1, Ordering::Release);
        *self.last.lock() = Stamp::now();
    }

    /// Current generation counter value.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Time elapsed since the last activity.
    pub fn idle_for(&self) -> Duration {
        self.last.lock().monotonic.elapsed()
    }

    /// Whether the session has been idle for strictly longer than `timeout`.
    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.idle_for() > timeout
    }

    /// Wall-clock time of the last activity.
    pub fn last_activity_at(&self) -> SystemTime {
        self.last.lock().wall
    }

    /// [`last_activity_at`](Self::last_activity_at) as Unix milliseconds.
    pub fn last_activity_ms(&self) -> u64 {
        unix_millis(self.last_activity_at())
    }
}
