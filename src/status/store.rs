use super::model::StatusSnapshot;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::info;

/// Default number of snapshots kept in history
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// Upper bound for a single history query, regardless of what the caller asks for
pub const MAX_HISTORY_LIMIT: usize = 100;

#[derive(Debug, Default)]
struct StoreInner {
    latest: Option<StatusSnapshot>,
    history: VecDeque<StatusSnapshot>,
}

/// Bounded record of the latest and historical status snapshots.
///
/// All reads and writes go through one mutex so a reader never sees a history
/// longer than the capacity or a `latest` that disagrees with the history tail.
/// Critical sections only clone or push, they never await.
#[derive(Debug)]
pub struct StatusStore {
    inner: Mutex<StoreInner>,
    capacity: usize,
    started_at: Instant,
}

impl Default for StatusStore {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl StatusStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(StoreInner {
                latest: None,
                history: VecDeque::with_capacity(capacity),
            }),
            capacity,
            started_at: Instant::now(),
        }
    }

    // A panic while holding the lock cannot leave the store half-written, so the
    // poisoned guard is still usable.
    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces the latest snapshot and appends it to history, evicting the oldest
    /// entries once the capacity is exceeded.
    pub fn update(&self, snapshot: StatusSnapshot) {
        info!(
            queue_length = snapshot.queue_length,
            fps = snapshot.fps,
            sync = %snapshot.sync_status,
            sensor = %snapshot.sensor_status,
            "Status updated"
        );

        let mut inner = self.lock();
        inner.history.push_back(snapshot.clone());
        while inner.history.len() > self.capacity {
            inner.history.pop_front();
        }
        inner.latest = Some(snapshot);
    }

    pub fn latest(&self) -> Option<StatusSnapshot> {
        self.lock().latest.clone()
    }

    /// Returns the last `min(limit, 100, len)` snapshots, oldest first
    pub fn history(&self, limit: usize) -> Vec<StatusSnapshot> {
        let limit = limit.min(MAX_HISTORY_LIMIT);
        let inner = self.lock();
        let skip = inner.history.len().saturating_sub(limit);
        inner.history.iter().skip(skip).cloned().collect()
    }

    pub fn history_len(&self) -> usize {
        self.lock().history.len()
    }

    /// Timestamp of the most recent snapshot, if any
    pub fn last_updated(&self) -> Option<i64> {
        self.lock().latest.as_ref().map(|s| s.timestamp)
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
