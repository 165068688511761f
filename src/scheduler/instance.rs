//! Per-model instance bookkeeping.

use crate::backend::ProcessInfo;
use crate::registry::Model;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{Semaphore, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Loading,
    Ready,
    Draining,
}

/// Progress of an instance's first load, observed by concurrent ensure callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Warmup {
    Pending,
    Ready,
    Failed(String),
}

/// Monotonic clock shared by every instance of one scheduler.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Clock {
    started: Instant,
    started_wall: SystemTime,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            started_wall: SystemTime::now(),
        }
    }

    /// Nanoseconds since the scheduler started.
    pub fn now(&self) -> u64 {
        self.started.elapsed().as_nanos() as u64
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Convert a reading of [`Clock::now`] to unix seconds.
    pub fn to_unix(&self, ticks: u64) -> u64 {
        (self.started_wall + Duration::from_nanos(ticks))
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default()
    }
}

/// The part of an instance shared with admission callers outside the map lock.
#[derive(Debug)]
pub(crate) struct Slots {
    /// Bounded FIFO of callers, including the one executing
    pub queue: Arc<Semaphore>,
    /// At most one generation at a time
    pub exec: Arc<Semaphore>,
    pub depth: usize,
    /// Callers that entered admission and have not released yet
    pending: AtomicUsize,
    last_used: AtomicU64,
}

impl Slots {
    pub fn new(depth: usize, now: u64) -> Self {
        Self {
            queue: Arc::new(Semaphore::new(depth)),
            exec: Arc::new(Semaphore::new(1)),
            depth,
            pending: AtomicUsize::new(0),
            last_used: AtomicU64::new(now),
        }
    }

    /// Refresh recency. Never moves backwards.
    pub fn touch(&self, now: u64) {
        self.last_used.fetch_max(now, Ordering::AcqRel);
    }

    pub fn last_used(&self) -> u64 {
        self.last_used.load(Ordering::Acquire)
    }

    pub fn queue_len(&self) -> usize {
        self.depth.saturating_sub(self.queue.available_permits())
    }

    pub fn inflight(&self) -> usize {
        1usize.saturating_sub(self.exec.available_permits())
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// No caller is queued, executing, or about to queue.
    pub fn is_idle(&self) -> bool {
        self.pending() == 0 && self.queue_len() == 0 && self.inflight() == 0
    }

    /// Must only be called while holding the scheduler's map lock, so eviction and
    /// admission cannot interleave.
    pub fn enter(self: &Arc<Self>) -> PendingGuard {
        self.pending.fetch_add(1, Ordering::AcqRel);
        PendingGuard {
            slots: Arc::clone(self),
        }
    }

    /// Wake every waiter with an error; used once the instance leaves the map.
    pub fn close(&self) {
        self.queue.close();
        self.exec.close();
    }
}

/// Keeps an admission caller counted as pending until dropped.
#[derive(Debug)]
pub(crate) struct PendingGuard {
    slots: Arc<Slots>,
}

impl PendingGuard {
    pub fn slots(&self) -> &Arc<Slots> {
        &self.slots
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.slots.pending.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Debug)]
pub(crate) struct Instance {
    pub model: Model,
    pub state: InstanceState,
    pub est_mb: u64,
    pub process: Option<ProcessInfo>,
    pub slots: Arc<Slots>,
    pub warmup: watch::Receiver<Warmup>,
}

impl Instance {
    pub fn is_evictable(&self) -> bool {
        self.state == InstanceState::Ready && self.slots.is_idle()
    }
}
