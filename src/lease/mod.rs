//! Workflow Lease Manager
//!
//! Grants exclusive, run-scoped leases. Every read or mutation of a run's
//! state happens under its lease, which serializes concurrent apply
//! attempts on the same run while leaving unrelated runs independent.
//!
//! Each run key has its own wait queue ordered by priority, then arrival.
//! A released lease is handed directly to the next waiter, so a caller
//! arriving later can never barge ahead of the queue.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::id::RunKey;

/// Priority class of a lease request
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LeasePriority {
    Low,
    Normal,
    High,
}

impl std::fmt::Display for LeasePriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeasePriority::Low => write!(f, "LOW"),
            LeasePriority::Normal => write!(f, "NORMAL"),
            LeasePriority::High => write!(f, "HIGH"),
        }
    }
}

/// Queued lease request
struct Waiter {
    priority: LeasePriority,
    seq: u64,
    grant: oneshot::Sender<()>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiter {
    // Max-heap: higher priority first, then lower sequence (earlier arrival)
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Wait queue of a held key. A key present in the map is held.
#[derive(Default)]
struct KeyQueue {
    waiters: BinaryHeap<Waiter>,
}

/// Snapshot of lease counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseStats {
    pub acquired: u64,
    pub released_ok: u64,
    pub released_err: u64,
    pub abandoned: u64,
    pub held_keys: usize,
}

struct Shared {
    queues: Mutex<HashMap<RunKey, KeyQueue>>,
    next_seq: AtomicU64,
    acquired: AtomicU64,
    released_ok: AtomicU64,
    released_err: AtomicU64,
    abandoned: AtomicU64,
}

impl Shared {
    fn queues(&self) -> MutexGuard<'_, HashMap<RunKey, KeyQueue>> {
        self.queues.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Pass a held key to the best live waiter, or free it
    fn hand_off(&self, key: &RunKey) {
        let mut queues = self.queues();
        let Some(queue) = queues.get_mut(key) else {
            return;
        };

        while let Some(waiter) = queue.waiters.pop() {
            if waiter.grant.send(()).is_ok() {
                return;
            }
        }

        queues.remove(key);
    }

    /// Withdraw a waiter that stopped waiting. If the lease was already
    /// handed to it, pass it on.
    fn abandon(&self, key: &RunKey, seq: u64, rx: &mut oneshot::Receiver<()>) {
        {
            let mut queues = self.queues();
            if let Some(queue) = queues.get_mut(key) {
                let before = queue.waiters.len();
                queue.waiters.retain(|w| w.seq != seq);
                if queue.waiters.len() < before {
                    return;
                }
            }
        }

        if rx.try_recv().is_ok() {
            tracing::debug!("Passing on lease for {} granted to a withdrawn waiter", key);
            self.hand_off(key);
        }
    }
}

/// An in-flight wait; withdraws itself if dropped before being granted
struct PendingWait {
    shared: Arc<Shared>,
    key: RunKey,
    seq: u64,
    rx: oneshot::Receiver<()>,
    settled: bool,
}

impl Drop for PendingWait {
    fn drop(&mut self) {
        if !self.settled {
            self.shared.abandon(&self.key, self.seq, &mut self.rx);
        }
    }
}

/// Grants run-scoped exclusive leases
#[derive(Clone)]
pub struct LeaseManager {
    shared: Arc<Shared>,
}

impl Default for LeaseManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaseManager {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                queues: Mutex::new(HashMap::new()),
                next_seq: AtomicU64::new(0),
                acquired: AtomicU64::new(0),
                released_ok: AtomicU64::new(0),
                released_err: AtomicU64::new(0),
                abandoned: AtomicU64::new(0),
            }),
        }
    }

    /// Acquire the lease for `key`, waiting behind current holders.
    ///
    /// Fails with [`Error::Cancelled`] if `ctx` is cancelled first.
    pub async fn acquire(
        &self,
        ctx: &CancellationToken,
        key: &RunKey,
        priority: LeasePriority,
    ) -> Result<Lease> {
        if ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let mut wait = {
            let mut queues = self.shared.queues();
            if let Some(queue) = queues.get_mut(key) {
                let (tx, rx) = oneshot::channel();
                let seq = self.shared.next_seq.fetch_add(1, Ordering::Relaxed);
                queue.waiters.push(Waiter {
                    priority,
                    seq,
                    grant: tx,
                });
                PendingWait {
                    shared: Arc::clone(&self.shared),
                    key: key.clone(),
                    seq,
                    rx,
                    settled: false,
                }
            } else {
                queues.insert(key.clone(), KeyQueue::default());
                return Ok(self.granted(key, priority));
            }
        };

        tracing::trace!("Waiting for {} lease on {}", priority, key);

        tokio::select! {
            granted = &mut wait.rx => {
                wait.settled = true;
                match granted {
                    Ok(()) => Ok(self.granted(key, priority)),
                    Err(_) => Err(Error::Internal(format!("lease queue for {} was dropped", key))),
                }
            }
            _ = ctx.cancelled() => {
                drop(wait);
                Err(Error::Cancelled)
            }
        }
    }

    fn granted(&self, key: &RunKey, priority: LeasePriority) -> Lease {
        self.shared.acquired.fetch_add(1, Ordering::Relaxed);
        Lease {
            key: key.clone(),
            priority,
            acquired_at: Instant::now(),
            shared: Arc::clone(&self.shared),
            released: false,
        }
    }

    /// Whether some caller currently holds the lease for `key`
    pub fn is_held(&self, key: &RunKey) -> bool {
        self.shared.queues().contains_key(key)
    }

    /// Current counters
    pub fn stats(&self) -> LeaseStats {
        LeaseStats {
            acquired: self.shared.acquired.load(Ordering::Relaxed),
            released_ok: self.shared.released_ok.load(Ordering::Relaxed),
            released_err: self.shared.released_err.load(Ordering::Relaxed),
            abandoned: self.shared.abandoned.load(Ordering::Relaxed),
            held_keys: self.shared.queues().len(),
        }
    }
}

/// Exclusive access to one run. Must be released exactly once; dropping
/// an unreleased lease releases it as abandoned.
pub struct Lease {
    key: RunKey,
    priority: LeasePriority,
    acquired_at: Instant,
    shared: Arc<Shared>,
    released: bool,
}

impl Lease {
    pub fn key(&self) -> &RunKey {
        &self.key
    }

    pub fn priority(&self) -> LeasePriority {
        self.priority
    }

    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    /// Release the lease, recording the outcome of the work done under it
    pub fn release(mut self, err: Option<&Error>) {
        match err {
            None => {
                self.shared.released_ok.fetch_add(1, Ordering::Relaxed);
                tracing::trace!("Released lease on {} after {:?}", self.key, self.held_for());
            }
            Some(e) => {
                self.shared.released_err.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    "Released lease on {} after {:?} with error ({}): {}",
                    self.key,
                    self.held_for(),
                    e.kind(),
                    e
                );
            }
        }
        self.released = true;
        self.shared.hand_off(&self.key);
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.shared.abandoned.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("Lease on {} dropped without release", self.key);
            self.shared.hand_off(&self.key);
        }
    }
}
