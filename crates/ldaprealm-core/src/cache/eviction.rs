use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::trace;

/// Something whose entries can expire.
pub(crate) trait Expire<K>: Send + Sync + 'static {
    /// Remove the entry `id` stored under `key`, unless `cancelled` is set.
    /// Implementations check the flag under the same lock that guards removal.
    fn expire(&self, key: &K, id: u64, cancelled: &AtomicBool);
}

struct Pending<K> {
    deadline: Instant,
    seq: u64,
    key: K,
    id: u64,
    cancelled: Arc<AtomicBool>,
}

impl<K> PartialEq for Pending<K> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl<K> Eq for Pending<K> {}

impl<K> PartialOrd for Pending<K> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for Pending<K> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

/// Single background worker that expires cache entries on schedule.
///
/// Each scheduled expiry returns a cancellation flag; setting it (under the
/// owner's lock) guarantees the expiry becomes a no-op. The worker stops
/// when the scheduler or the owner is dropped.
pub(crate) struct EvictionScheduler<K> {
    tx: mpsc::UnboundedSender<Pending<K>>,
    seq: AtomicU64,
}

impl<K: Send + 'static> EvictionScheduler<K> {
    /// Spawn the worker on the current tokio runtime.
    pub(crate) fn start<T: Expire<K>>(owner: Weak<T>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(rx, owner));
        Self {
            tx,
            seq: AtomicU64::new(0),
        }
    }

    pub(crate) fn schedule(&self, key: K, id: u64, delay: Duration) -> Arc<AtomicBool> {
        let cancelled = Arc::new(AtomicBool::new(false));
        let pending = Pending {
            deadline: Instant::now() + delay,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            key,
            id,
            cancelled: cancelled.clone(),
        };
        // A closed channel means the worker is gone along with the owner.
        let _ = self.tx.send(pending);
        cancelled
    }
}

async fn run<K, T: Expire<K>>(mut rx: mpsc::UnboundedReceiver<Pending<K>>, owner: Weak<T>) {
    let mut queue: BinaryHeap<Reverse<Pending<K>>> = BinaryHeap::new();
    loop {
        let next = queue.peek().map(|Reverse(p)| p.deadline);
        tokio::select! {
            received = rx.recv() => match received {
                Some(pending) => {
                    if !pending.cancelled.load(Ordering::SeqCst) {
                        queue.push(Reverse(pending));
                    }
                }
                None => break,
            },
            _ = sleep_until(next.unwrap_or_else(Instant::now)), if next.is_some() => {
                let Some(owner) = owner.upgrade() else { break };
                let now = Instant::now();
                while queue.peek().is_some_and(|Reverse(p)| p.deadline <= now) {
                    if let Some(Reverse(due)) = queue.pop() {
                        owner.expire(&due.key, due.id, &due.cancelled);
                    }
                }
                // Drop cancelled timers so the queue does not grow with churn.
                if queue.len() > 64 {
                    queue.retain(|Reverse(p)| !p.cancelled.load(Ordering::SeqCst));
                }
            }
        }
    }
    trace!("Eviction worker stopped ({} timers pending)", queue.len());
}
