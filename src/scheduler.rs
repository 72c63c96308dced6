//! Priority queue, dedup, and bounded-concurrency admission (spec.md
//! §4.E). Grounded in the teacher's `prioritization.rs` (priority-ordered
//! admission) and `deduplication.rs` (fingerprint-keyed inflight
//! tracking), reworked from Bevy systems polling every tick into an
//! event-driven `tokio::sync::Notify` wakeup, per spec.md §4.E
//! "admission must not busy-poll".

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify, Semaphore};
use uuid::Uuid;

use crate::fingerprint::Fingerprint;
use crate::priority::Priority;
use crate::transport::CancelToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Enqueued,
    DedupAttached,
    Admitted,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

struct HeapItem {
    priority: Priority,
    enqueued_at: Instant,
    sequence: u64,
    id: Uuid,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for HeapItem {}

impl Ord for HeapItem {
    /// Reversed so `BinaryHeap` (a max-heap) pops the smallest `Priority`
    /// value (most urgent) and, among ties, the earliest `enqueued_at`
    /// first (spec.md §4.E ordering rule).
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.enqueued_at.cmp(&self.enqueued_at))
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct EntryHandle {
    state: Mutex<QueueState>,
    cancel: CancelToken,
    priority: Priority,
    enqueued_at: Instant,
}

/// Handle returned by `enqueue`, held by the caller for the lifetime of
/// the request (spec.md §4.E `QueueEntry`).
pub struct QueueEntry {
    pub id: Uuid,
    scheduler: Arc<SchedulerInner>,
    /// `Some` once admitted; releases the concurrency slot on drop unless
    /// it was a critical-priority bypass (`None` permit with `bypassed`
    /// set).
    permit: Option<tokio::sync::OwnedSemaphorePermit>,
    bypassed: bool,
}

impl QueueEntry {
    pub fn cancel(&self) {
        Scheduler(self.scheduler.clone()).cancel(self.id);
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.scheduler
            .entries
            .get(&self.id)
            .map(|e| e.cancel.clone())
            .unwrap_or_default()
    }

    pub fn state(&self) -> QueueState {
        self.scheduler
            .entries
            .get(&self.id)
            .map(|e| *e.state.lock())
            .unwrap_or(QueueState::Cancelled)
    }

    pub fn mark_completed(&self) {
        Scheduler(self.scheduler.clone()).set_state(self.id, QueueState::Completed);
    }

    pub fn mark_failed(&self) {
        Scheduler(self.scheduler.clone()).set_state(self.id, QueueState::Failed);
    }
}

impl Drop for QueueEntry {
    fn drop(&mut self) {
        self.scheduler.entries.remove(&self.id);
        // Release the permit (if any) before waking other waiters, so a
        // woken task's `try_acquire_owned` is guaranteed to see it.
        let had_permit = self.permit.take().is_some();
        if had_permit || self.bypassed {
            self.scheduler.admitted.fetch_sub(1, AtomicOrdering::Relaxed);
            self.scheduler.notify.notify_waiters();
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueStatus {
    pub queued: usize,
    pub admitted: usize,
    pub concurrency_limit: usize,
    pub inflight_fingerprints: usize,
}

struct SchedulerInner {
    heap: Mutex<BinaryHeap<HeapItem>>,
    entries: DashMap<Uuid, EntryHandle>,
    notify: Notify,
    semaphore: Arc<Semaphore>,
    concurrency_limit: AtomicUsize,
    admitted: AtomicUsize,
    sequence: AtomicU64,
    dedup: DashMap<Fingerprint, Vec<oneshot::Sender<()>>>,
    request_ceiling: Duration,
    sweeper: Mutex<Option<tokio::task::JoinHandle<()>>>,
    shutdown: AtomicBool,
}

/// Public facade (spec.md §4.E).
#[derive(Clone)]
pub struct Scheduler(Arc<SchedulerInner>);

impl Scheduler {
    pub fn new(concurrency_limit: usize, request_ceiling: Duration) -> Self {
        Self(Arc::new(SchedulerInner {
            heap: Mutex::new(BinaryHeap::new()),
            entries: DashMap::new(),
            notify: Notify::new(),
            semaphore: Arc::new(Semaphore::new(concurrency_limit)),
            concurrency_limit: AtomicUsize::new(concurrency_limit),
            admitted: AtomicUsize::new(0),
            sequence: AtomicU64::new(0),
            dedup: DashMap::new(),
            request_ceiling,
            sweeper: Mutex::new(None),
            shutdown: AtomicBool::new(false),
        }))
    }

    /// `adjustConcurrencyLimit(n)` (spec.md §4.E "dynamic policy"). Only
    /// grows the semaphore; shrinking would require forcibly revoking
    /// outstanding permits, which spec.md leaves unspecified — DESIGN.md
    /// records this as a deliberate Open Question resolution.
    pub fn adjust_concurrency_limit(&self, new_limit: usize) {
        let current = self.0.concurrency_limit.load(AtomicOrdering::Relaxed);
        if new_limit > current {
            self.0.semaphore.add_permits(new_limit - current);
        }
        self.0.concurrency_limit.store(new_limit, AtomicOrdering::Relaxed);
    }

    /// Attaches the caller to an already in-flight request with the same
    /// fingerprint instead of scheduling a new one, returning `true` on
    /// attach (spec.md §4.E "dedup").
    pub fn try_attach_dedup(&self, fingerprint: Fingerprint) -> Option<oneshot::Receiver<()>> {
        let mut entry = self.0.dedup.get_mut(&fingerprint)?;
        let (tx, rx) = oneshot::channel();
        entry.push(tx);
        Some(rx)
    }

    pub fn begin_dedup_group(&self, fingerprint: Fingerprint) {
        self.0.dedup.entry(fingerprint).or_default();
    }

    /// Wakes every waiter attached to `fingerprint` and closes the group
    /// (spec.md §4.E "exactly-once waiter completion").
    pub fn resolve_dedup_group(&self, fingerprint: Fingerprint) {
        if let Some((_, waiters)) = self.0.dedup.remove(&fingerprint) {
            for tx in waiters {
                let _ = tx.send(());
            }
        }
    }

    /// Enqueues and blocks until admitted or cancelled. Critical-priority
    /// requests bypass the concurrency cap entirely (spec.md §4.E
    /// "critical bypass").
    pub async fn enqueue(&self, priority: Priority) -> QueueEntry {
        self.enqueue_with_token(priority, CancelToken::new()).await
    }

    /// Like `enqueue`, but the caller supplies the `CancelToken` up front,
    /// so cancelling it takes effect even before the entry is admitted
    /// (spec.md §6 `cancel`).
    pub async fn enqueue_with_token(&self, priority: Priority, cancel: CancelToken) -> QueueEntry {
        let id = Uuid::new_v4();
        self.0.entries.insert(
            id,
            EntryHandle {
                state: Mutex::new(QueueState::Enqueued),
                cancel: cancel.clone(),
                priority,
                enqueued_at: Instant::now(),
            },
        );

        if priority == Priority::Critical {
            self.0.admitted.fetch_add(1, AtomicOrdering::Relaxed);
            self.set_state(id, QueueState::Admitted);
            return QueueEntry {
                id,
                scheduler: self.0.clone(),
                permit: None,
                bypassed: true,
            };
        }

        let sequence = self.0.sequence.fetch_add(1, AtomicOrdering::Relaxed);
        {
            let mut heap = self.0.heap.lock();
            heap.push(HeapItem {
                priority,
                enqueued_at: Instant::now(),
                sequence,
                id,
            });
        }
        self.0.notify.notify_waiters();

        loop {
            let current_state = self.0.entries.get(&id).map(|e| *e.state.lock());
            if matches!(current_state, Some(QueueState::Cancelled) | Some(QueueState::TimedOut)) {
                let mut heap = self.0.heap.lock();
                heap.retain(|item| item.id != id);
                return QueueEntry {
                    id,
                    scheduler: self.0.clone(),
                    permit: None,
                    bypassed: false,
                };
            }
            if cancel.is_cancelled() {
                self.set_state(id, QueueState::Cancelled);
                let mut heap = self.0.heap.lock();
                heap.retain(|item| item.id != id);
                return QueueEntry {
                    id,
                    scheduler: self.0.clone(),
                    permit: None,
                    bypassed: false,
                };
            }

            let is_front = {
                let heap = self.0.heap.lock();
                heap.peek().map(|top| top.id) == Some(id)
            };

            if is_front {
                if let Ok(permit) = self.0.semaphore.clone().try_acquire_owned() {
                    let mut heap = self.0.heap.lock();
                    if heap.peek().map(|top| top.id) == Some(id) {
                        heap.pop();
                        drop(heap);
                        self.0.admitted.fetch_add(1, AtomicOrdering::Relaxed);
                        self.set_state(id, QueueState::Admitted);
                        return QueueEntry {
                            id,
                            scheduler: self.0.clone(),
                            permit: Some(permit),
                            bypassed: false,
                        };
                    }
                }
            }

            // Races against a short poll so an externally cancelled token
            // (never routed through `cancel()`/`sweep_expired`, which both
            // call `notify_waiters`) is still noticed promptly.
            tokio::select! {
                _ = self.0.notify.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(20)) => {}
            }
        }
    }

    pub fn cancel(&self, id: Uuid) {
        if let Some(entry) = self.0.entries.get(&id) {
            entry.cancel.cancel();
            *entry.state.lock() = QueueState::Cancelled;
        }
        self.0.notify.notify_waiters();
    }

    fn set_state(&self, id: Uuid, state: QueueState) {
        if let Some(entry) = self.0.entries.get(&id) {
            *entry.state.lock() = state;
        }
    }

    /// Sweeps entries older than the hard per-request ceiling, marking
    /// them `TimedOut` and cancelling their token (spec.md §4.E
    /// "staleness sweeper", ≤5s interval, default ceiling 10s).
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut expired = Vec::new();
        for entry in self.0.entries.iter() {
            if now.duration_since(entry.enqueued_at) >= self.0.request_ceiling {
                expired.push(*entry.key());
            }
        }
        for id in &expired {
            if let Some(entry) = self.0.entries.get(id) {
                *entry.state.lock() = QueueState::TimedOut;
                entry.cancel.cancel();
            }
        }
        if !expired.is_empty() {
            self.0.notify.notify_waiters();
        }
        expired.len()
    }

    /// Spawns the background sweeper task, storing its `JoinHandle` so
    /// `shutdown` can abort it later.
    pub fn spawn_sweeper(&self, interval: Duration) {
        let scheduler = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                scheduler.sweep_expired();
            }
        });
        *self.0.sweeper.lock() = Some(handle);
    }

    /// Idempotent shutdown (spec.md §5): aborts the sweeper and cancels
    /// every pending or admitted entry, waking anything still blocked in
    /// `enqueue`/`enqueue_with_token`. Calling it more than once is a no-op.
    pub fn shutdown(&self) {
        if self.0.shutdown.swap(true, AtomicOrdering::SeqCst) {
            return;
        }
        if let Some(handle) = self.0.sweeper.lock().take() {
            handle.abort();
        }
        for entry in self.0.entries.iter() {
            *entry.state.lock() = QueueState::Cancelled;
            entry.cancel.cancel();
        }
        self.0.notify.notify_waiters();
    }

    pub fn status(&self) -> QueueStatus {
        QueueStatus {
            queued: self.0.heap.lock().len(),
            admitted: self.0.admitted.load(AtomicOrdering::Relaxed),
            concurrency_limit: self.0.concurrency_limit.load(AtomicOrdering::Relaxed),
            inflight_fingerprints: self.0.dedup.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn admits_up_to_concurrency_limit() {
        let scheduler = Scheduler::new(1, Duration::from_secs(10));
        let first = scheduler.enqueue(Priority::Normal).await;
        assert_eq!(first.state(), QueueState::Admitted);

        let scheduler2 = scheduler.clone();
        let second_fut = tokio::spawn(async move { scheduler2.enqueue(Priority::Normal).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second_fut.is_finished());

        drop(first);
        let second = second_fut.await.unwrap();
        assert_eq!(second.state(), QueueState::Admitted);
    }

    #[tokio::test]
    async fn critical_bypasses_concurrency_limit() {
        let scheduler = Scheduler::new(1, Duration::from_secs(10));
        let _first = scheduler.enqueue(Priority::Normal).await;
        let second = scheduler.enqueue(Priority::Critical).await;
        assert_eq!(second.state(), QueueState::Admitted);
    }

    #[tokio::test]
    async fn dedup_waiter_is_resolved_exactly_once() {
        let scheduler = Scheduler::new(4, Duration::from_secs(10));
        let fp = Fingerprint(42);
        scheduler.begin_dedup_group(fp);
        let rx = scheduler.try_attach_dedup(fp).unwrap();
        scheduler.resolve_dedup_group(fp);
        assert!(rx.await.is_ok());
    }

    #[tokio::test]
    async fn sweeper_times_out_stale_entries() {
        let scheduler = Scheduler::new(0, Duration::from_millis(5));
        let scheduler2 = scheduler.clone();
        let pending = tokio::spawn(async move { scheduler2.enqueue(Priority::Normal).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        scheduler.sweep_expired();

        // The still-queued entry is cancelled by the sweep, so `enqueue`
        // returns immediately instead of waiting forever.
        let entry = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("enqueue should return once swept")
            .unwrap();
        assert_eq!(entry.state(), QueueState::TimedOut);
    }

    #[tokio::test]
    async fn shutdown_cancels_pending_entries_and_is_idempotent() {
        let scheduler = Scheduler::new(0, Duration::from_secs(10));
        let scheduler2 = scheduler.clone();
        let pending = tokio::spawn(async move { scheduler2.enqueue(Priority::Normal).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        scheduler.shutdown();
        scheduler.shutdown();

        let entry = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("enqueue should return once shut down")
            .unwrap();
        assert_eq!(entry.state(), QueueState::Cancelled);
    }

    #[tokio::test]
    async fn externally_cancelled_token_stops_enqueue_before_admission() {
        let scheduler = Scheduler::new(0, Duration::from_secs(10));
        let cancel = CancelToken::new();
        let scheduler2 = scheduler.clone();
        let cancel2 = cancel.clone();
        let pending =
            tokio::spawn(async move { scheduler2.enqueue_with_token(Priority::Normal, cancel2).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let entry = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("enqueue should return once the external token is cancelled")
            .unwrap();
        assert_eq!(entry.state(), QueueState::Cancelled);
    }
}
