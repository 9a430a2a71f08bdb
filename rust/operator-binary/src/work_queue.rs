//! Per-resource work queue.
//!
//! A key is held at most once: while it waits, further requests for it coalesce into the waiting
//! entry; while it is processed, they are remembered as a single follow-up pass that is queued
//! once the current pass is [`done`](WorkQueue::done). Two passes for the same key therefore
//! never run at the same time.

use std::{
    collections::{HashMap, VecDeque},
    fmt::Display,
    future::Future,
    hash::Hash,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use tokio::{sync::Notify, task::JoinSet};

/// Identifies the resource a task is about.
pub trait QueueKey: Clone + Eq + Hash + Display + Send + Sync + 'static {}

impl<K: Clone + Eq + Hash + Display + Send + Sync + 'static> QueueKey for K {}

/// A request to reconcile one resource.
#[derive(Clone, Debug)]
pub struct Task<K> {
    pub key: K,
    pub reason: String,
    /// Increases with every task accepted by the queue, across all keys.
    pub id: u64,
    pub enqueued_at: Instant,
}

#[cfg(test)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KeyState {
    Idle,
    Queued,
    Processing,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EnqueueOutcome {
    /// The key was idle and is now waiting.
    Queued,
    /// The key was already waiting, or already has a follow-up pass.
    Coalesced,
    /// The key is being processed; a follow-up pass will be queued when it is done.
    Deferred,
    /// The queue is full.
    Dropped,
    Closed,
}

enum Entry<K> {
    Queued(Task<K>),
    Processing { follow_up: Option<Task<K>> },
}

struct Inner<K> {
    order: VecDeque<K>,
    entries: HashMap<K, Entry<K>>,
    closed: bool,
}

pub struct WorkQueue<K> {
    name: String,
    capacity: usize,
    next_id: AtomicU64,
    inner: Mutex<Inner<K>>,
    notify: Notify,
}

impl<K: QueueKey> WorkQueue<K> {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            capacity,
            next_id: AtomicU64::new(1),
            inner: Mutex::new(Inner {
                order: VecDeque::new(),
                entries: HashMap::new(),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn enqueue(&self, key: K, reason: impl Into<String>) -> EnqueueOutcome {
        let reason = reason.into();
        let mut guard = self.lock();
        let inner = &mut *guard;
        if inner.closed {
            return EnqueueOutcome::Closed;
        }

        let outcome = match inner.entries.get_mut(&key) {
            Some(Entry::Queued(_)) | Some(Entry::Processing { follow_up: Some(_) }) => {
                EnqueueOutcome::Coalesced
            }
            Some(Entry::Processing { follow_up }) => {
                *follow_up = Some(self.task(key.clone(), reason.clone()));
                EnqueueOutcome::Deferred
            }
            None if inner.order.len() >= self.capacity => EnqueueOutcome::Dropped,
            None => {
                let task = self.task(key.clone(), reason.clone());
                inner.entries.insert(key.clone(), Entry::Queued(task));
                inner.order.push_back(key.clone());
                EnqueueOutcome::Queued
            }
        };
        drop(guard);

        match outcome {
            EnqueueOutcome::Queued => self.notify.notify_one(),
            EnqueueOutcome::Dropped => tracing::warn!(
                queue = %self.name,
                key = %key,
                reason = %reason,
                capacity = self.capacity,
                "work queue is full, dropping request"
            ),
            _ => tracing::trace!(
                queue = %self.name,
                key = %key,
                reason = %reason,
                ?outcome,
                "coalesced request"
            ),
        }
        outcome
    }

    /// Enqueues `key` once `delay` has passed.
    pub fn enqueue_after(
        self: &Arc<Self>,
        key: K,
        reason: impl Into<String>,
        delay: Duration,
    ) {
        let queue = Arc::clone(self);
        let reason = reason.into();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.enqueue(key, reason);
        });
    }

    /// Waits for the next task. Returns `None` once the queue is closed.
    pub async fn next(&self) -> Option<Task<K>> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register interest before checking, so that no wakeup is lost in between
            notified.as_mut().enable();

            {
                let mut inner = self.lock();
                if inner.closed {
                    return None;
                }
                while let Some(key) = inner.order.pop_front() {
                    if let Some(entry) = inner.entries.get_mut(&key) {
                        if let Entry::Queued(task) =
                            std::mem::replace(entry, Entry::Processing { follow_up: None })
                        {
                            return Some(task);
                        }
                    }
                }
            }

            notified.await;
        }
    }

    /// Marks the pass for `key` as finished, queueing its follow-up pass if one was requested.
    pub fn done(&self, key: &K) {
        let mut inner = self.lock();
        match inner.entries.remove(key) {
            Some(Entry::Processing {
                follow_up: Some(task),
            }) if !inner.closed => {
                // accepted while processing, so it may exceed the capacity
                inner.entries.insert(key.clone(), Entry::Queued(task));
                inner.order.push_back(key.clone());
                drop(inner);
                self.notify.notify_one();
            }
            Some(Entry::Queued(task)) => {
                // not taken yet, leave it waiting
                inner.entries.insert(key.clone(), Entry::Queued(task));
            }
            _ => {}
        }
    }

    #[cfg(test)]
    pub fn state(&self, key: &K) -> KeyState {
        match self.lock().entries.get(key) {
            None => KeyState::Idle,
            Some(Entry::Queued(_)) => KeyState::Queued,
            Some(Entry::Processing { .. }) => KeyState::Processing,
        }
    }

    /// Number of waiting keys.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    /// Stops handing out tasks and rejects new requests. Tasks in flight may still call
    /// [`done`](Self::done).
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    fn task(&self, key: K, reason: String) -> Task<K> {
        Task {
            key,
            reason,
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            enqueued_at: Instant::now(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<K>> {
        // the guarded state stays consistent even if a holder panicked
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Takes tasks from `queue` with `workers` concurrent workers until the queue is closed.
///
/// `reconcile` returns when the key should be looked at again. A zero delay re-queues the key as
/// soon as its pass is done.
pub async fn run_workers<K, F, Fut>(queue: Arc<WorkQueue<K>>, workers: usize, reconcile: F)
where
    K: QueueKey,
    F: Fn(Task<K>) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = Option<Duration>> + Send + 'static,
{
    let mut running = JoinSet::new();
    for worker in 0..workers {
        let queue = Arc::clone(&queue);
        let reconcile = reconcile.clone();
        running.spawn(async move {
            while let Some(task) = queue.next().await {
                let key = task.key.clone();
                let requeue = reconcile(task).await;
                queue.done(&key);
                match requeue {
                    Some(delay) if delay.is_zero() => {
                        queue.enqueue(key, "retry after conflict");
                    }
                    Some(delay) => queue.enqueue_after(key, "retry after failure", delay),
                    None => {}
                }
            }
            tracing::debug!(queue = %queue.name(), worker, "worker stopped");
        });
    }

    while let Some(result) = running.join_next().await {
        if let Err(err) = result {
            tracing::error!(queue = %queue.name(), error = %err, "worker failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> String {
        format!("default/{name}")
    }

    #[tokio::test]
    async fn test_requests_coalesce_while_queued() {
        let queue = WorkQueue::<String>::new("test", 10);
        assert_eq!(queue.enqueue(key("a"), "first"), EnqueueOutcome::Queued);
        assert_eq!(queue.enqueue(key("a"), "second"), EnqueueOutcome::Coalesced);
        assert_eq!(queue.enqueue(key("b"), "first"), EnqueueOutcome::Queued);
        assert_eq!(queue.len(), 2);

        let task = queue.next().await.unwrap();
        assert_eq!(task.key, key("a"));
        assert_eq!(task.reason, "first");
        assert_eq!(queue.next().await.unwrap().key, key("b"));
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test]
    async fn test_requests_during_processing_run_once_afterwards() {
        let queue = WorkQueue::<String>::new("test", 10);
        queue.enqueue(key("a"), "create");
        let first = queue.next().await.unwrap();
        assert_eq!(queue.state(&key("a")), KeyState::Processing);

        assert_eq!(queue.enqueue(key("a"), "update"), EnqueueOutcome::Deferred);
        assert_eq!(queue.enqueue(key("a"), "update again"), EnqueueOutcome::Coalesced);
        // no second pass while the first is still running
        assert_eq!(queue.len(), 0);

        queue.done(&first.key);
        assert_eq!(queue.state(&key("a")), KeyState::Queued);
        let second = queue.next().await.unwrap();
        assert_eq!(second.reason, "update");
        assert!(second.id > first.id);

        queue.done(&second.key);
        assert_eq!(queue.state(&key("a")), KeyState::Idle);
    }

    #[tokio::test]
    async fn test_full_queue_drops_new_keys() {
        let queue = WorkQueue::<String>::new("test", 2);
        assert_eq!(queue.enqueue(key("a"), "r"), EnqueueOutcome::Queued);
        assert_eq!(queue.enqueue(key("b"), "r"), EnqueueOutcome::Queued);
        assert_eq!(queue.enqueue(key("c"), "r"), EnqueueOutcome::Dropped);
        // known keys still coalesce
        assert_eq!(queue.enqueue(key("a"), "r"), EnqueueOutcome::Coalesced);
        assert_eq!(queue.state(&key("c")), KeyState::Idle);
    }

    #[tokio::test]
    async fn test_waiting_worker_is_woken() {
        let queue = Arc::new(WorkQueue::<String>::new("test", 10));
        let worker = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.next().await })
        };
        tokio::task::yield_now().await;
        queue.enqueue(key("a"), "late");

        let task = tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(task.key, key("a"));
    }

    #[tokio::test]
    async fn test_enqueue_after_delay() {
        let queue = Arc::new(WorkQueue::<String>::new("test", 10));
        queue.enqueue_after(key("a"), "retry", Duration::from_millis(20));
        assert_eq!(queue.state(&key("a")), KeyState::Idle);

        let task = tokio::time::timeout(Duration::from_secs(5), queue.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.reason, "retry");
    }

    #[tokio::test]
    async fn test_close_releases_workers() {
        let queue = Arc::new(WorkQueue::<String>::new("test", 10));
        let worker = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.next().await })
        };
        tokio::task::yield_now().await;
        queue.close();

        let next = tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .unwrap()
            .unwrap();
        assert!(next.is_none());
        assert_eq!(queue.enqueue(key("a"), "r"), EnqueueOutcome::Closed);
    }

    #[tokio::test]
    async fn test_workers_retry_until_done() {
        let queue = Arc::new(WorkQueue::<String>::new("test", 10));
        let passes = Arc::new(AtomicU64::new(0));
        let workers = {
            let passes = Arc::clone(&passes);
            tokio::spawn(run_workers(Arc::clone(&queue), 2, move |_task| {
                let passes = Arc::clone(&passes);
                async move {
                    // fails twice, once with a conflict
                    match passes.fetch_add(1, Ordering::SeqCst) {
                        0 => Some(Duration::ZERO),
                        1 => Some(Duration::from_millis(5)),
                        _ => None,
                    }
                }
            }))
        };
        queue.enqueue(key("a"), "test");

        tokio::time::timeout(Duration::from_secs(5), async {
            while passes.load(Ordering::SeqCst) < 3 || queue.state(&key("a")) != KeyState::Idle {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        queue.close();
        tokio::time::timeout(Duration::from_secs(5), workers)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(passes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_triggers_during_a_running_pass_cause_one_follow_up() {
        let queue = Arc::new(WorkQueue::<String>::new("test", 10));
        let passes = Arc::new(AtomicU64::new(0));
        let release = Arc::new(Notify::new());
        let workers = {
            let passes = Arc::clone(&passes);
            let release = Arc::clone(&release);
            tokio::spawn(run_workers(Arc::clone(&queue), 4, move |_task| {
                let passes = Arc::clone(&passes);
                let release = Arc::clone(&release);
                async move {
                    if passes.fetch_add(1, Ordering::SeqCst) == 0 {
                        release.notified().await;
                    }
                    None
                }
            }))
        };
        queue.enqueue(key("a"), "created");
        tokio::time::timeout(Duration::from_secs(5), async {
            while passes.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(queue.enqueue(key("a"), "edit 0"), EnqueueOutcome::Deferred);
        for i in 1..10 {
            assert_eq!(
                queue.enqueue(key("a"), format!("edit {i}")),
                EnqueueOutcome::Coalesced
            );
        }
        // idle workers must not pick up the key while its pass runs
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(passes.load(Ordering::SeqCst), 1);

        release.notify_one();
        tokio::time::timeout(Duration::from_secs(5), async {
            while passes.load(Ordering::SeqCst) < 2 || queue.state(&key("a")) != KeyState::Idle {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(passes.load(Ordering::SeqCst), 2);

        queue.close();
        tokio::time::timeout(Duration::from_secs(5), workers)
            .await
            .unwrap()
            .unwrap();
    }
}
