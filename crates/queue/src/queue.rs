use std::collections::{BTreeMap, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use metrics::{counter, gauge};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Keys the queue can hold.
pub trait QueueKey: Clone + Eq + Hash + Send + Sync + std::fmt::Debug + 'static {}

impl<T> QueueKey for T where T: Clone + Eq + Hash + Send + Sync + std::fmt::Debug + 'static {}

struct State<K> {
    /// Ready-to-process keys, each at most once.
    fifo: VecDeque<K>,
    queued: FxHashSet<K>,
    /// Checked out by a worker; never also in `queued`.
    processing: FxHashSet<K>,
    /// Re-added while processing; goes back to the FIFO on `done`.
    redo: FxHashSet<K>,
    retries: FxHashMap<K, u32>,
}

struct Shared<K> {
    name: String,
    state: Mutex<State<K>>,
    notify: Notify,
    shutdown: CancellationToken,
    delay_tx: mpsc::UnboundedSender<(K, Instant)>,
}

impl<K: QueueKey> Shared<K> {
    fn lock(&self) -> MutexGuard<'_, State<K>> {
        // No code path panics while holding the lock.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn add(&self, key: K) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let depth = {
            let mut st = self.lock();
            if st.processing.contains(&key) {
                st.redo.insert(key);
                return;
            }
            if !st.queued.insert(key.clone()) {
                return;
            }
            st.fifo.push_back(key);
            st.fifo.len()
        };
        counter!("workqueue_adds_total", 1, "queue" => self.name.clone());
        gauge!("workqueue_depth", depth as f64, "queue" => self.name.clone());
        self.notify.notify_one();
    }
}

/// Deduplicating FIFO of keys with at-most-one-worker-per-key checkout.
///
/// Cloning yields another handle onto the same queue. Construction spawns the
/// delayed-redelivery task, so it must happen inside a Tokio runtime.
pub struct WorkQueue<K> {
    shared: Arc<Shared<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self { Self { shared: Arc::clone(&self.shared) } }
}

impl<K: QueueKey> WorkQueue<K> {
    pub fn new(name: &str) -> Self { Self::with_shutdown(name, CancellationToken::new()) }

    /// Queue that also shuts down when `shutdown` is cancelled.
    pub fn with_shutdown(name: &str, shutdown: CancellationToken) -> Self {
        let (delay_tx, delay_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            name: name.to_string(),
            state: Mutex::new(State {
                fifo: VecDeque::new(),
                queued: FxHashSet::default(),
                processing: FxHashSet::default(),
                redo: FxHashSet::default(),
                retries: FxHashMap::default(),
            }),
            notify: Notify::new(),
            shutdown: shutdown.clone(),
            delay_tx,
        });
        tokio::spawn(run_delay_loop(Arc::downgrade(&shared), delay_rx, shutdown));
        Self { shared }
    }

    pub fn name(&self) -> &str { &self.shared.name }

    /// Mark `key` as needing work. Coalesces with a pending entry; if the key
    /// is checked out it is re-queued once on `done`. Ignored after shutdown.
    pub fn add(&self, key: K) { self.shared.add(key) }

    /// `add` once `delay` has elapsed. A key already waiting keeps the earlier deadline.
    pub fn add_after(&self, key: K, delay: Duration) {
        if self.shared.shutdown.is_cancelled() {
            return;
        }
        if delay.is_zero() {
            self.add(key);
            return;
        }
        if let Err(mpsc::error::SendError((key, _))) = self.shared.delay_tx.send((key, Instant::now() + delay)) {
            warn!(queue = %self.shared.name, ?key, "delay loop gone; dropping delayed add");
        }
    }

    /// Record one more retry for `key` and schedule it after `delay`.
    /// Returns the retry count after incrementing.
    pub fn requeue_after(&self, key: K, delay: Duration) -> u32 {
        let count = {
            let mut st = self.shared.lock();
            let n = st.retries.entry(key.clone()).or_insert(0);
            *n = n.saturating_add(1);
            *n
        };
        counter!("workqueue_retries_total", 1, "queue" => self.shared.name.clone());
        self.add_after(key, delay);
        count
    }

    /// Wait for the next key and check it out. `None` once the queue is shut
    /// down and the FIFO has drained.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.shared.lock();
                if let Some(key) = st.fifo.pop_front() {
                    st.queued.remove(&key);
                    st.processing.insert(key.clone());
                    let depth = st.fifo.len();
                    drop(st);
                    gauge!("workqueue_depth", depth as f64, "queue" => self.shared.name.clone());
                    if depth > 0 {
                        // Pass the wakeup on so idle workers don't sleep on a non-empty FIFO.
                        self.shared.notify.notify_one();
                    }
                    return Some(key);
                }
            }
            if self.shared.shutdown.is_cancelled() {
                return None;
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = self.shared.shutdown.cancelled() => {}
            }
        }
    }

    /// Like `get`, but the returned guard calls `done` when dropped.
    pub async fn checkout(&self) -> Option<Checkout<K>> {
        let key = self.get().await?;
        Some(Checkout { queue: self.clone(), key })
    }

    /// Release a key obtained from `get`. Must be called exactly once per `get`.
    pub fn done(&self, key: &K) {
        let requeued = {
            let mut st = self.shared.lock();
            if !st.processing.remove(key) {
                debug!(queue = %self.shared.name, ?key, "done for key not in processing set");
                return;
            }
            if st.redo.remove(key) && st.queued.insert(key.clone()) {
                st.fifo.push_back(key.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.shared.notify.notify_one();
        }
    }

    /// Clear retry history for `key`. Queue membership is untouched.
    pub fn forget(&self, key: &K) { self.shared.lock().retries.remove(key); }

    pub fn num_requeues(&self, key: &K) -> u32 {
        self.shared.lock().retries.get(key).copied().unwrap_or(0)
    }

    /// Keys waiting in the FIFO.
    pub fn len(&self) -> usize { self.shared.lock().fifo.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn processing_len(&self) -> usize { self.shared.lock().processing.len() }

    /// Stop accepting adds and wake every blocked `get`. Idempotent.
    pub fn shut_down(&self) {
        if !self.shared.shutdown.is_cancelled() {
            debug!(queue = %self.shared.name, "work queue shutting down");
        }
        self.shared.shutdown.cancel();
        self.shared.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool { self.shared.shutdown.is_cancelled() }
}

/// A checked-out key. Dropping it calls `done`, whatever the exit path.
pub struct Checkout<K: QueueKey> {
    queue: WorkQueue<K>,
    key: K,
}

impl<K: QueueKey> Checkout<K> {
    pub fn key(&self) -> &K { &self.key }

    pub fn queue(&self) -> &WorkQueue<K> { &self.queue }
}

impl<K: QueueKey> Drop for Checkout<K> {
    fn drop(&mut self) { self.queue.done(&self.key); }
}

async fn run_delay_loop<K: QueueKey>(
    shared: Weak<Shared<K>>,
    mut rx: mpsc::UnboundedReceiver<(K, Instant)>,
    shutdown: CancellationToken,
) {
    // Deadline-ordered; `seq` keeps entries with equal deadlines distinct.
    let mut waiting: BTreeMap<(Instant, u64), K> = BTreeMap::new();
    let mut deadlines: FxHashMap<K, (Instant, u64)> = FxHashMap::default();
    let mut seq = 0u64;
    loop {
        let next = waiting.keys().next().map(|(at, _)| *at);
        tokio::select! {
            _ = shutdown.cancelled() => break,
            msg = rx.recv() => {
                let Some((key, at)) = msg else { break };
                if let Some(&slot) = deadlines.get(&key) {
                    if slot.0 <= at {
                        continue;
                    }
                    waiting.remove(&slot);
                }
                seq = seq.wrapping_add(1);
                waiting.insert((at, seq), key.clone());
                deadlines.insert(key, (at, seq));
            }
            _ = tokio::time::sleep_until(next.unwrap_or_else(Instant::now)), if next.is_some() => {
                let Some(shared) = shared.upgrade() else { break };
                let now = Instant::now();
                while let Some(entry) = waiting.first_entry() {
                    if entry.key().0 > now {
                        break;
                    }
                    let key = entry.remove();
                    deadlines.remove(&key);
                    shared.add(key);
                }
            }
        }
    }
    if !waiting.is_empty() {
        debug!(dropped = waiting.len(), "delay loop stopped with keys still waiting");
    }
}
