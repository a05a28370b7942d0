use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use metrics::{counter, histogram};
use reflex_core::{Object, ObjectKey};
use reflex_queue::{RateLimiter, WorkQueue};
use reflex_store::Store;
use tracing::{debug, trace};

use crate::{ControllerEvent, EventSink, Reconcile, ReconcileError};

/// Everything a worker needs; cloned once per spawned worker.
pub(crate) struct Worker<T, R> {
    pub id: usize,
    pub name: String,
    pub queue: WorkQueue<ObjectKey>,
    pub store: Store<T>,
    pub reconciler: Arc<R>,
    pub limiter: Arc<dyn RateLimiter<ObjectKey>>,
    pub sink: Arc<dyn EventSink>,
    pub max_retries: u32,
}

impl<T: Object, R: Reconcile<T>> Worker<T, R> {
    /// Process keys until the queue shuts down and drains.
    pub async fn run(self) {
        debug!(controller = %self.name, worker = self.id, "worker started");
        while let Some(item) = self.queue.checkout().await {
            self.process(item.key()).await;
            // `item` drops here, marking the key done.
        }
        debug!(controller = %self.name, worker = self.id, "worker stopped");
    }

    async fn process(&self, key: &ObjectKey) {
        // Read at dequeue time so the sync sees the latest cached state.
        let object = self.store.get(key);
        trace!(worker = self.id, key = %key, exists = object.is_some(), "syncing");
        let started = Instant::now();
        let outcome = AssertUnwindSafe(self.reconciler.sync(key, object)).catch_unwind().await;
        let elapsed = started.elapsed();
        counter!("reconcile_total", 1, "controller" => self.name.clone());
        histogram!("reconcile_duration_ms", elapsed.as_secs_f64() * 1000.0, "controller" => self.name.clone());

        match outcome {
            Ok(Ok(())) => {
                self.queue.forget(key);
                self.limiter.forget(key);
                self.sink.emit(ControllerEvent::Synced { key: key.clone(), elapsed });
            }
            Ok(Err(e)) => self.handle_error(key, ReconcileError::Sync(e)),
            Err(payload) => {
                let error = ReconcileError::Panicked(panic_message(payload.as_ref()));
                self.give_up(key, self.queue.num_requeues(key).saturating_add(1), error);
            }
        }
    }

    fn handle_error(&self, key: &ObjectKey, error: ReconcileError) {
        counter!("reconcile_errors_total", 1, "controller" => self.name.clone());
        let retries = self.queue.num_requeues(key);
        if retries >= self.max_retries {
            self.give_up(key, retries.saturating_add(1), error);
            return;
        }
        let delay = self.limiter.next_delay(key, retries);
        let attempt = self.queue.requeue_after(key.clone(), delay);
        self.sink.emit(ControllerEvent::Retrying { key: key.clone(), attempt, delay, error: Arc::new(error) });
    }

    fn give_up(&self, key: &ObjectKey, attempts: u32, error: ReconcileError) {
        counter!("reconcile_giveups_total", 1, "controller" => self.name.clone());
        self.queue.forget(key);
        self.limiter.forget(key);
        self.sink.emit(ControllerEvent::GaveUp { key: key.clone(), attempts, error: Arc::new(error) });
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
