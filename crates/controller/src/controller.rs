use std::sync::Arc;

use reflex_core::{ListOptions, ListWatcher, ObjectKey};
use reflex_queue::{RateLimiter, WorkQueue};
use reflex_store::{Cache, Reflector};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::worker::Worker;
use crate::{ControllerConfig, ControllerEvent, Error, EventSink, Reconcile, Result, TracingSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControllerState {
    Created,
    /// Reflector running, waiting for the first list.
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Reflector -> work queue -> worker pool around one [`Reconcile`].
///
/// Every change the reflector applies marks its key dirty in the queue;
/// workers check keys out one at a time, read the cached object and call the
/// reconciler, retrying failures through the rate limiter until
/// `max_retries` is exhausted.
pub struct Controller<L: ListWatcher, R> {
    config: ControllerConfig,
    reflector: Option<Reflector<L>>,
    cache: Cache<L::Object>,
    queue: WorkQueue<ObjectKey>,
    reconciler: Arc<R>,
    limiter: Arc<dyn RateLimiter<ObjectKey>>,
    sink: Arc<dyn EventSink>,
    shutdown: CancellationToken,
    state: watch::Sender<ControllerState>,
    reflector_task: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl<L, R> Controller<L, R>
where
    L: ListWatcher,
    R: Reconcile<L::Object>,
{
    /// Must be called inside a Tokio runtime.
    pub fn new(lw: L, options: ListOptions, reconciler: R, config: ControllerConfig) -> Self {
        let shutdown = CancellationToken::new();
        let reflector = Reflector::new(lw, options, config.reflector.clone());
        let cache = reflector.cache();
        let queue = WorkQueue::with_shutdown(&config.name, shutdown.clone());
        cache.add_observer(Arc::new(queue.clone()));
        let limiter: Arc<dyn RateLimiter<ObjectKey>> = Arc::new(config.rate_limiter());
        let (state, _) = watch::channel(ControllerState::Created);
        Self {
            config,
            reflector: Some(reflector),
            cache,
            queue,
            reconciler: Arc::new(reconciler),
            limiter,
            sink: Arc::new(TracingSink),
            shutdown,
            state,
            reflector_task: None,
            workers: Vec::new(),
        }
    }

    pub fn with_sink<S: EventSink + 'static>(mut self, sink: S) -> Self {
        self.sink = Arc::new(sink);
        self
    }

    pub fn with_rate_limiter<Q: RateLimiter<ObjectKey> + 'static>(mut self, limiter: Q) -> Self {
        self.limiter = Arc::new(limiter);
        self
    }

    pub fn cache(&self) -> &Cache<L::Object> { &self.cache }

    pub fn queue(&self) -> &WorkQueue<ObjectKey> { &self.queue }

    pub fn config(&self) -> &ControllerConfig { &self.config }

    pub fn state(&self) -> ControllerState { *self.state.borrow() }

    pub fn subscribe_state(&self) -> watch::Receiver<ControllerState> { self.state.subscribe() }

    /// Cancelling this token stops the reflector and the queue; `stop` still
    /// has to be called to join the tasks.
    pub fn shutdown_token(&self) -> CancellationToken { self.shutdown.clone() }

    /// Start the reflector, wait for the cache to sync, then start the
    /// workers. On sync timeout everything started so far is stopped.
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != ControllerState::Created {
            return Err(Error::AlreadyStarted);
        }
        let Some(reflector) = self.reflector.take() else {
            return Err(Error::AlreadyStarted);
        };
        self.state.send_replace(ControllerState::Starting);
        info!(controller = %self.config.name, workers = self.config.workers, "starting controller");
        self.reflector_task = Some(tokio::spawn(reflector.run(self.shutdown.clone())));

        let timeout = self.config.cache_sync_timeout;
        if !self.cache.wait_for_cache_sync(timeout, &self.shutdown).await {
            let cancelled = self.shutdown.is_cancelled();
            self.stop().await?;
            if cancelled {
                return Ok(());
            }
            warn!(controller = %self.config.name, ?timeout, "cache did not sync");
            return Err(Error::CacheSyncTimeout(timeout));
        }
        self.sink.emit(ControllerEvent::CacheSynced);

        for id in 0..self.config.workers.max(1) {
            let worker = Worker {
                id,
                name: self.config.name.clone(),
                queue: self.queue.clone(),
                store: self.cache.store().clone(),
                reconciler: Arc::clone(&self.reconciler),
                limiter: Arc::clone(&self.limiter),
                sink: Arc::clone(&self.sink),
                max_retries: self.config.max_retries,
            };
            self.workers.push(tokio::spawn(worker.run()));
        }
        self.state.send_replace(ControllerState::Running);
        Ok(())
    }

    /// Stop intake, let workers finish their current keys and drain the
    /// queue, then join every task. Delayed retries still waiting are
    /// dropped. Calling it again is a no-op.
    pub async fn stop(&mut self) -> Result<()> {
        match self.state() {
            ControllerState::Stopped => return Ok(()),
            ControllerState::Created => {
                self.shutdown.cancel();
                self.queue.shut_down();
                self.state.send_replace(ControllerState::Stopped);
                return Ok(());
            }
            _ => {}
        }
        self.state.send_replace(ControllerState::Stopping);
        self.shutdown.cancel();
        self.queue.shut_down();

        let mut first_err = None;
        for handle in self.workers.drain(..) {
            if let Err(e) = handle.await {
                warn!(controller = %self.config.name, error = %e, "worker task failed");
                first_err.get_or_insert(e);
            }
        }
        if let Some(handle) = self.reflector_task.take() {
            if let Err(e) = handle.await {
                warn!(controller = %self.config.name, error = %e, "reflector task failed");
                first_err.get_or_insert(e);
            }
        }
        self.state.send_replace(ControllerState::Stopped);
        self.sink.emit(ControllerEvent::ShutdownComplete);
        info!(controller = %self.config.name, "controller stopped");
        match first_err {
            Some(e) => Err(Error::Join(e)),
            None => Ok(()),
        }
    }

    /// `start`, run until `shutdown` (or the controller's own token) is
    /// cancelled, then `stop`.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        let own = self.shutdown.clone();
        let link = tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => own.cancel(),
                _ = own.cancelled() => {}
            }
        });
        let started = self.start().await;
        if started.is_ok() {
            self.shutdown.cancelled().await;
        }
        let stopped = self.stop().await;
        link.abort();
        started.and(stopped)
    }
}

impl<L: ListWatcher, R> Drop for Controller<L, R> {
    fn drop(&mut self) { self.shutdown.cancel(); }
}
