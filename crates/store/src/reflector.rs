use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::StreamExt;
use metrics::{counter, gauge};
use reflex_core::{ListOptions, ListWatcher, Object, ResourceVersion, WatchError, WatchEvent};
use reflex_queue::ExponentialBackoff;
use tokio::sync::watch;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{EventKind, Notification, Observer, Store};

type Observers<T> = Arc<ArcSwap<Vec<Arc<dyn Observer<T>>>>>;

#[derive(Debug, Clone)]
pub struct ReflectorConfig {
    /// Pause before every relist or watch reopen, doubling per consecutive failure.
    pub relist_backoff: ExponentialBackoff,
    /// Re-emit every cached object as `Modified` at this interval.
    pub resync_period: Option<Duration>,
    /// Reopen a cleanly closed watch from the last version instead of relisting.
    pub resume_watch_on_close: bool,
}

impl Default for ReflectorConfig {
    fn default() -> Self {
        Self {
            relist_backoff: ExponentialBackoff::new(Duration::from_millis(800), Duration::from_secs(30)),
            resync_period: None,
            resume_watch_on_close: false,
        }
    }
}

/// Read side of a reflector: the store, sync state and observer registration.
pub struct Cache<T> {
    store: Store<T>,
    observers: Observers<T>,
    synced: watch::Receiver<bool>,
}

impl<T> Clone for Cache<T> {
    fn clone(&self) -> Self {
        Self { store: self.store.clone(), observers: Arc::clone(&self.observers), synced: self.synced.clone() }
    }
}

impl<T: Object> Cache<T> {
    pub fn store(&self) -> &Store<T> { &self.store }

    /// True once the first list has been applied.
    pub fn has_synced(&self) -> bool { *self.synced.borrow() }

    /// Wait until the first list has been applied. `false` on timeout,
    /// cancellation, or if the reflector went away before syncing.
    pub async fn wait_for_cache_sync(&self, timeout: Duration, cancel: &CancellationToken) -> bool {
        let mut rx = self.synced.clone();
        let wait = async move {
            while !*rx.borrow_and_update() {
                if rx.changed().await.is_err() {
                    return *rx.borrow();
                }
            }
            true
        };
        tokio::select! {
            r = tokio::time::timeout(timeout, wait) => r.unwrap_or(false),
            _ = cancel.cancelled() => false,
        }
    }

    /// Register an observer. It first receives an `Added` for every object
    /// already cached; these replays may interleave with live events.
    pub fn add_observer(&self, observer: Arc<dyn Observer<T>>) {
        self.observers.rcu(|cur| {
            let mut next = Vec::with_capacity(cur.len() + 1);
            next.extend(cur.iter().cloned());
            next.push(Arc::clone(&observer));
            next
        });
        for object in self.store.list() {
            observer.on_event(&Notification { kind: EventKind::Added, key: object.key(), object });
        }
    }
}

/// Keeps a [`Store`] consistent with a remote collection: list, then watch
/// from the listed version, relisting with backoff whenever the watch ends.
/// Never gives up; failures are logged and retried until cancelled.
pub struct Reflector<L: ListWatcher> {
    lw: Arc<L>,
    options: ListOptions,
    config: ReflectorConfig,
    cache: Cache<L::Object>,
    synced_tx: watch::Sender<bool>,
    version: ResourceVersion,
}

impl<L: ListWatcher> Reflector<L> {
    pub fn new(lw: L, options: ListOptions, config: ReflectorConfig) -> Self {
        let (synced_tx, synced) = watch::channel(false);
        let cache = Cache { store: Store::new(), observers: Arc::new(ArcSwap::from_pointee(Vec::new())), synced };
        Self { lw: Arc::new(lw), options, config, cache, synced_tx, version: ResourceVersion::default() }
    }

    pub fn cache(&self) -> Cache<L::Object> { self.cache.clone() }

    /// Run until `shutdown` is cancelled.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut failures = 0u32;
        let mut relist = true;
        let mut resync = self.config.resync_period.filter(|p| !p.is_zero()).map(|p| {
            let mut i = tokio::time::interval_at(Instant::now() + p, p);
            i.set_missed_tick_behavior(MissedTickBehavior::Delay);
            i
        });
        info!(options = ?self.options, "reflector started");

        while !shutdown.is_cancelled() {
            if relist {
                match self.list_and_replace(&shutdown).await {
                    Ok(()) => failures = 0,
                    Err(e) => {
                        failures = failures.saturating_add(1);
                        warn!(error = %e, failures, "list failed; retrying");
                        if !self.pause(failures, &shutdown).await {
                            break;
                        }
                        continue;
                    }
                }
            }
            if shutdown.is_cancelled() {
                break;
            }

            let ended = self.watch(&shutdown, &mut resync).await;
            if shutdown.is_cancelled() {
                break;
            }
            relist = match ended {
                Ok(()) if self.config.resume_watch_on_close => {
                    debug!(version = %self.version, "watch closed; resuming");
                    false
                }
                Ok(()) => {
                    debug!(version = %self.version, "watch closed; relisting");
                    true
                }
                Err(e) if e.is_expired() => {
                    info!(error = %e, "watch version expired; relisting");
                    true
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    warn!(error = %e, failures, "watch failed; relisting");
                    true
                }
            };
            counter!("reflector_restarts_total", 1);
            if !self.pause(failures, &shutdown).await {
                break;
            }
        }
        info!("reflector stopped");
    }

    async fn pause(&self, failures: u32, shutdown: &CancellationToken) -> bool {
        let delay = self.config.relist_backoff.delay_for(failures);
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = shutdown.cancelled() => false,
        }
    }

    async fn list_and_replace(&mut self, shutdown: &CancellationToken) -> Result<(), WatchError> {
        let list = tokio::select! {
            r = self.lw.list(&self.options) => r?,
            _ = shutdown.cancelled() => return Ok(()),
        };
        counter!("reflector_list_total", 1);
        let count = list.items.len();
        let changes = self.cache.store.replace(list.items);
        self.version = list.resource_version;
        gauge!("store_objects", self.cache.store.len() as f64);
        info!(count, changes = changes.len(), version = %self.version, "list applied");
        for n in &changes {
            self.notify(n);
        }
        if !*self.synced_tx.borrow() {
            self.synced_tx.send_replace(true);
            info!("cache synced");
        }
        Ok(())
    }

    /// Consume one watch stream. `Ok` when it closes cleanly or on shutdown.
    async fn watch(&mut self, shutdown: &CancellationToken, resync: &mut Option<Interval>) -> Result<(), WatchError> {
        let lw = Arc::clone(&self.lw);
        let mut stream = tokio::select! {
            r = lw.watch(&self.options, &self.version) => r?,
            _ = shutdown.cancelled() => return Ok(()),
        };
        debug!(version = %self.version, "watch opened");
        loop {
            let event = tokio::select! {
                ev = stream.next() => ev,
                _ = shutdown.cancelled() => return Ok(()),
                _ = tick(resync) => {
                    self.resync();
                    continue;
                }
            };
            match event {
                None => return Ok(()),
                Some(WatchEvent::Error(e)) => return Err(e),
                Some(WatchEvent::Bookmark(rv)) => {
                    debug!(version = %rv, "bookmark");
                    if !rv.is_empty() {
                        self.version = rv;
                    }
                }
                Some(WatchEvent::Added(o)) => self.apply(EventKind::Added, o),
                Some(WatchEvent::Modified(o)) => self.apply(EventKind::Modified, o),
                Some(WatchEvent::Deleted(o)) => self.apply(EventKind::Deleted, o),
            }
        }
    }

    fn apply(&mut self, kind: EventKind, obj: L::Object) {
        counter!("reflector_watch_events_total", 1);
        let key = obj.key();
        let rv = obj.resource_version();
        let applied = match kind {
            EventKind::Added | EventKind::Modified => self.cache.store.apply_upsert(obj),
            // Observers see the final state carried by the event.
            EventKind::Deleted => self.cache.store.apply_delete(&key, &rv).map(|_| Arc::new(obj)),
        };
        let Some(object) = applied else {
            counter!("reflector_stale_events_dropped_total", 1);
            debug!(key = %key, version = %rv, ?kind, "dropping stale event");
            return;
        };
        if !rv.is_empty() {
            self.version = rv;
        }
        gauge!("store_objects", self.cache.store.len() as f64);
        debug!(key = %key, ?kind, version = %self.version, "event applied");
        self.notify(&Notification { kind, key, object });
    }

    fn resync(&self) {
        let objects = self.cache.store.list();
        debug!(count = objects.len(), "resync");
        for object in objects {
            self.notify(&Notification { kind: EventKind::Modified, key: object.key(), object });
        }
    }

    fn notify(&self, n: &Notification<L::Object>) {
        for o in self.cache.observers.load().iter() {
            o.on_event(n);
        }
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(i) => {
            i.tick().await;
        }
        None => std::future::pending().await,
    }
}
