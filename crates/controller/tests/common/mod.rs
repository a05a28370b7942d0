#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use reflex_controller::{ControllerConfig, ControllerEvent, ReflectorConfig};
use reflex_core::{ListOptions, ListWatcher, Object, ObjectKey, ObjectList, ResourceVersion, WatchError, WatchEvent, WatchStream};
use reflex_queue::ExponentialBackoff;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
pub struct Pod {
    pub name: String,
    pub rv: u64,
}

impl Object for Pod {
    fn key(&self) -> ObjectKey { ObjectKey::namespaced("default", &self.name) }
    fn resource_version(&self) -> ResourceVersion { self.rv.into() }
}

pub fn pod(name: &str, rv: u64) -> Pod { Pod { name: name.into(), rv } }

pub fn key(name: &str) -> ObjectKey { ObjectKey::namespaced("default", name) }

#[derive(Default)]
struct Script {
    lists: Mutex<VecDeque<ObjectList<Pod>>>,
    watches: Mutex<VecDeque<mpsc::UnboundedReceiver<WatchEvent<Pod>>>>,
    list_calls: AtomicUsize,
}

/// Scripted list/watch. Unscripted lists fail; unscripted watches never end.
#[derive(Clone, Default)]
pub struct FakeLw {
    script: Arc<Script>,
}

impl FakeLw {
    pub fn with_list(items: Vec<Pod>, rv: u64) -> Self {
        let lw = Self::default();
        lw.script.lists.lock().unwrap().push_back(ObjectList { items, resource_version: rv.into() });
        lw
    }

    pub fn push_watch(&self) -> mpsc::UnboundedSender<WatchEvent<Pod>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.script.watches.lock().unwrap().push_back(rx);
        tx
    }

    pub fn list_calls(&self) -> usize { self.script.list_calls.load(Ordering::SeqCst) }
}

#[async_trait::async_trait]
impl ListWatcher for FakeLw {
    type Object = Pod;

    async fn list(&self, _options: &ListOptions) -> Result<ObjectList<Pod>, WatchError> {
        self.script.list_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lists.lock().unwrap().pop_front();
        next.ok_or_else(|| WatchError::transport("no scripted list"))
    }

    async fn watch(&self, _options: &ListOptions, _from: &ResourceVersion) -> Result<WatchStream<Pod>, WatchError> {
        let next = self.script.watches.lock().unwrap().pop_front();
        Ok(match next {
            Some(mut rx) => async_stream::stream! {
                while let Some(ev) = rx.recv().await {
                    yield ev;
                }
            }
            .boxed(),
            None => futures::stream::pending().boxed(),
        })
    }
}

/// Short backoffs, no overall rate cap.
pub fn fast_config() -> ControllerConfig {
    ControllerConfig {
        name: "test".into(),
        cache_sync_timeout: Duration::from_secs(2),
        retry_backoff: ExponentialBackoff::new(Duration::from_millis(10), Duration::from_secs(1)),
        retry_qps: 10_000.0,
        retry_burst: 10_000,
        reflector: ReflectorConfig {
            relist_backoff: ExponentialBackoff::new(Duration::from_millis(1), Duration::from_millis(10)),
            ..ReflectorConfig::default()
        },
        ..ControllerConfig::default()
    }
}

/// Next event matching `pred`, skipping others; panics after two seconds.
pub async fn next_matching<F>(rx: &mut mpsc::UnboundedReceiver<ControllerEvent>, pred: F) -> ControllerEvent
where
    F: Fn(&ControllerEvent) -> bool,
{
    let wait = async {
        loop {
            match rx.recv().await {
                Some(ev) if pred(&ev) => return ev,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(2), wait).await.expect("timed out waiting for event")
}

/// Poll `cond` until it holds or two seconds pass.
pub async fn eventually<F: Fn() -> bool>(cond: F) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}
