#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use reflex_core::{ListOptions, ListWatcher, Object, ObjectKey, ObjectList, ResourceVersion, WatchError, WatchEvent, WatchStream};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
pub struct Pod {
    pub ns: String,
    pub name: String,
    pub rv: u64,
    pub phase: String,
}

impl Object for Pod {
    fn key(&self) -> ObjectKey { ObjectKey::namespaced(&self.ns, &self.name) }
    fn resource_version(&self) -> ResourceVersion { self.rv.into() }
}

pub fn pod(name: &str, rv: u64) -> Pod {
    Pod { ns: "default".into(), name: name.into(), rv, phase: "Running".into() }
}

pub fn key(name: &str) -> ObjectKey { ObjectKey::namespaced("default", name) }

pub fn list(items: Vec<Pod>, rv: u64) -> Result<ObjectList<Pod>, WatchError> {
    Ok(ObjectList { items, resource_version: rv.into() })
}

#[derive(Default)]
struct Script {
    lists: Mutex<VecDeque<Result<ObjectList<Pod>, WatchError>>>,
    watches: Mutex<VecDeque<mpsc::UnboundedReceiver<WatchEvent<Pod>>>>,
    list_calls: AtomicUsize,
    watch_from: Mutex<Vec<ResourceVersion>>,
}

/// Scripted list/watch: each `list` pops the next scripted result, each
/// `watch` pops the next channel. With nothing scripted, lists fail and
/// watches stay open forever.
#[derive(Clone, Default)]
pub struct FakeLw {
    script: Arc<Script>,
}

impl FakeLw {
    pub fn push_list(&self, r: Result<ObjectList<Pod>, WatchError>) { self.script.lists.lock().unwrap().push_back(r); }

    pub fn push_watch(&self) -> mpsc::UnboundedSender<WatchEvent<Pod>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.script.watches.lock().unwrap().push_back(rx);
        tx
    }

    pub fn list_calls(&self) -> usize { self.script.list_calls.load(Ordering::SeqCst) }

    pub fn watch_from(&self) -> Vec<ResourceVersion> { self.script.watch_from.lock().unwrap().clone() }
}

#[async_trait::async_trait]
impl ListWatcher for FakeLw {
    type Object = Pod;

    async fn list(&self, _options: &ListOptions) -> Result<ObjectList<Pod>, WatchError> {
        self.script.list_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lists.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Err(WatchError::transport("no scripted list")))
    }

    async fn watch(&self, _options: &ListOptions, from: &ResourceVersion) -> Result<WatchStream<Pod>, WatchError> {
        self.script.watch_from.lock().unwrap().push(from.clone());
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
