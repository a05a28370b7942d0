//! Reflex store: the keyed in-RAM mirror of one remote collection and the
//! reflector that keeps it current via list + watch.

#![forbid(unsafe_code)]

use std::sync::Arc;

use reflex_core::ObjectKey;
use reflex_queue::WorkQueue;

mod reflector;
mod store;

pub use reflector::{Cache, Reflector, ReflectorConfig};
pub use store::{IndexFn, IndexValues, Store, NAMESPACE_INDEX};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Added,
    Modified,
    Deleted,
}

/// One change applied to the store, delivered to observers in apply order.
#[derive(Debug)]
pub struct Notification<T> {
    pub kind: EventKind,
    pub key: ObjectKey,
    pub object: Arc<T>,
}

impl<T> Clone for Notification<T> {
    fn clone(&self) -> Self { Self { kind: self.kind, key: self.key.clone(), object: Arc::clone(&self.object) } }
}

/// Receives every change the reflector applies. Called synchronously on the
/// reflector task, so implementations must not block.
pub trait Observer<T>: Send + Sync {
    fn on_event(&self, event: &Notification<T>);
}

/// Adapts a closure into an [`Observer`].
pub struct FnObserver<F>(pub F);

impl<T, F> Observer<T> for FnObserver<F>
where
    F: Fn(&Notification<T>) + Send + Sync,
{
    fn on_event(&self, event: &Notification<T>) { (self.0)(event) }
}

/// Every change marks its key dirty; the queue coalesces.
impl<T> Observer<T> for WorkQueue<ObjectKey> {
    fn on_event(&self, event: &Notification<T>) { self.add(event.key.clone()) }
}
