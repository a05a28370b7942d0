use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use reflex_core::{Object, ObjectKey, ResourceVersion};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use crate::{EventKind, Notification};

/// Index values an object contributes under one index name.
pub type IndexValues = SmallVec<[String; 4]>;

pub type IndexFn<T> = Arc<dyn Fn(&T) -> IndexValues + Send + Sync>;

/// Built into every store: objects by namespace ("" for cluster-scoped).
pub const NAMESPACE_INDEX: &str = "namespace";

struct Index<T> {
    func: IndexFn<T>,
    entries: FxHashMap<String, FxHashSet<ObjectKey>>,
}

impl<T> Index<T> {
    fn insert(&mut self, key: &ObjectKey, obj: &T) {
        for v in (self.func)(obj) {
            self.entries.entry(v).or_default().insert(key.clone());
        }
    }

    fn remove(&mut self, key: &ObjectKey, obj: &T) {
        for v in (self.func)(obj) {
            if let Some(keys) = self.entries.get_mut(&v) {
                keys.remove(key);
                if keys.is_empty() {
                    self.entries.remove(&v);
                }
            }
        }
    }
}

struct Inner<T> {
    items: FxHashMap<ObjectKey, Arc<T>>,
    indices: FxHashMap<String, Index<T>>,
}

impl<T> Inner<T> {
    fn put(&mut self, key: ObjectKey, obj: Arc<T>) -> Option<Arc<T>> {
        let old = self.items.insert(key.clone(), Arc::clone(&obj));
        for idx in self.indices.values_mut() {
            if let Some(old) = &old {
                idx.remove(&key, old);
            }
            idx.insert(&key, &obj);
        }
        old
    }

    fn take(&mut self, key: &ObjectKey) -> Option<Arc<T>> {
        let old = self.items.remove(key)?;
        for idx in self.indices.values_mut() {
            idx.remove(key, &old);
        }
        Some(old)
    }
}

/// Keyed mirror of the remote collection.
///
/// Cloning yields another handle. Objects are handed out as `Arc<T>` and are
/// never mutated in place, so a reader holding one keeps a consistent view
/// while the reflector replaces the entry. Only the reflector writes.
pub struct Store<T> {
    inner: Arc<RwLock<Inner<T>>>,
}

impl<T> Clone for Store<T> {
    fn clone(&self) -> Self { Self { inner: Arc::clone(&self.inner) } }
}

impl<T: Object> Default for Store<T> {
    fn default() -> Self { Self::new() }
}

impl<T: Object> Store<T> {
    pub fn new() -> Self {
        let ns_index: IndexFn<T> = Arc::new(|o: &T| {
            let mut v = IndexValues::new();
            v.push(o.key().namespace.unwrap_or_default());
            v
        });
        let mut indices = FxHashMap::default();
        indices.insert(NAMESPACE_INDEX.to_string(), Index { func: ns_index, entries: FxHashMap::default() });
        Self { inner: Arc::new(RwLock::new(Inner { items: FxHashMap::default(), indices })) }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner<T>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner<T>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register (or replace) an index and build it over the current contents.
    pub fn add_index<F>(&self, name: &str, func: F)
    where
        F: Fn(&T) -> IndexValues + Send + Sync + 'static,
    {
        let mut index = Index { func: Arc::new(func) as IndexFn<T>, entries: FxHashMap::default() };
        let mut inner = self.write();
        for (key, obj) in inner.items.iter() {
            index.insert(key, obj);
        }
        inner.indices.insert(name.to_string(), index);
    }

    pub fn get(&self, key: &ObjectKey) -> Option<Arc<T>> { self.read().items.get(key).cloned() }

    pub fn contains(&self, key: &ObjectKey) -> bool { self.read().items.contains_key(key) }

    pub fn len(&self) -> usize { self.read().items.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn keys(&self) -> Vec<ObjectKey> {
        let mut keys: Vec<_> = self.read().items.keys().cloned().collect();
        keys.sort_unstable();
        keys
    }

    /// Point-in-time copy of every object, ordered by key.
    pub fn list(&self) -> Vec<Arc<T>> {
        let inner = self.read();
        let mut pairs: Vec<_> = inner.items.iter().collect();
        pairs.sort_unstable_by(|a, b| a.0.cmp(b.0));
        pairs.into_iter().map(|(_, o)| Arc::clone(o)).collect()
    }

    /// Objects whose index `name` produced `value`, ordered by key.
    /// Empty when the index does not exist.
    pub fn by_index(&self, name: &str, value: &str) -> Vec<Arc<T>> {
        let inner = self.read();
        let Some(keys) = inner.indices.get(name).and_then(|idx| idx.entries.get(value)) else {
            return Vec::new();
        };
        let mut keys: Vec<_> = keys.iter().collect();
        keys.sort_unstable();
        keys.into_iter().filter_map(|k| inner.items.get(k).cloned()).collect()
    }

    /// Distinct values currently present in index `name`.
    pub fn index_values(&self, name: &str) -> Vec<String> {
        let inner = self.read();
        let mut values: Vec<_> = inner
            .indices
            .get(name)
            .map(|idx| idx.entries.keys().cloned().collect())
            .unwrap_or_default();
        values.sort_unstable();
        values
    }

    pub fn list_namespace(&self, namespace: &str) -> Vec<Arc<T>> { self.by_index(NAMESPACE_INDEX, namespace) }

    /// Insert unless the stored copy is at the same or a newer version.
    pub(crate) fn apply_upsert(&self, obj: T) -> Option<Arc<T>> {
        let key = obj.key();
        let mut inner = self.write();
        if let Some(cur) = inner.items.get(&key) {
            if !obj.resource_version().supersedes(&cur.resource_version()) {
                return None;
            }
        }
        let obj = Arc::new(obj);
        inner.put(key, Arc::clone(&obj));
        Some(obj)
    }

    /// Remove unless the key is absent or the stored copy is newer than `rv`.
    pub(crate) fn apply_delete(&self, key: &ObjectKey, rv: &ResourceVersion) -> Option<Arc<T>> {
        let mut inner = self.write();
        let cur = inner.items.get(key)?;
        if matches!(rv.compare(&cur.resource_version()), Some(std::cmp::Ordering::Less)) {
            return None;
        }
        inner.take(key)
    }

    /// Swap in a full listing atomically and report what changed relative to
    /// the previous contents: `Added` for new keys, `Modified` for keys whose
    /// version moved, `Deleted` for keys missing from the listing.
    pub(crate) fn replace(&self, items: Vec<T>) -> Vec<Notification<T>> {
        let mut inner = self.write();
        let mut previous = std::mem::take(&mut inner.items);
        for idx in inner.indices.values_mut() {
            idx.entries.clear();
        }

        let mut changes = Vec::new();
        for obj in items {
            let key = obj.key();
            let obj = Arc::new(obj);
            let kind = match previous.remove(&key) {
                None => Some(EventKind::Added),
                Some(old) => match obj.resource_version().compare(&old.resource_version()) {
                    Some(std::cmp::Ordering::Equal) => None,
                    _ => Some(EventKind::Modified),
                },
            };
            // A key listed twice keeps the last copy.
            if inner.put(key.clone(), Arc::clone(&obj)).is_some() {
                changes.retain(|n: &Notification<T>| n.key != key);
            }
            if let Some(kind) = kind {
                changes.push(Notification { kind, key, object: obj });
            }
        }

        let mut gone: Vec<_> = previous.into_iter().collect();
        gone.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        changes.extend(gone.into_iter().map(|(key, object)| Notification { kind: EventKind::Deleted, key, object }));
        changes
    }
}
