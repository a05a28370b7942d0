//! Reflex core types: keys, resource versions and the object contract shared
//! by the reflector, the work queue and the controller.

#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub mod watch;

pub use watch::{BoxError, ListOptions, ListWatcher, ObjectList, WatchError, WatchEvent, WatchStream};

pub mod prelude {
    pub use super::watch::{ListOptions, ListWatcher, ObjectList, WatchError, WatchEvent, WatchStream};
    pub use super::{Object, ObjectKey, ResourceVersion};
}

/// Stable identity of a watched object: `namespace/name`, or just `name` for
/// cluster-scoped objects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self {
            namespace: namespace.filter(|ns| !ns.is_empty()).map(str::to_string),
            name: name.to_string(),
        }
    }

    pub fn namespaced(namespace: &str, name: &str) -> Self { Self::new(Some(namespace), name) }

    pub fn cluster(name: &str) -> Self { Self::new(None, name) }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

impl FromStr for ObjectKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split('/').collect::<Vec<_>>().as_slice() {
            [name] if !name.is_empty() => Ok(Self::cluster(name)),
            [ns, name] if !name.is_empty() => Ok(Self::new(Some(ns), name)),
            _ => Err(format!("invalid object key: {:?} (expect name or namespace/name)", s)),
        }
    }
}

/// Opaque version token attached to every object and list response.
///
/// Tokens are compared numerically when both sides parse as integers (the
/// apiserver's etcd revisions do); anything else is treated as unordered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceVersion(String);

impl ResourceVersion {
    pub fn new(token: impl Into<String>) -> Self { Self(token.into()) }

    pub fn as_str(&self) -> &str { &self.0 }

    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    /// Partial order between two tokens. `None` when the pair cannot be ordered.
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        if self.is_empty() || other.is_empty() {
            return None;
        }
        if self.0 == other.0 {
            return Some(Ordering::Equal);
        }
        match (self.0.parse::<u64>(), other.0.parse::<u64>()) {
            (Ok(a), Ok(b)) => Some(a.cmp(&b)),
            _ => None,
        }
    }

    /// True unless `self` is known to be older than or equal to `stored`.
    pub fn supersedes(&self, stored: &Self) -> bool {
        !matches!(self.compare(stored), Some(Ordering::Less | Ordering::Equal))
    }
}

impl fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl From<u64> for ResourceVersion {
    fn from(v: u64) -> Self { Self(v.to_string()) }
}

impl From<&str> for ResourceVersion {
    fn from(v: &str) -> Self { Self(v.to_string()) }
}

impl From<String> for ResourceVersion {
    fn from(v: String) -> Self { Self(v) }
}

/// A watched object. The store only ever looks at its key and version.
pub trait Object: Clone + Send + Sync + 'static {
    /// Must be infallible and stable across observations of the same object.
    fn key(&self) -> ObjectKey;
    fn resource_version(&self) -> ResourceVersion;
}

#[cfg(feature = "kube")]
impl Object for kube::core::DynamicObject {
    fn key(&self) -> ObjectKey {
        ObjectKey::new(
            self.metadata.namespace.as_deref(),
            self.metadata.name.as_deref().unwrap_or_default(),
        )
    }

    fn resource_version(&self) -> ResourceVersion {
        self.metadata.resource_version.clone().map(ResourceVersion).unwrap_or_default()
    }
}
