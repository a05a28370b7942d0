//! List/watch contract against one remote collection.
//!
//! Implementations carry no retry logic; the reflector owns it.

use std::time::Duration;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::{Object, ResourceVersion};

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// Network or auth failure talking to the remote store.
    #[error("transport: {0}")]
    Transport(#[source] BoxError),
    /// The version token is no longer served; only a fresh list recovers.
    #[error("resource version expired: {0}")]
    ResourceExpired(String),
    /// The remote returned something that could not be turned into an object.
    #[error("decode: {0}")]
    Decode(String),
}

impl WatchError {
    pub fn transport(err: impl Into<BoxError>) -> Self { Self::Transport(err.into()) }

    pub fn is_expired(&self) -> bool { matches!(self, Self::ResourceExpired(_)) }
}

/// Filter applied to both list and watch calls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListOptions {
    /// Restrict to one namespace; `None` means all namespaces.
    pub namespace: Option<String>,
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
    /// Server-side watch timeout; the stream closes cleanly when it elapses.
    pub watch_timeout: Option<Duration>,
}

impl ListOptions {
    pub fn namespace(mut self, ns: &str) -> Self {
        self.namespace = Some(ns.to_string());
        self
    }

    pub fn labels(mut self, selector: &str) -> Self {
        self.label_selector = Some(selector.to_string());
        self
    }

    pub fn fields(mut self, selector: &str) -> Self {
        self.field_selector = Some(selector.to_string());
        self
    }

    pub fn watch_timeout(mut self, timeout: Duration) -> Self {
        self.watch_timeout = Some(timeout);
        self
    }
}

/// A full listing and the token to resume watching from.
#[derive(Debug, Clone)]
pub struct ObjectList<T> {
    pub items: Vec<T>,
    pub resource_version: ResourceVersion,
}

#[derive(Debug)]
pub enum WatchEvent<T> {
    Added(T),
    Modified(T),
    Deleted(T),
    /// Progress marker: the collection is current up to this token.
    Bookmark(ResourceVersion),
    /// Terminal for the stream; the reflector stops reading after it.
    Error(WatchError),
}

pub type WatchStream<T> = BoxStream<'static, WatchEvent<T>>;

#[async_trait::async_trait]
pub trait ListWatcher: Send + Sync + 'static {
    type Object: Object;

    async fn list(&self, options: &ListOptions) -> Result<ObjectList<Self::Object>, WatchError>;

    /// Open a watch starting after `from`. The stream ends when the remote
    /// side closes it, on transport failure, or after an `Error` event.
    async fn watch(
        &self,
        options: &ListOptions,
        from: &ResourceVersion,
    ) -> Result<WatchStream<Self::Object>, WatchError>;
}
