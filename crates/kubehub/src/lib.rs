//! Reflex kubehub: the list/watch contract over a live Kubernetes API server,
//! for any served kind via `DynamicObject`, plus discovery helpers.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use kube::{
    api::{Api, ListParams, WatchParams},
    core::{ApiResource, DynamicObject, ErrorResponse, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use reflex_core::{ListOptions, ListWatcher, ObjectList, ResourceVersion, WatchError, WatchEvent, WatchStream};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Longest server-side watch timeout the API server accepts from us.
const MAX_WATCH_TIMEOUT_SECS: u32 = 290;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredResource {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespaced: bool,
}

impl DiscoveredResource {
    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

/// Discover served resources (incl. CRDs), sorted by group, version, kind.
pub async fn discover(client: Client) -> Result<Vec<DiscoveredResource>> {
    let discovery = Discovery::new(client).run().await.context("running discovery")?;
    let mut out = Vec::new();
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            out.push(DiscoveredResource {
                group: ar.group.clone(),
                version: ar.version.clone(),
                kind: ar.kind.clone(),
                namespaced: matches!(caps.scope, Scope::Namespaced),
            });
        }
    }
    out.sort_by(|a, b| a.group.cmp(&b.group).then(a.version.cmp(&b.version)).then(a.kind.cmp(&b.kind)));
    Ok(out)
}

/// `v1/Kind` or `group/v1/Kind`.
pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind::gvk("", version, kind)),
        [group, version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind::gvk(group, version, kind)),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await.context("running discovery")?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                return Ok((ar.clone(), matches!(caps.scope, Scope::Namespaced)));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

/// Lists and watches one kind through the API server. Namespace and
/// selectors come from the [`ListOptions`] of each call.
#[derive(Clone)]
pub struct KubeListWatcher {
    client: Client,
    resource: ApiResource,
    namespaced: bool,
}

impl KubeListWatcher {
    /// Resolve `gvk_key` via discovery.
    pub async fn for_gvk(client: Client, gvk_key: &str) -> Result<Self> {
        let gvk = parse_gvk_key(gvk_key)?;
        let (resource, namespaced) = find_api_resource(client.clone(), &gvk).await?;
        info!(gvk = %gvk_key, namespaced, plural = %resource.plural, "resolved resource");
        Ok(Self { client, resource, namespaced })
    }

    /// Skip discovery when the resource is already known.
    pub fn new(client: Client, resource: ApiResource, namespaced: bool) -> Self { Self { client, resource, namespaced } }

    pub fn resource(&self) -> &ApiResource { &self.resource }

    fn api(&self, options: &ListOptions) -> Api<DynamicObject> {
        match options.namespace.as_deref() {
            Some(ns) if self.namespaced => Api::namespaced_with(self.client.clone(), ns, &self.resource),
            _ => Api::all_with(self.client.clone(), &self.resource),
        }
    }
}

#[async_trait]
impl ListWatcher for KubeListWatcher {
    type Object = DynamicObject;

    async fn list(&self, options: &ListOptions) -> Result<ObjectList<DynamicObject>, WatchError> {
        let list = self.api(options).list(&list_params(options)).await.map_err(map_kube_error)?;
        let resource_version = list.metadata.resource_version.unwrap_or_default();
        debug!(kind = %self.resource.kind, count = list.items.len(), version = %resource_version, "listed");
        Ok(ObjectList { items: list.items, resource_version: resource_version.into() })
    }

    async fn watch(&self, options: &ListOptions, from: &ResourceVersion) -> Result<WatchStream<DynamicObject>, WatchError> {
        let stream = self
            .api(options)
            .watch(&watch_params(options), from.as_str())
            .await
            .map_err(map_kube_error)?;
        Ok(stream
            .map(|ev| match ev {
                Ok(ev) => from_kube_event(ev),
                Err(e) => WatchEvent::Error(map_kube_error(e)),
            })
            .boxed())
    }
}

fn list_params(options: &ListOptions) -> ListParams {
    let mut lp = ListParams::default();
    if let Some(labels) = options.label_selector.as_deref() {
        lp = lp.labels(labels);
    }
    if let Some(fields) = options.field_selector.as_deref() {
        lp = lp.fields(fields);
    }
    lp
}

fn watch_params(options: &ListOptions) -> WatchParams {
    let mut wp = WatchParams::default();
    if let Some(labels) = options.label_selector.as_deref() {
        wp = wp.labels(labels);
    }
    if let Some(fields) = options.field_selector.as_deref() {
        wp = wp.fields(fields);
    }
    if let Some(t) = options.watch_timeout {
        let secs = u32::try_from(t.as_secs()).unwrap_or(u32::MAX).clamp(1, MAX_WATCH_TIMEOUT_SECS);
        wp = wp.timeout(secs);
    }
    wp
}

fn from_api_error(e: ErrorResponse) -> WatchError {
    if e.code == 410 {
        WatchError::ResourceExpired(e.message)
    } else {
        WatchError::transport(kube::Error::Api(e))
    }
}

fn map_kube_error(e: kube::Error) -> WatchError {
    match e {
        kube::Error::Api(ae) => from_api_error(ae),
        kube::Error::SerdeError(e) => WatchError::Decode(e.to_string()),
        other => WatchError::transport(other),
    }
}

fn from_kube_event(ev: kube::core::WatchEvent<DynamicObject>) -> WatchEvent<DynamicObject> {
    use kube::core::WatchEvent as K;
    match ev {
        K::Added(o) => WatchEvent::Added(o),
        K::Modified(o) => WatchEvent::Modified(o),
        K::Deleted(o) => WatchEvent::Deleted(o),
        K::Bookmark(b) => WatchEvent::Bookmark(b.metadata.resource_version.into()),
        K::Error(e) => WatchEvent::Error(from_api_error(e)),
    }
}
