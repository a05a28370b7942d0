use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use reflex_core::ObjectKey;

/// User reconcile logic. `object` is the cached state at the time the key
/// was dequeued, or `None` if it no longer exists. Returning an error
/// schedules a retry.
#[async_trait]
pub trait Reconcile<T>: Send + Sync + 'static {
    async fn sync(&self, key: &ObjectKey, object: Option<Arc<T>>) -> anyhow::Result<()>;
}

/// Adapts an async closure into a [`Reconcile`].
pub struct ReconcileFn<F>(pub F);

#[async_trait]
impl<T, F, Fut> Reconcile<T> for ReconcileFn<F>
where
    T: Send + Sync + 'static,
    F: Fn(ObjectKey, Option<Arc<T>>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn sync(&self, key: &ObjectKey, object: Option<Arc<T>>) -> anyhow::Result<()> {
        (self.0)(key.clone(), object).await
    }
}

#[async_trait]
impl<T: Send + Sync + 'static, R: Reconcile<T> + ?Sized> Reconcile<T> for Arc<R> {
    async fn sync(&self, key: &ObjectKey, object: Option<Arc<T>>) -> anyhow::Result<()> {
        (**self).sync(key, object).await
    }
}
