//! Key namespacing so several deployments can share one store

use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;

use super::{
    CoordinationStore, KeepAliveStream, KeyValue, LeaseId, StoreResult, WatchEvent, WatchStream,
};

/// Prepends a fixed prefix to every key and strips it from returned keys
pub struct NamespacedStore {
    inner: Arc<dyn CoordinationStore>,
    prefix: String,
}

impl NamespacedStore {
    /// A non-empty prefix always ends with `/`
    #[must_use]
    pub fn new(inner: Arc<dyn CoordinationStore>, prefix: &str) -> Self {
        let prefix = if prefix.is_empty() || prefix.ends_with('/') {
            prefix.to_string()
        } else {
            format!("{prefix}/")
        };
        Self { inner, prefix }
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }
}

fn strip(prefix: &str, key: String) -> String {
    match key.strip_prefix(prefix) {
        Some(stripped) => stripped.to_string(),
        None => key,
    }
}

#[async_trait]
impl CoordinationStore for NamespacedStore {
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> StoreResult<()> {
        self.inner.put(&self.key(key), value, lease).await
    }

    async fn get(&self, key: &str) -> StoreResult<Option<KeyValue>> {
        Ok(self.inner.get(&self.key(key)).await?.map(|kv| KeyValue {
            key: strip(&self.prefix, kv.key),
            ..kv
        }))
    }

    async fn delete(&self, key: &str) -> StoreResult<u64> {
        self.inner.delete(&self.key(key)).await
    }

    async fn grant_lease(&self, ttl_secs: i64) -> StoreResult<LeaseId> {
        self.inner.grant_lease(ttl_secs).await
    }

    async fn keep_alive(&self, lease: LeaseId) -> StoreResult<KeepAliveStream> {
        self.inner.keep_alive(lease).await
    }

    async fn watch_prefix(&self, prefix: &str) -> StoreResult<WatchStream> {
        let namespace = self.prefix.clone();
        let stream = self.inner.watch_prefix(&self.key(prefix)).await?;
        Ok(stream
            .map(move |batch| {
                batch.map(|events| {
                    events
                        .into_iter()
                        .map(|event| WatchEvent {
                            key: strip(&namespace, event.key),
                            ..event
                        })
                        .collect()
                })
            })
            .boxed())
    }

    async fn close(&self) -> StoreResult<()> {
        self.inner.close().await
    }
}
