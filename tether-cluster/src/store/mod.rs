//! Coordination store capability
//!
//! The binding registry consumes an etcd-like linearizable key-value store
//! through [`CoordinationStore`]: plain key operations, time-bounded leases
//! that delete their attached keys on expiry, keep-alive streams and prefix
//! watches. [`MemoryStore`] is the in-process implementation.

pub mod memory;
pub mod namespace;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub use memory::{MemoryClient, MemoryStore};
pub use namespace::NamespacedStore;

/// Handle of a lease granted by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaseId(pub i64);

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
    pub lease: Option<LeaseId>,
    pub mod_revision: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Put,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub key: String,
    /// Empty for deletes
    pub value: String,
    pub revision: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveResponse {
    pub lease: LeaseId,
    pub ttl_secs: i64,
}

/// Acknowledgments for a kept-alive lease. The stream ending means renewal
/// stopped and the lease will expire.
pub type KeepAliveStream = BoxStream<'static, KeepAliveResponse>;

/// Batches of change events under a watched prefix. An `Err` item or the
/// stream ending means the watch has to be re-opened.
pub type WatchStream = BoxStream<'static, StoreResult<Vec<WatchEvent>>>;

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store client is closed")]
    Closed,

    #[error("lease {0} not found")]
    LeaseNotFound(LeaseId),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("watch failed: {0}")]
    Watch(String),

    #[error("store operation timed out: {0}")]
    Timeout(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> StoreResult<()>;

    async fn get(&self, key: &str) -> StoreResult<Option<KeyValue>>;

    /// Returns the number of deleted keys; deleting a missing key is not an error
    async fn delete(&self, key: &str) -> StoreResult<u64>;

    async fn grant_lease(&self, ttl_secs: i64) -> StoreResult<LeaseId>;

    async fn keep_alive(&self, lease: LeaseId) -> StoreResult<KeepAliveStream>;

    async fn watch_prefix(&self, prefix: &str) -> StoreResult<WatchStream>;

    /// Stops keep-alives and watches opened through this client. Leases are
    /// not revoked.
    async fn close(&self) -> StoreResult<()>;
}

/// Opens store clients for a list of endpoints
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(&self, endpoints: &[String]) -> StoreResult<Arc<dyn CoordinationStore>>;
}
