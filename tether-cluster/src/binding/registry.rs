//! Coordination-store backed binding registry
//!
//! Publishes the uids bound on this node under a lease that is kept alive
//! for as long as the registry runs, and follows every binding change in the
//! cluster so online checks are answered from memory.

use async_trait::async_trait;
use dashmap::DashSet;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tether_core::config::BindingConfig;
use tether_core::{Server, Session, SessionLifecycleListener, SessionPool};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::keys::{parse_bindings_key, user_binding_key, BINDINGS_PREFIX};
use super::lease::{LeasePhase, LeaseTracker};
use super::online::OnlineUsers;
use super::BindingStorage;
use crate::error::{Error, Result};
use crate::store::{
    CoordinationStore, EventKind, KeepAliveStream, NamespacedStore, StoreConnector, StoreError,
    StoreResult, WatchEvent, WatchStream,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Running,
    Closed,
}

/// Binding registry of one server process
///
/// Construct it, wrap it in an `Arc` and call [`BindingRegistry::init`].
/// Frontend servers publish a binding whenever a session is bound; every
/// server follows the bindings of the whole cluster.
pub struct BindingRegistry {
    server: Server,
    session_pool: Arc<dyn SessionPool>,
    connector: Arc<dyn StoreConnector>,
    config: BindingConfig,
    store: RwLock<Option<Arc<dyn CoordinationStore>>>,
    lease: LeaseTracker,
    online_users: OnlineUsers,
    /// Uids published by this node, re-published after a lease is re-granted
    local_bindings: DashSet<String>,
    /// Serializes binding writes and removals with the republish pass
    binding_writes: tokio::sync::Mutex<()>,
    lifecycle: Mutex<Lifecycle>,
    init_lock: tokio::sync::Mutex<()>,
    cancel_token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BindingRegistry {
    #[must_use]
    pub fn new(
        server: Server,
        session_pool: Arc<dyn SessionPool>,
        connector: Arc<dyn StoreConnector>,
        config: BindingConfig,
    ) -> Self {
        Self {
            server,
            session_pool,
            connector,
            config,
            store: RwLock::new(None),
            lease: LeaseTracker::new(),
            online_users: OnlineUsers::new(),
            local_bindings: DashSet::new(),
            binding_writes: tokio::sync::Mutex::new(()),
            lifecycle: Mutex::new(Lifecycle::Created),
            init_lock: tokio::sync::Mutex::new(()),
            cancel_token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Connect to the store, acquire the presence lease and start the
    /// background lease keeper and binding watcher. Calling it again while
    /// running is a no-op.
    pub async fn init(self: &Arc<Self>) -> Result<()> {
        let _guard = self.init_lock.lock().await;
        match self.lifecycle() {
            Lifecycle::Running => return Ok(()),
            Lifecycle::Closed => return Err(Error::RegistryClosed),
            Lifecycle::Created => {}
        }

        let store = self.connect().await?;
        let keep_alive = match self.bootstrap_lease(&store).await {
            Ok(stream) => stream,
            Err(e) => {
                if let Err(close_err) = store.close().await {
                    warn!(error = %close_err, "Failed to close store client after lease bootstrap failure");
                }
                return Err(e);
            }
        };
        *self.store.write() = Some(Arc::clone(&store));

        let watch = self.open_watch(&store).await;
        *self.lifecycle.lock() = Lifecycle::Running;

        // Backend servers hold no sessions, so they publish no bindings
        if self.server.frontend {
            self.session_pool.subscribe(Arc::new(BindingHooks {
                registry: Arc::downgrade(self),
            }));
        }

        let lease_task = tokio::spawn(Arc::clone(self).keep_lease_alive(Arc::clone(&store), keep_alive));
        let watch_task = tokio::spawn(Arc::clone(self).watch_user_changes(store, watch));
        self.tasks.lock().extend([lease_task, watch_task]);

        info!(
            server_id = %self.server.id,
            server_type = %self.server.server_type,
            frontend = self.server.frontend,
            lease = ?self.lease.id(),
            "Binding registry started"
        );
        Ok(())
    }

    /// Stop the background tasks and close the store client. The lease is
    /// left to expire on its own.
    pub async fn shutdown(&self) -> Result<()> {
        // Waits out an init in progress so it cannot mark a closed registry running
        let _init = self.init_lock.lock().await;
        {
            let mut lifecycle = self.lifecycle.lock();
            if *lifecycle == Lifecycle::Closed {
                debug!("Binding registry already shut down");
                return Ok(());
            }
            *lifecycle = Lifecycle::Closed;
        }

        info!(server_id = %self.server.id, "Shutting down binding registry");
        self.cancel_token.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Binding registry task ended abnormally");
            }
        }
        self.lease.shutdown();

        let store = self.store.write().take();
        if let Some(store) = store {
            store.close().await.map_err(Error::StoreWrite)?;
        }
        Ok(())
    }

    /// Bind `uid` to this server under the current lease
    pub async fn put_binding(&self, uid: &str) -> Result<()> {
        let store = self.store()?;
        let _writes = self.binding_writes.lock().await;
        self.write_binding(&store, uid).await?;
        self.local_bindings.insert(uid.to_string());
        debug!(uid = %uid, server_type = %self.server.server_type, "Binding stored");
        Ok(())
    }

    /// Remove this server's binding for `uid`. Missing bindings are fine.
    pub async fn remove_binding(&self, uid: &str) -> Result<()> {
        let store = self.store()?;
        let _writes = self.binding_writes.lock().await;
        self.local_bindings.remove(uid);
        let key = user_binding_key(uid, &self.server.server_type);
        timed(self.config.operation_timeout(), "delete binding", store.delete(&key))
            .await
            .map_err(Error::StoreWrite)?;
        debug!(uid = %uid, server_type = %self.server.server_type, "Binding removed");
        Ok(())
    }

    /// Id of the `frontend_type` server `uid` is connected to. Always read
    /// from the store.
    pub async fn get_user_frontend_id(&self, uid: &str, frontend_type: &str) -> Result<String> {
        let store = self.store()?;
        let key = user_binding_key(uid, frontend_type);
        timed(self.config.operation_timeout(), "get binding", store.get(&key))
            .await
            .map_err(Error::StoreRead)?
            .map(|kv| kv.value)
            .ok_or_else(|| Error::BindingNotFound {
                uid: uid.to_string(),
                frontend_type: frontend_type.to_string(),
            })
    }

    #[must_use]
    pub fn is_user_online(&self, uid: u64) -> bool {
        self.online_users.contains(uid)
    }

    #[must_use]
    pub fn online_user_count(&self) -> usize {
        self.online_users.len()
    }

    #[must_use]
    pub fn lease_state(&self) -> LeasePhase {
        self.lease.phase()
    }

    #[must_use]
    pub fn lease_id(&self) -> Option<crate::store::LeaseId> {
        self.lease.id()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.lifecycle() == Lifecycle::Running
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lifecycle() == Lifecycle::Closed
    }

    #[must_use]
    pub const fn server(&self) -> &Server {
        &self.server
    }

    fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.lock()
    }

    fn store(&self) -> Result<Arc<dyn CoordinationStore>> {
        match self.lifecycle() {
            Lifecycle::Closed => Err(Error::RegistryClosed),
            Lifecycle::Created => Err(Error::NotStarted),
            Lifecycle::Running => self.store.read().clone().ok_or(Error::NotStarted),
        }
    }

    async fn connect(&self) -> Result<Arc<dyn CoordinationStore>> {
        let client = tokio::time::timeout(
            self.config.dial_timeout(),
            self.connector.connect(&self.config.endpoints),
        )
        .await
        .map_err(|_| Error::Timeout(format!("connecting to {:?}", self.config.endpoints)))?
        .map_err(|e| Error::Connect(e.to_string()))?;

        Ok(Arc::new(NamespacedStore::new(client, &self.config.prefix)))
    }

    async fn write_binding(&self, store: &Arc<dyn CoordinationStore>, uid: &str) -> Result<()> {
        let key = user_binding_key(uid, &self.server.server_type);
        timed(
            self.config.operation_timeout(),
            "put binding",
            store.put(&key, &self.server.id, self.lease.id()),
        )
        .await
        .map_err(Error::StoreWrite)
    }

    /// Grant a lease and wait for its first keep-alive acknowledgment
    async fn bootstrap_lease(&self, store: &Arc<dyn CoordinationStore>) -> Result<KeepAliveStream> {
        let limit = self.config.operation_timeout();
        let ttl = i64::try_from(self.config.lease_ttl_secs).unwrap_or(i64::MAX);

        let lease = timed(limit, "grant lease", store.grant_lease(ttl))
            .await
            .map_err(|e| Error::Lease(format!("grant failed: {e}")))?;
        self.lease.granted(lease);
        debug!(lease = %lease, "Got lease");

        let mut keep_alive = timed(limit, "keep alive", store.keep_alive(lease))
            .await
            .map_err(|e| Error::Lease(format!("keep-alive for lease {lease} failed: {e}")))?;

        match tokio::time::timeout(limit, keep_alive.next()).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                return Err(Error::Lease(format!(
                    "keep-alive stream for lease {lease} closed before first acknowledgment"
                )));
            }
            Err(_) => {
                return Err(Error::Timeout(format!(
                    "first keep-alive acknowledgment for lease {lease}"
                )));
            }
        }

        self.lease.activate();
        Ok(keep_alive)
    }

    async fn keep_lease_alive(
        self: Arc<Self>,
        store: Arc<dyn CoordinationStore>,
        mut keep_alive: KeepAliveStream,
    ) {
        'keeper: loop {
            let response = tokio::select! {
                () = self.cancel_token.cancelled() => break 'keeper,
                response = keep_alive.next() => response,
            };
            if response.is_some() {
                continue;
            }

            warn!(lease = ?self.lease.id(), "Error renewing lease, rebootstrapping");
            self.lease.rebootstrapping();

            keep_alive = loop {
                let attempt = tokio::select! {
                    () = self.cancel_token.cancelled() => break 'keeper,
                    attempt = self.bootstrap_lease(&store) => attempt,
                };
                match attempt {
                    Ok(stream) => break stream,
                    Err(e) => {
                        self.lease.rebootstrapping();
                        warn!(
                            error = %e,
                            retry_in = ?self.config.lease_retry_backoff(),
                            "Error rebootstrapping lease, will retry"
                        );
                        if !self.sleep_or_cancel(self.config.lease_retry_backoff()).await {
                            break 'keeper;
                        }
                    }
                }
            };

            info!(lease = ?self.lease.id(), "Lease rebootstrapped");
            self.republish_bindings(&store).await;
        }

        self.lease.shutdown();
        debug!("Lease keeper stopped");
    }

    /// Bindings written under an expired lease are gone; write them again
    /// under the current one
    async fn republish_bindings(&self, store: &Arc<dyn CoordinationStore>) {
        let uids: Vec<String> = self
            .local_bindings
            .iter()
            .map(|uid| uid.key().clone())
            .collect();

        for uid in &uids {
            let _writes = self.binding_writes.lock().await;
            // Removed since the snapshot
            if !self.local_bindings.contains(uid) {
                continue;
            }
            if let Err(e) = self.write_binding(store, uid).await {
                warn!(uid = %uid, error = %e, "Failed to republish binding under new lease");
            }
        }

        if !uids.is_empty() {
            debug!(count = uids.len(), "Republished bindings");
        }
    }

    async fn open_watch(&self, store: &Arc<dyn CoordinationStore>) -> Option<WatchStream> {
        match timed(
            self.config.operation_timeout(),
            "watch bindings",
            store.watch_prefix(BINDINGS_PREFIX),
        )
        .await
        {
            Ok(stream) => Some(stream),
            Err(e) => {
                warn!(error = %e, "Failed to open bindings watch");
                None
            }
        }
    }

    async fn watch_user_changes(
        self: Arc<Self>,
        store: Arc<dyn CoordinationStore>,
        mut watch: Option<WatchStream>,
    ) {
        'watcher: loop {
            if let Some(mut stream) = watch.take() {
                loop {
                    let item = tokio::select! {
                        () = self.cancel_token.cancelled() => break 'watcher,
                        item = stream.next() => item,
                    };
                    match item {
                        Some(Ok(events)) => self.apply_events(&events),
                        Some(Err(e)) => {
                            warn!(error = %e, "Bindings watcher response error");
                            break;
                        }
                        None => {
                            error!(
                                retry_in = ?self.config.watch_retry_backoff(),
                                "Bindings watcher died, retrying"
                            );
                            break;
                        }
                    }
                }
            }

            if !self.sleep_or_cancel(self.config.watch_retry_backoff()).await {
                break;
            }
            watch = tokio::select! {
                () = self.cancel_token.cancelled() => break 'watcher,
                watch = self.open_watch(&store) => watch,
            };
            if watch.is_some() {
                debug!(
                    online_users = self.online_users.len(),
                    "Bindings watch re-opened, changes made while it was down are not replayed and online users may be stale"
                );
            }
        }

        debug!("Bindings watcher stopped");
    }

    fn apply_events(&self, events: &[WatchEvent]) {
        for event in events {
            let Ok(uid) = parse_bindings_key(&event.key) else {
                warn!(key = %event.key, "Failed to parse bindings key");
                continue;
            };
            match event.kind {
                EventKind::Put => self.online_users.add(uid),
                EventKind::Delete => self.online_users.remove(uid),
            }
        }
    }

    /// Returns false when the registry is shutting down
    async fn sleep_or_cancel(&self, base: Duration) -> bool {
        let delay = with_jitter(base, self.config.max_jitter());
        tokio::select! {
            () = self.cancel_token.cancelled() => false,
            () = tokio::time::sleep(delay) => true,
        }
    }
}

#[async_trait]
impl BindingStorage for BindingRegistry {
    async fn put_binding(&self, uid: &str) -> Result<()> {
        Self::put_binding(self, uid).await
    }

    async fn get_user_frontend_id(&self, uid: &str, frontend_type: &str) -> Result<String> {
        Self::get_user_frontend_id(self, uid, frontend_type).await
    }

    fn is_user_online(&self, uid: u64) -> bool {
        Self::is_user_online(self, uid)
    }

    fn is_closed(&self) -> bool {
        Self::is_closed(self)
    }
}

/// Session hooks keeping the store in sync with local sessions
struct BindingHooks {
    registry: Weak<BindingRegistry>,
}

#[async_trait]
impl SessionLifecycleListener for BindingHooks {
    async fn on_after_session_bind(&self, session: Arc<dyn Session>) -> tether_core::Result<()> {
        let Some(registry) = self.registry.upgrade() else {
            return Ok(());
        };
        let Some(uid) = session.uid().filter(|uid| !uid.is_empty()) else {
            return Ok(());
        };
        registry.put_binding(&uid).await.map_err(|e| {
            error!(uid = %uid, session_id = session.id(), error = %e, "Error storing binding info");
            tether_core::Error::Hook(e.to_string())
        })
    }

    async fn on_session_close(&self, session: Arc<dyn Session>) -> tether_core::Result<()> {
        let Some(registry) = self.registry.upgrade() else {
            return Ok(());
        };
        if registry.is_closed() {
            return Ok(());
        }
        let Some(uid) = session.uid().filter(|uid| !uid.is_empty()) else {
            return Ok(());
        };
        // A newer session for the same uid still owns the binding
        if let Some(current) = registry.session_pool.get_session_by_uid(&uid) {
            if current.id() != session.id() {
                debug!(uid = %uid, session_id = session.id(), current_session_id = current.id(), "Keeping binding of replaced session");
                return Ok(());
            }
        }
        registry.remove_binding(&uid).await.map_err(|e| {
            error!(uid = %uid, session_id = session.id(), error = %e, "Error removing binding info from storage");
            tether_core::Error::Hook(e.to_string())
        })
    }
}

async fn timed<T>(
    limit: Duration,
    operation: &str,
    fut: impl Future<Output = StoreResult<T>>,
) -> StoreResult<T> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| StoreError::Timeout(operation.to_string()))?
}

fn with_jitter(base: Duration, max_jitter: Duration) -> Duration {
    if max_jitter.is_zero() {
        return base;
    }
    let max_ms = u64::try_from(max_jitter.as_millis()).unwrap_or(u64::MAX);
    base + Duration::from_millis(rand::rng().random_range(0..=max_ms))
}
