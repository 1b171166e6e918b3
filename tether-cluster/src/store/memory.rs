//! In-process coordination store
//!
//! Linearizable: every mutation happens under one lock and its watch event
//! is emitted before the lock is released, so watchers observe mutations in
//! revision order. Lease expiry is enforced lazily on every operation and by
//! a background reaper, and deletes every key attached to the lease.

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    CoordinationStore, EventKind, KeepAliveResponse, KeepAliveStream, KeyValue, LeaseId,
    StoreConnector, StoreError, StoreResult, WatchEvent, WatchStream,
};

/// Watchers further behind than this lose their stream
const EVENT_CHANNEL_CAPACITY: usize = 4096;

const REAPER_INTERVAL: Duration = Duration::from_millis(100);

const KEEP_ALIVE_CHANNEL_CAPACITY: usize = 16;

const MIN_KEEP_ALIVE_INTERVAL: Duration = Duration::from_millis(100);

struct LeaseEntry {
    ttl: Duration,
    deadline: Instant,
    keys: HashSet<String>,
    revoked: CancellationToken,
}

#[derive(Default)]
struct State {
    kvs: BTreeMap<String, KeyValue>,
    leases: HashMap<LeaseId, LeaseEntry>,
    revision: i64,
    next_lease_id: i64,
}

struct Inner {
    state: Mutex<State>,
    events: broadcast::Sender<WatchEvent>,
    available: AtomicBool,
    /// Cancelled (and replaced) when the store goes unavailable, which kills
    /// every open keep-alive and watch stream
    outage: Mutex<CancellationToken>,
}

impl Inner {
    fn check_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("store is unreachable".to_string()))
        }
    }

    fn emit(&self, event: WatchEvent) {
        // No watchers is fine
        let _ = self.events.send(event);
    }

    fn expire_leases(&self, state: &mut State) {
        let now = Instant::now();
        let expired: Vec<LeaseId> = state
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            debug!(lease = %id, "Lease expired");
            self.remove_lease(state, id);
        }
    }

    fn remove_lease(&self, state: &mut State, id: LeaseId) -> bool {
        let Some(lease) = state.leases.remove(&id) else {
            return false;
        };
        lease.revoked.cancel();

        let mut keys: Vec<String> = lease.keys.into_iter().collect();
        keys.sort();
        for key in keys {
            if state.kvs.remove(&key).is_some() {
                state.revision += 1;
                self.emit(WatchEvent {
                    kind: EventKind::Delete,
                    key,
                    value: String::new(),
                    revision: state.revision,
                });
            }
        }
        true
    }

    fn refresh_lease(&self, id: LeaseId) -> Option<KeepAliveResponse> {
        let mut state = self.state.lock();
        self.expire_leases(&mut state);
        let lease = state.leases.get_mut(&id)?;
        lease.deadline = Instant::now() + lease.ttl;
        Some(KeepAliveResponse {
            lease: id,
            ttl_secs: i64::try_from(lease.ttl.as_secs()).unwrap_or(i64::MAX),
        })
    }
}

/// Shared in-process store. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    /// Create an empty store. When called inside a tokio runtime a reaper
    /// task expires leases in the background.
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let inner = Arc::new(Inner {
            state: Mutex::new(State::default()),
            events,
            available: AtomicBool::new(true),
            outage: Mutex::new(CancellationToken::new()),
        });

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(reap_expired_leases(Arc::downgrade(&inner)));
        }

        Self { inner }
    }

    /// Open a client handle with its own close scope
    #[must_use]
    pub fn client(&self) -> MemoryClient {
        MemoryClient {
            store: self.clone(),
            closed: CancellationToken::new(),
        }
    }

    /// Simulate the store becoming unreachable (or reachable again). Going
    /// unavailable ends every open keep-alive and watch stream.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::Release);
        if !available {
            let mut outage = self.inner.outage.lock();
            outage.cancel();
            *outage = CancellationToken::new();
        }
    }

    /// Revoke a lease, deleting its keys. Returns false if it did not exist.
    pub fn revoke_lease(&self, id: LeaseId) -> bool {
        let mut state = self.inner.state.lock();
        self.inner.remove_lease(&mut state, id)
    }

    #[must_use]
    pub fn lease_count(&self) -> usize {
        let mut state = self.inner.state.lock();
        self.inner.expire_leases(&mut state);
        state.leases.len()
    }

    #[must_use]
    pub fn revision(&self) -> i64 {
        self.inner.state.lock().revision
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

async fn reap_expired_leases(inner: Weak<Inner>) {
    loop {
        tokio::time::sleep(REAPER_INTERVAL).await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        {
            let mut state = inner.state.lock();
            inner.expire_leases(&mut state);
        }
    }
}

#[async_trait]
impl StoreConnector for MemoryStore {
    async fn connect(&self, endpoints: &[String]) -> StoreResult<Arc<dyn CoordinationStore>> {
        self.inner.check_available()?;
        debug!(endpoints = ?endpoints, "Connected to in-memory coordination store");
        Ok(Arc::new(self.client()))
    }
}

/// Client handle onto a [`MemoryStore`]
#[derive(Clone)]
pub struct MemoryClient {
    store: MemoryStore,
    closed: CancellationToken,
}

impl MemoryClient {
    fn check(&self) -> StoreResult<()> {
        if self.closed.is_cancelled() {
            return Err(StoreError::Closed);
        }
        self.store.inner.check_available()
    }
}

struct WatchState {
    rx: broadcast::Receiver<WatchEvent>,
    prefix: String,
    closed: CancellationToken,
    outage: CancellationToken,
    done: bool,
}

#[async_trait]
impl CoordinationStore for MemoryClient {
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> StoreResult<()> {
        self.check()?;
        let inner = &self.store.inner;
        let mut state = inner.state.lock();
        inner.expire_leases(&mut state);

        if let Some(id) = lease {
            if !state.leases.contains_key(&id) {
                return Err(StoreError::LeaseNotFound(id));
            }
        }

        state.revision += 1;
        let revision = state.revision;
        let previous = state.kvs.insert(
            key.to_string(),
            KeyValue {
                key: key.to_string(),
                value: value.to_string(),
                lease,
                mod_revision: revision,
            },
        );

        if let Some(old_lease) = previous.and_then(|kv| kv.lease) {
            if Some(old_lease) != lease {
                if let Some(entry) = state.leases.get_mut(&old_lease) {
                    entry.keys.remove(key);
                }
            }
        }
        if let Some(entry) = lease.and_then(|id| state.leases.get_mut(&id)) {
            entry.keys.insert(key.to_string());
        }

        inner.emit(WatchEvent {
            kind: EventKind::Put,
            key: key.to_string(),
            value: value.to_string(),
            revision,
        });
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<KeyValue>> {
        self.check()?;
        let inner = &self.store.inner;
        let mut state = inner.state.lock();
        inner.expire_leases(&mut state);
        Ok(state.kvs.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> StoreResult<u64> {
        self.check()?;
        let inner = &self.store.inner;
        let mut state = inner.state.lock();
        inner.expire_leases(&mut state);

        let Some(removed) = state.kvs.remove(key) else {
            return Ok(0);
        };
        if let Some(entry) = removed.lease.and_then(|id| state.leases.get_mut(&id)) {
            entry.keys.remove(key);
        }

        state.revision += 1;
        inner.emit(WatchEvent {
            kind: EventKind::Delete,
            key: key.to_string(),
            value: String::new(),
            revision: state.revision,
        });
        Ok(1)
    }

    async fn grant_lease(&self, ttl_secs: i64) -> StoreResult<LeaseId> {
        self.check()?;
        let ttl = u64::try_from(ttl_secs)
            .ok()
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .ok_or_else(|| StoreError::InvalidArgument(format!("lease ttl {ttl_secs}s")))?;

        let inner = &self.store.inner;
        let mut state = inner.state.lock();
        inner.expire_leases(&mut state);

        state.next_lease_id += 1;
        let id = LeaseId(state.next_lease_id);
        state.leases.insert(
            id,
            LeaseEntry {
                ttl,
                deadline: Instant::now() + ttl,
                keys: HashSet::new(),
                revoked: CancellationToken::new(),
            },
        );
        Ok(id)
    }

    async fn keep_alive(&self, lease: LeaseId) -> StoreResult<KeepAliveStream> {
        self.check()?;
        let inner = &self.store.inner;
        let (ttl, revoked) = {
            let mut state = inner.state.lock();
            inner.expire_leases(&mut state);
            let entry = state
                .leases
                .get(&lease)
                .ok_or(StoreError::LeaseNotFound(lease))?;
            (entry.ttl, entry.revoked.clone())
        };
        let outage = inner.outage.lock().clone();
        let closed = self.closed.clone();
        let weak = Arc::downgrade(inner);
        let (tx, rx) = mpsc::channel(KEEP_ALIVE_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval((ttl / 3).max(MIN_KEEP_ALIVE_INTERVAL));
            loop {
                tokio::select! {
                    () = closed.cancelled() => break,
                    () = outage.cancelled() => break,
                    () = revoked.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let Some(response) = weak.upgrade().and_then(|inner| inner.refresh_lease(lease))
                else {
                    break;
                };
                if tx.send(response).await.is_err() {
                    break;
                }
            }
            debug!(lease = %lease, "Keep-alive stream closed");
        });

        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|response| (response, rx))
        })
        .boxed())
    }

    async fn watch_prefix(&self, prefix: &str) -> StoreResult<WatchStream> {
        self.check()?;
        let state = WatchState {
            rx: self.store.inner.events.subscribe(),
            prefix: prefix.to_string(),
            closed: self.closed.clone(),
            outage: self.store.inner.outage.lock().clone(),
            done: false,
        };

        Ok(futures::stream::unfold(state, |mut st| async move {
            if st.done {
                return None;
            }
            loop {
                let received = tokio::select! {
                    () = st.closed.cancelled() => return None,
                    () = st.outage.cancelled() => return None,
                    received = st.rx.recv() => received,
                };
                match received {
                    Ok(event) if event.key.starts_with(&st.prefix) => {
                        return Some((Ok(vec![event]), st));
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        st.done = true;
                        return Some((
                            Err(StoreError::Watch(format!(
                                "watcher fell behind by {skipped} events"
                            ))),
                            st,
                        ));
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed())
    }

    async fn close(&self) -> StoreResult<()> {
        self.closed.cancel();
        Ok(())
    }
}
