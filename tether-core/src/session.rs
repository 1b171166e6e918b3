//! Client sessions held by a frontend node
//!
//! [`Session`] is the push/identity capability of one live client
//! connection. [`SessionPool`] finds sessions by uid and publishes bind and
//! close notifications to [`SessionLifecycleListener`]s.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// A message delivered to a client connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushFrame {
    pub route: String,
    pub data: Bytes,
}

#[async_trait]
pub trait Session: Send + Sync {
    /// Connection-local numeric id
    fn id(&self) -> i64;

    /// User id this session is bound to, if any
    fn uid(&self) -> Option<String>;

    /// Attach a user id. Rebinding to a different uid is rejected.
    fn set_uid(&self, uid: &str) -> Result<()>;

    async fn push(&self, route: &str, data: Bytes) -> Result<()>;

    fn close(&self) {}
}

/// Receives session lifecycle notifications from a [`SessionPool`]
///
/// Hooks are awaited by the publisher and their errors are returned to it.
#[async_trait]
pub trait SessionLifecycleListener: Send + Sync {
    async fn on_after_session_bind(&self, session: Arc<dyn Session>) -> Result<()>;

    async fn on_session_close(&self, session: Arc<dyn Session>) -> Result<()>;
}

pub trait SessionPool: Send + Sync {
    fn get_session_by_uid(&self, uid: &str) -> Option<Arc<dyn Session>>;

    fn subscribe(&self, listener: Arc<dyn SessionLifecycleListener>);

    fn session_count(&self) -> usize;
}

/// Session backed by an unbounded channel drained by the connection writer
pub struct ChannelSession {
    id: i64,
    uid: RwLock<Option<String>>,
    sender: mpsc::UnboundedSender<PushFrame>,
    closed: AtomicBool,
}

impl ChannelSession {
    #[must_use]
    pub fn new(id: i64) -> (Arc<Self>, mpsc::UnboundedReceiver<PushFrame>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let session = Arc::new(Self {
            id,
            uid: RwLock::new(None),
            sender,
            closed: AtomicBool::new(false),
        });
        (session, receiver)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Session for ChannelSession {
    fn id(&self) -> i64 {
        self.id
    }

    fn uid(&self) -> Option<String> {
        self.uid.read().clone()
    }

    fn set_uid(&self, uid: &str) -> Result<()> {
        let mut current = self.uid.write();
        match current.as_deref() {
            Some(existing) if existing != uid => Err(Error::AlreadyBound {
                session_id: self.id,
                uid: existing.to_string(),
            }),
            _ => {
                *current = Some(uid.to_string());
                Ok(())
            }
        }
    }

    async fn push(&self, route: &str, data: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(Error::SessionClosed(self.id));
        }
        self.sender
            .send(PushFrame {
                route: route.to_string(),
                data,
            })
            .map_err(|_| Error::SessionClosed(self.id))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// In-memory session table of a frontend node
#[derive(Default)]
pub struct LocalSessionPool {
    sessions: DashMap<i64, Arc<dyn Session>>,
    by_uid: DashMap<String, Arc<dyn Session>>,
    listeners: RwLock<Vec<Arc<dyn SessionLifecycleListener>>>,
}

impl LocalSessionPool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly accepted, not yet bound session
    pub fn add(&self, session: Arc<dyn Session>) {
        debug!(session_id = session.id(), "Session added");
        self.sessions.insert(session.id(), session);
    }

    /// Bind a session to `uid` and notify listeners
    ///
    /// Every listener runs even if an earlier one fails; the first failure
    /// is returned.
    pub async fn bind(&self, session_id: i64, uid: &str) -> Result<()> {
        let session = self
            .sessions
            .get(&session_id)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;

        session.set_uid(uid)?;
        self.by_uid.insert(uid.to_string(), Arc::clone(&session));

        info!(session_id, uid = %uid, "Session bound");

        let mut first_error = None;
        for listener in self.listeners() {
            if let Err(e) = listener.on_after_session_bind(Arc::clone(&session)).await {
                warn!(session_id, uid = %uid, error = %e, "Session bind hook failed");
                first_error.get_or_insert(e);
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    /// Close a session, drop it from the table and notify listeners
    pub async fn close(&self, session_id: i64) -> Result<()> {
        let (_, session) = self
            .sessions
            .remove(&session_id)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;

        session.close();
        if let Some(uid) = session.uid() {
            // A newer session for the same uid keeps its entry
            self.by_uid.remove_if(&uid, |_, current| current.id() == session_id);
        }

        info!(session_id, uid = ?session.uid(), "Session closed");

        let mut first_error = None;
        for listener in self.listeners() {
            if let Err(e) = listener.on_session_close(Arc::clone(&session)).await {
                warn!(session_id, error = %e, "Session close hook failed");
                first_error.get_or_insert(e);
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    fn listeners(&self) -> Vec<Arc<dyn SessionLifecycleListener>> {
        self.listeners.read().clone()
    }
}

impl SessionPool for LocalSessionPool {
    fn get_session_by_uid(&self, uid: &str) -> Option<Arc<dyn Session>> {
        self.by_uid.get(uid).map(|s| Arc::clone(s.value()))
    }

    fn subscribe(&self, listener: Arc<dyn SessionLifecycleListener>) {
        self.listeners.write().push(listener);
    }

    fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingListener {
        binds: AtomicUsize,
        closes: AtomicUsize,
        fail_bind: bool,
    }

    #[async_trait]
    impl SessionLifecycleListener for CountingListener {
        async fn on_after_session_bind(&self, _session: Arc<dyn Session>) -> Result<()> {
            self.binds.fetch_add(1, Ordering::SeqCst);
            if self.fail_bind {
                return Err(Error::Hook("store unavailable".to_string()));
            }
            Ok(())
        }

        async fn on_session_close(&self, _session: Arc<dyn Session>) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_channel_session_push() {
        let (session, mut rx) = ChannelSession::new(1);
        session
            .push("room.onChat", Bytes::from_static(b"hi"))
            .await
            .unwrap();

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.route, "room.onChat");
        assert_eq!(&frame.data[..], b"hi");
    }

    #[tokio::test]
    async fn test_closed_session_rejects_push() {
        let (session, _rx) = ChannelSession::new(1);
        session.close();
        let err = session.push("room.onChat", Bytes::new()).await.unwrap_err();
        assert!(matches!(err, Error::SessionClosed(1)));
    }

    #[tokio::test]
    async fn test_dropped_receiver_rejects_push() {
        let (session, rx) = ChannelSession::new(2);
        drop(rx);
        assert!(session.push("room.onChat", Bytes::new()).await.is_err());
    }

    #[test]
    fn test_rebind_to_other_uid_rejected() {
        let (session, _rx) = ChannelSession::new(3);
        session.set_uid("100").unwrap();
        session.set_uid("100").unwrap();
        assert!(matches!(
            session.set_uid("200"),
            Err(Error::AlreadyBound { session_id: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_pool_bind_and_close_notify_listeners() {
        let pool = LocalSessionPool::new();
        let listener = Arc::new(CountingListener::default());
        pool.subscribe(listener.clone());

        let (session, _rx) = ChannelSession::new(7);
        pool.add(session);
        pool.bind(7, "42").await.unwrap();

        assert_eq!(listener.binds.load(Ordering::SeqCst), 1);
        assert_eq!(pool.get_session_by_uid("42").unwrap().id(), 7);

        pool.close(7).await.unwrap();
        assert_eq!(listener.closes.load(Ordering::SeqCst), 1);
        assert!(pool.get_session_by_uid("42").is_none());
        assert_eq!(pool.session_count(), 0);
    }

    #[tokio::test]
    async fn test_bind_hook_error_is_returned() {
        let pool = LocalSessionPool::new();
        let failing = Arc::new(CountingListener {
            fail_bind: true,
            ..Default::default()
        });
        let healthy = Arc::new(CountingListener::default());
        pool.subscribe(failing.clone());
        pool.subscribe(healthy.clone());

        let (session, _rx) = ChannelSession::new(1);
        pool.add(session);

        let err = pool.bind(1, "42").await.unwrap_err();
        assert!(matches!(err, Error::Hook(_)));
        // Later listeners still run
        assert_eq!(healthy.binds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_closing_old_session_keeps_newer_binding() {
        let pool = LocalSessionPool::new();
        let (old, _rx1) = ChannelSession::new(1);
        let (new, _rx2) = ChannelSession::new(2);
        pool.add(old);
        pool.add(new);

        pool.bind(1, "42").await.unwrap();
        pool.bind(2, "42").await.unwrap();
        pool.close(1).await.unwrap();

        assert_eq!(pool.get_session_by_uid("42").unwrap().id(), 2);
    }

    #[tokio::test]
    async fn test_bind_unknown_session() {
        let pool = LocalSessionPool::new();
        assert!(matches!(
            pool.bind(99, "42").await,
            Err(Error::SessionNotFound(_))
        ));
    }
}
