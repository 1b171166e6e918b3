//! Receiving side of remote pushes on a frontend server

use std::sync::Arc;
use tether_core::SessionPool;
use tracing::{debug, warn};

use super::rpc::{MultiPush, Push};
use crate::error::{Error, Result};

pub struct PushHandler {
    session_pool: Arc<dyn SessionPool>,
}

impl PushHandler {
    #[must_use]
    pub fn new(session_pool: Arc<dyn SessionPool>) -> Self {
        Self { session_pool }
    }

    /// Deliver a single-user push to the local session of `push.uid`
    pub async fn handle_push(&self, push: Push) -> Result<()> {
        let Push { route, uid, data } = push;
        let session = self
            .session_pool
            .get_session_by_uid(&uid)
            .ok_or_else(|| Error::SessionNotFound(uid.clone()))?;

        session
            .push(&route, data)
            .await
            .map_err(|e| Error::SessionPush { uid, source: e })
    }

    /// Deliver a batch push and return the uids that could not be delivered
    pub async fn handle_multi_push(&self, uids: &[String], push: &MultiPush) -> Vec<String> {
        let mut failed = Vec::new();
        for uid in uids {
            let Some(session) = self.session_pool.get_session_by_uid(uid) else {
                debug!(uid = %uid, route = %push.route, "No local session for multi push");
                failed.push(uid.clone());
                continue;
            };
            if let Err(e) = session.push(&push.route, push.data.clone()).await {
                warn!(uid = %uid, route = %push.route, error = %e, "Multi push delivery failed");
                failed.push(uid.clone());
            }
        }
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tether_core::{ChannelSession, LocalSessionPool};

    async fn pool_with(uids: &[&str]) -> (Arc<LocalSessionPool>, Vec<tokio::sync::mpsc::UnboundedReceiver<tether_core::PushFrame>>) {
        let pool = Arc::new(LocalSessionPool::new());
        let mut receivers = Vec::new();
        for (id, uid) in (1_i64..).zip(uids) {
            let (session, rx) = ChannelSession::new(id);
            pool.add(session);
            pool.bind(id, uid).await.unwrap();
            receivers.push(rx);
        }
        (pool, receivers)
    }

    #[tokio::test]
    async fn test_handle_push_delivers_to_session() {
        let (pool, mut receivers) = pool_with(&["7"]).await;
        let handler = PushHandler::new(pool);

        handler
            .handle_push(Push {
                route: "room.notify".to_string(),
                uid: "7".to_string(),
                data: Bytes::from_static(b"hi"),
            })
            .await
            .unwrap();

        let frame = receivers[0].recv().await.unwrap();
        assert_eq!(frame.route, "room.notify");
        assert_eq!(frame.data, Bytes::from_static(b"hi"));
    }

    #[tokio::test]
    async fn test_handle_push_without_session() {
        let handler = PushHandler::new(Arc::new(LocalSessionPool::new()));
        let err = handler
            .handle_push(Push {
                route: "room.notify".to_string(),
                uid: "7".to_string(),
                data: Bytes::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SessionNotFound(uid) if uid == "7"));
    }

    #[tokio::test]
    async fn test_handle_multi_push_reports_missing() {
        let (pool, mut receivers) = pool_with(&["1", "3"]).await;
        let handler = PushHandler::new(pool);
        let push = MultiPush {
            route: "room.notify".to_string(),
            data: Bytes::from_static(b"x"),
        };

        let uids: Vec<String> = ["1", "2", "3"].iter().map(|s| (*s).to_string()).collect();
        let failed = handler.handle_multi_push(&uids, &push).await;

        assert_eq!(failed, vec!["2".to_string()]);
        for rx in &mut receivers {
            assert_eq!(rx.recv().await.unwrap().data, Bytes::from_static(b"x"));
        }
    }
}
