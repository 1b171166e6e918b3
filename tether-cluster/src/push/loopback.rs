//! In-process remote pusher
//!
//! Resolves the owning frontend server of a uid through binding storage and
//! calls that server's [`PushHandler`] directly. Lets several nodes share
//! one process.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tether_core::Server;
use tracing::warn;

use super::handler::PushHandler;
use super::rpc::{MultiPush, Push, RemotePusher};
use crate::binding::BindingStorage;
use crate::error::{Error, Result};

pub struct LoopbackPusher {
    handlers: DashMap<String, Arc<PushHandler>>,
    bindings: Arc<dyn BindingStorage>,
}

impl LoopbackPusher {
    #[must_use]
    pub fn new(bindings: Arc<dyn BindingStorage>) -> Self {
        Self {
            handlers: DashMap::new(),
            bindings,
        }
    }

    /// Route pushes for `server_id` to `handler`
    pub fn register(&self, server_id: impl Into<String>, handler: Arc<PushHandler>) {
        self.handlers.insert(server_id.into(), handler);
    }

    pub fn deregister(&self, server_id: &str) {
        self.handlers.remove(server_id);
    }

    fn handler(&self, server_id: &str) -> Result<Arc<PushHandler>> {
        self.handlers
            .get(server_id)
            .map(|handler| Arc::clone(handler.value()))
            .ok_or_else(|| Error::RemotePush(format!("no push handler for server {server_id}")))
    }
}

#[async_trait]
impl RemotePusher for LoopbackPusher {
    async fn send_push(&self, uid: &str, target: &Server, push: Push) -> Result<()> {
        let server_id = if target.id.is_empty() {
            self.bindings
                .get_user_frontend_id(uid, &target.server_type)
                .await?
        } else {
            target.id.clone()
        };
        self.handler(&server_id)?.handle_push(push).await
    }

    async fn push_to_users(
        &self,
        uids: Vec<String>,
        frontend_type: &str,
        push: MultiPush,
    ) -> Result<()> {
        let mut by_server: HashMap<String, Vec<String>> = HashMap::new();
        let mut failed = Vec::new();

        for uid in uids {
            match self.bindings.get_user_frontend_id(&uid, frontend_type).await {
                Ok(server_id) => by_server.entry(server_id).or_default().push(uid),
                Err(e) => {
                    warn!(uid = %uid, frontend_type = %frontend_type, error = %e, "Failed to resolve frontend server");
                    failed.push(uid);
                }
            }
        }

        for (server_id, uids) in by_server {
            match self.handler(&server_id) {
                Ok(handler) => failed.extend(handler.handle_multi_push(&uids, &push).await),
                Err(e) => {
                    warn!(server_id = %server_id, error = %e, "Dropping multi push");
                    failed.extend(uids);
                }
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(Error::RemotePush(format!(
                "{} users unreachable on {frontend_type}",
                failed.len()
            )))
        }
    }
}
