//! Push fanout
//!
//! Decides per target user whether a push is delivered to a session held by
//! this node or carried to the owning frontend server by the remote pusher.

use bytes::Bytes;
use std::sync::Arc;
use tether_core::route::is_route_valid;
use tether_core::{Payload, Serializer, Server, Session, SessionPool};
use tracing::{debug, error};

use super::rpc::{MultiPush, Push, RemotePusher};
use crate::binding::BindingStorage;
use crate::error::{Error, Result};

pub struct PushDispatcher {
    server: Server,
    session_pool: Arc<dyn SessionPool>,
    rpc: Arc<dyn RemotePusher>,
    serializer: Arc<dyn Serializer>,
    bindings: Option<Arc<dyn BindingStorage>>,
}

impl PushDispatcher {
    #[must_use]
    pub fn new(
        server: Server,
        session_pool: Arc<dyn SessionPool>,
        rpc: Arc<dyn RemotePusher>,
        serializer: Arc<dyn Serializer>,
    ) -> Self {
        Self {
            server,
            session_pool,
            rpc,
            serializer,
            bindings: None,
        }
    }

    /// Without binding storage every non-local user is considered offline
    #[must_use]
    pub fn with_binding_storage(mut self, bindings: Arc<dyn BindingStorage>) -> Self {
        self.bindings = Some(bindings);
        self
    }

    #[must_use]
    pub const fn server(&self) -> &Server {
        &self.server
    }

    /// Cluster-wide online check from the local cache
    #[must_use]
    pub fn is_user_online(&self, uid: u64) -> bool {
        self.bindings
            .as_ref()
            .is_some_and(|bindings| bindings.is_user_online(uid))
    }

    /// Push a message to one user
    ///
    /// A session held by this node is pushed to directly and its failure is
    /// returned as is. Any other user is handed to the remote pusher.
    pub async fn push_msg(
        &self,
        uid: u64,
        route: &str,
        payload: impl Into<Payload>,
        frontend_type: &str,
    ) -> Result<()> {
        let (data, frontend_type) = self.prepare(route, &payload.into(), frontend_type)?;
        let uid = uid.to_string();

        if let Some(session) = self.local_session(&uid, &frontend_type) {
            return session.push(route, data).await.map_err(|e| {
                error!(
                    route = %route,
                    session_id = session.id(),
                    uid = %uid,
                    error = %e,
                    "Session push message error"
                );
                Error::SessionPush { uid, source: e }
            });
        }

        let push = Push {
            route: route.to_string(),
            uid: uid.clone(),
            data,
        };
        self.rpc
            .send_push(&uid, &Server::of_type(frontend_type.as_str()), push)
            .await
            .map_err(|e| {
                error!(
                    route = %route,
                    uid = %uid,
                    frontend_type = %frontend_type,
                    error = %e,
                    "Remote push error"
                );
                Error::RemotePush(e.to_string())
            })
    }

    /// Push one message to many users
    ///
    /// Users without a local session are pushed in a single remote batch,
    /// but only if they are online. On failure the error carries every uid
    /// that still needs the push; a failed batch counts all of its uids as
    /// not delivered.
    pub async fn send_push_to_users(
        &self,
        route: &str,
        payload: impl Into<Payload>,
        uids: &[String],
        frontend_type: &str,
    ) -> Result<()> {
        let (data, frontend_type) = self.prepare(route, &payload.into(), frontend_type)?;

        debug!(
            route = %route,
            frontend_type = %frontend_type,
            users = uids.len(),
            "Pushing to users"
        );

        let mut not_delivered = Vec::new();
        let mut remote = Vec::new();

        for uid in uids {
            if let Some(session) = self.local_session(uid, &frontend_type) {
                if let Err(e) = session.push(route, data.clone()).await {
                    error!(
                        route = %route,
                        session_id = session.id(),
                        uid = %uid,
                        error = %e,
                        "Session push message error"
                    );
                    not_delivered.push(uid.clone());
                }
                continue;
            }

            let Ok(id) = uid.parse::<u64>() else {
                error!(uid = %uid, "Invalid uid");
                not_delivered.push(uid.clone());
                continue;
            };

            if self.is_user_online(id) {
                remote.push(uid.clone());
            } else {
                not_delivered.push(uid.clone());
            }
        }

        if !remote.is_empty() {
            let push = MultiPush {
                route: route.to_string(),
                data,
            };
            if let Err(e) = self
                .rpc
                .push_to_users(remote.clone(), &frontend_type, push)
                .await
            {
                error!(
                    route = %route,
                    uids = ?remote,
                    frontend_type = %frontend_type,
                    error = %e,
                    "Remote push to users error"
                );
                not_delivered.extend(remote);
            }
        }

        if not_delivered.is_empty() {
            Ok(())
        } else {
            Err(Error::PushingToUsers { not_delivered })
        }
    }

    /// Checks shared by both push paths. Returns the encoded payload and the
    /// effective frontend type.
    fn prepare(
        &self,
        route: &str,
        payload: &Payload,
        frontend_type: &str,
    ) -> Result<(Bytes, String)> {
        if !is_route_valid(route) {
            error!(route = %route, "Route undefined");
            return Err(Error::InvalidRoute(route.to_string()));
        }

        let data = payload
            .serialize_or_raw(self.serializer.as_ref())
            .map_err(|e| Error::Serialization(e.to_string()))?;

        let frontend_type = match (frontend_type, self.server.frontend) {
            ("", false) => return Err(Error::FrontendTypeRequired),
            ("", true) => self.server.server_type.clone(),
            (frontend_type, _) => frontend_type.to_string(),
        };

        if self.bindings.as_ref().is_some_and(|bindings| bindings.is_closed()) {
            return Err(Error::RegistryClosed);
        }

        Ok((data, frontend_type))
    }

    fn local_session(&self, uid: &str, frontend_type: &str) -> Option<Arc<dyn Session>> {
        if !self.server.frontend || self.server.server_type != frontend_type {
            return None;
        }
        self.session_pool.get_session_by_uid(uid)
    }
}
