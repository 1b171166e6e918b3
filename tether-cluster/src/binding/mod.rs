//! Distributed uid -> frontend server bindings

pub mod keys;
pub mod lease;
pub mod online;
pub mod registry;

use async_trait::async_trait;

use crate::error::Result;

pub use keys::{parse_bindings_key, user_binding_key, BINDINGS_PREFIX};
pub use lease::LeasePhase;
pub use online::OnlineUsers;
pub use registry::BindingRegistry;

/// Where users are bound, as seen by push routing
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BindingStorage: Send + Sync {
    /// Publish that `uid` is bound to this server
    async fn put_binding(&self, uid: &str) -> Result<()>;

    /// Id of the `frontend_type` server holding `uid`'s session
    async fn get_user_frontend_id(&self, uid: &str, frontend_type: &str) -> Result<String>;

    /// Cached, possibly stale, cluster-wide online check
    fn is_user_online(&self, uid: u64) -> bool;

    fn is_closed(&self) -> bool;
}
