pub mod binding;
pub mod error;
pub mod push;
pub mod store;

pub use binding::{BindingRegistry, BindingStorage, LeasePhase, OnlineUsers};
pub use error::{Error, Result};
pub use push::{LoopbackPusher, MultiPush, Push, PushDispatcher, PushHandler, RemotePusher};
pub use store::{CoordinationStore, MemoryStore, NamespacedStore, StoreConnector, StoreError};
