//! Push delivery to users anywhere in the cluster

pub mod dispatcher;
pub mod handler;
pub mod loopback;
pub mod rpc;

pub use dispatcher::PushDispatcher;
pub use handler::PushHandler;
pub use loopback::LoopbackPusher;
pub use rpc::{MultiPush, Push, RemotePusher};
