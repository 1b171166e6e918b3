pub mod config;
pub mod error;
pub mod logging;
pub mod route;
pub mod serialize;
pub mod server;
pub mod session;

pub use config::Config;
pub use error::{Error, Result};
pub use route::Route;
pub use serialize::{JsonSerializer, Payload, Serializer};
pub use server::Server;
pub use session::{
    ChannelSession, LocalSessionPool, PushFrame, Session, SessionLifecycleListener, SessionPool,
};
