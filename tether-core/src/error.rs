use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Session error: {0}")]
    Session(String),

    #[error("Session {0} is closed")]
    SessionClosed(i64),

    #[error("Session {session_id} is already bound to uid {uid}")]
    AlreadyBound { session_id: i64, uid: String },

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session lifecycle hook failed: {0}")]
    Hook(String),

    #[error("Invalid route: {0}")]
    InvalidRoute(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
