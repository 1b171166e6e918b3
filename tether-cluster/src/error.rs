//! Error types for cluster module

use thiserror::Error;

use crate::store::StoreError;

/// Cluster error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("Store write failed: {0}")]
    StoreWrite(StoreError),

    #[error("Store read failed: {0}")]
    StoreRead(StoreError),

    #[error("Binding not found for uid {uid} on frontend type {frontend_type}")]
    BindingNotFound { uid: String, frontend_type: String },

    #[error("Binding registry is closed")]
    RegistryClosed,

    #[error("Binding registry has not been started")]
    NotStarted,

    #[error("Lease error: {0}")]
    Lease(String),

    #[error("Failed to connect to coordination store: {0}")]
    Connect(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Invalid route: {0}")]
    InvalidRoute(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Frontend server type must be specified when pushing from a backend server")]
    FrontendTypeRequired,

    #[error("Session push failed for uid {uid}: {source}")]
    SessionPush {
        uid: String,
        #[source]
        source: tether_core::Error,
    },

    #[error("Session not found for uid {0}")]
    SessionNotFound(String),

    #[error("Remote push failed: {0}")]
    RemotePush(String),

    #[error("Failed to push to {} users", not_delivered.len())]
    PushingToUsers { not_delivered: Vec<String> },
}

impl Error {
    /// Uids that still need a push after a partially failed batch
    #[must_use]
    pub fn not_delivered(&self) -> Option<&[String]> {
        match self {
            Self::PushingToUsers { not_delivered } => Some(not_delivered),
            _ => None,
        }
    }
}

/// Result type for cluster operations
pub type Result<T> = std::result::Result<T, Error>;
