use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::ServerConfig;

/// Identity of a server process in the cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub id: String,
    #[serde(rename = "type")]
    pub server_type: String,
    pub frontend: bool,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Server {
    #[must_use]
    pub fn new(id: impl Into<String>, server_type: impl Into<String>, frontend: bool) -> Self {
        Self {
            id: id.into(),
            server_type: server_type.into(),
            frontend,
            metadata: HashMap::new(),
        }
    }

    /// Descriptor addressing any server of a type, used as a push target
    #[must_use]
    pub fn of_type(server_type: impl Into<String>) -> Self {
        Self::new(String::new(), server_type, true)
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

impl From<&ServerConfig> for Server {
    fn from(config: &ServerConfig) -> Self {
        Self {
            id: config.id.clone(),
            server_type: config.server_type.clone(),
            frontend: config.frontend,
            metadata: config.metadata.clone(),
        }
    }
}
