//! Message routes
//!
//! A route names the handler a pushed message is addressed to. It is either
//! `service.method` or `serverType.service.method`.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use crate::error::{Error, Result};

static SEGMENT_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"^[A-Za-z0-9_\-]+$").expect("Invalid route segment regex")
});

/// Parsed route
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    pub server_type: Option<String>,
    pub service: String,
    pub method: String,
}

impl Route {
    pub fn parse(route: &str) -> Result<Self> {
        let segments: Vec<&str> = route.split('.').collect();

        if let Some(bad) = segments.iter().find(|s| !SEGMENT_REGEX.is_match(s)) {
            return Err(Error::InvalidRoute(format!(
                "{route}: invalid segment {bad:?}"
            )));
        }

        match segments.as_slice() {
            [server_type, service, method] => Ok(Self {
                server_type: Some((*server_type).to_string()),
                service: (*service).to_string(),
                method: (*method).to_string(),
            }),
            [service, method] => Ok(Self {
                server_type: None,
                service: (*service).to_string(),
                method: (*method).to_string(),
            }),
            _ => Err(Error::InvalidRoute(format!(
                "{route}: expected 2 or 3 segments, got {}",
                segments.len()
            ))),
        }
    }

    /// `service.method` without the server type
    #[must_use]
    pub fn short(&self) -> String {
        format!("{}.{}", self.service, self.method)
    }
}

impl FromStr for Route {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.server_type {
            Some(server_type) => write!(f, "{server_type}.{}.{}", self.service, self.method),
            None => write!(f, "{}.{}", self.service, self.method),
        }
    }
}

/// Whether `route` is well formed
#[must_use]
pub fn is_route_valid(route: &str) -> bool {
    Route::parse(route).is_ok()
}
