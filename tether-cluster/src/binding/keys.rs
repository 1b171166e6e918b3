//! Binding key layout: `bindings/{frontend_type}/{uid}` -> server id

use crate::error::{Error, Result};

/// Prefix watched to follow bindings of every frontend type
pub const BINDINGS_PREFIX: &str = "bindings/";

#[must_use]
pub fn user_binding_key(uid: &str, frontend_type: &str) -> String {
    format!("{BINDINGS_PREFIX}{frontend_type}/{uid}")
}

/// Extract the uid from a binding key
pub fn parse_bindings_key(key: &str) -> Result<&str> {
    match key.split('/').collect::<Vec<_>>().as_slice() {
        ["bindings", _frontend_type, uid] => Ok(*uid),
        _ => Err(Error::Serialization(format!(
            "error parsing bindings key {key}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_binding_key() {
        assert_eq!(user_binding_key("42", "connector"), "bindings/connector/42");
    }

    #[test]
    fn test_parse_bindings_key() {
        assert_eq!(parse_bindings_key("bindings/connector/42").unwrap(), "42");
        assert_eq!(parse_bindings_key("bindings/gate/alice").unwrap(), "alice");
    }

    #[test]
    fn test_parse_malformed_keys() {
        assert!(parse_bindings_key("bindings/42").is_err());
        assert!(parse_bindings_key("bindings/connector/42/extra").is_err());
        assert!(parse_bindings_key("servers/connector/42").is_err());
        assert!(parse_bindings_key("").is_err());
    }
}
