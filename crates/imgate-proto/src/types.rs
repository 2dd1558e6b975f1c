//! Core identifier types shared across the gateway.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Logical user identity, as asserted by a verified bearer token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Create an identity from any string-like value.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the identity as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Identity {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Identity {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_display() {
        let id = Identity::new("10042");
        assert_eq!(id.to_string(), "10042");
        assert_eq!(id.as_str(), "10042");
    }

    #[test]
    fn test_identity_from_conversions() {
        assert_eq!(Identity::from("alice"), Identity::new("alice".to_string()));
        assert_eq!(Identity::from(String::from("bob")).as_str(), "bob");
    }

    #[test]
    fn test_identity_serde_transparent() {
        let id = Identity::new("u-1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"u-1\"");
        let parsed: Identity = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }
}
