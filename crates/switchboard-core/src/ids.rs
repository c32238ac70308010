//! Connection identifier.
//!
//! Ids are either supplied by the application at admission time or generated
//! here as UUID v7 (time-ordered) via [`uuid::Uuid::now_v7`].

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a live connection.
///
/// Immutable once assigned. Uniqueness within a registry is enforced by the
/// registry, not by this type.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Generate a fresh id (UUID v7).
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Use an externally chosen id, falling back to a generated one when empty.
    #[must_use]
    pub fn from_supplied(id: Option<String>) -> Self {
        match id {
            Some(id) if !id.is_empty() => Self(id),
            _ => Self::new(),
        }
    }

    /// Return the inner string as a slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume self and return the inner `String`.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for ConnectionId {
    type Target = str;
    fn deref(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for ConnectionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::borrow::Borrow<str> for ConnectionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<ConnectionId> for String {
    fn from(id: ConnectionId) -> Self {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_is_uuid_v7() {
        let id = ConnectionId::new();
        let parsed = Uuid::parse_str(id.as_str()).expect("should be valid UUID");
        assert_eq!(parsed.get_version(), Some(uuid::Version::SortRand));
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }

    #[test]
    fn supplied_id_is_kept() {
        let id = ConnectionId::from_supplied(Some("user-42".into()));
        assert_eq!(id.as_str(), "user-42");
    }

    #[test]
    fn empty_supplied_id_is_generated() {
        let id = ConnectionId::from_supplied(Some(String::new()));
        assert!(Uuid::parse_str(id.as_str()).is_ok());
        let id = ConnectionId::from_supplied(None);
        assert!(Uuid::parse_str(id.as_str()).is_ok());
    }

    #[test]
    fn borrow_as_str_for_map_lookups() {
        use std::collections::HashMap;
        let mut map = HashMap::new();
        let _ = map.insert(ConnectionId::from("c1"), 1);
        assert_eq!(map.get("c1"), Some(&1));
    }

    #[test]
    fn display_and_serde() {
        let id = ConnectionId::from("display-me");
        assert_eq!(format!("{id}"), "display-me");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"display-me\"");
        let back: ConnectionId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
