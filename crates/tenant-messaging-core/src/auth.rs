//! Protocol auth state: credentials and composite key addressing.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Opaque identity/device key material proving an established pairing.
///
/// The protocol library owns the shape; this side only stores and returns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credentials(Value);

impl Credentials {
    /// Wrap a raw credentials blob.
    #[must_use]
    pub const fn new(value: Value) -> Self {
        Self(value)
    }

    /// An empty credentials object, used when identity generation fails.
    #[must_use]
    pub fn empty() -> Self {
        Self(Value::Object(Map::new()))
    }

    /// Whether this is the empty placeholder (or not an object at all).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.as_object().is_none_or(Map::is_empty)
    }

    /// Borrow the raw blob.
    #[must_use]
    pub const fn as_value(&self) -> &Value {
        &self.0
    }

    /// Consume into the raw blob.
    #[must_use]
    pub fn into_value(self) -> Value {
        self.0
    }
}

/// Address of one field in a tenant's session record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AuthKey {
    /// The credentials slot.
    Credentials,
    /// A protocol key, stored under `"{category}-{id}"`.
    Protocol { category: String, id: String },
}

impl AuthKey {
    /// Address a protocol key.
    #[must_use]
    pub fn protocol(category: impl Into<String>, id: impl Into<String>) -> Self {
        Self::Protocol {
            category: category.into(),
            id: id.into(),
        }
    }

    /// The composite storage key, or `None` for the credentials slot.
    #[must_use]
    pub fn storage_key(&self) -> Option<String> {
        match self {
            Self::Credentials => None,
            Self::Protocol { category, id } => Some(format!("{category}-{id}")),
        }
    }
}

impl fmt::Display for AuthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Credentials => f.write_str("creds"),
            Self::Protocol { category, id } => write!(f, "{category}-{id}"),
        }
    }
}

/// One key-store mutation requested by the protocol library.
///
/// `value: None` means the key has become invalid and must be removed.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyUpdate {
    pub category: String,
    pub id: String,
    pub value: Option<Value>,
}

impl KeyUpdate {
    /// Store `value` under `category`/`id`.
    #[must_use]
    pub fn set(category: impl Into<String>, id: impl Into<String>, value: Value) -> Self {
        Self {
            category: category.into(),
            id: id.into(),
            value: Some(value),
        }
    }

    /// Remove `category`/`id`.
    #[must_use]
    pub fn remove(category: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            id: id.into(),
            value: None,
        }
    }

    /// The key this update addresses.
    #[must_use]
    pub fn key(&self) -> AuthKey {
        AuthKey::protocol(self.category.clone(), self.id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_composite_key_keeps_hyphenated_category() {
        let key = AuthKey::protocol("pre-key", "17");
        assert_eq!(key.storage_key().as_deref(), Some("pre-key-17"));
        assert_eq!(AuthKey::Credentials.storage_key(), None);
    }

    #[test]
    fn test_empty_credentials() {
        assert!(Credentials::empty().is_empty());
        assert!(Credentials::new(Value::Null).is_empty());
        assert!(!Credentials::new(json!({"noiseKey": "abc"})).is_empty());
    }

    #[test]
    fn test_key_update_remove_has_no_value() {
        let update = KeyUpdate::remove("session", "alice.0");
        assert!(update.value.is_none());
        assert_eq!(update.key(), AuthKey::protocol("session", "alice.0"));
    }
}
