//! Messaging settings record shared with the rest of the system.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-tenant connection status as other subsystems see it.
///
/// Written only by the connection manager as a side effect of lifecycle
/// transitions; read by anyone who needs status without touching in-memory
/// connection state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagingSettings {
    pub connected: bool,
    #[serde(default)]
    pub phone_number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_connected: Option<DateTime<Utc>>,
}

impl MessagingSettings {
    /// Connected as `phone_number`, stamped `at`.
    #[must_use]
    pub fn connected(phone_number: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            connected: true,
            phone_number: phone_number.into(),
            last_connected: Some(at),
        }
    }

    /// Mark disconnected and forget the number, keeping `last_connected`.
    #[must_use]
    pub fn cleared(self) -> Self {
        Self {
            connected: false,
            phone_number: String::new(),
            last_connected: self.last_connected,
        }
    }

    /// Mark disconnected but keep the number (pairing still on record).
    #[must_use]
    pub fn offline(self) -> Self {
        Self {
            connected: false,
            ..self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serializes_camel_case() {
        let settings = MessagingSettings {
            connected: true,
            phone_number: "923001234567".to_string(),
            last_connected: None,
        };
        let json = serde_json::to_value(&settings).unwrap();
        assert_eq!(json["phoneNumber"], "923001234567");
        assert!(json.get("lastConnected").is_none());
    }

    #[test]
    fn test_cleared_keeps_last_connected() {
        let at = Utc::now();
        let cleared = MessagingSettings::connected("923001234567", at).cleared();
        assert!(!cleared.connected);
        assert!(cleared.phone_number.is_empty());
        assert_eq!(cleared.last_connected, Some(at));
    }
}
