//! Result shapes returned to the HTTP layer.
//!
//! Every manager operation returns one of these instead of an error, so the
//! caller can serialize the value as-is.

use serde::{Deserialize, Serialize};

/// Error text surfaced when a pairing attempt hits its bound.
pub const TIMEOUT_ERROR: &str = "Connection timed out";

/// Error text surfaced when a send finds no usable connection.
pub const NOT_CONNECTED_ERROR: &str = "WhatsApp not connected";

/// Settled result of one connect attempt, shared by every coalesced caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// A pairing challenge is ready to scan (rendered image).
    Qr(String),
    /// The session is open as this phone number.
    Connected { phone_number: String },
    /// Neither a challenge nor an open arrived in time.
    TimedOut,
    /// The attempt failed before settling.
    Failed(String),
}

/// Response of `connect`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qr_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ConnectResponse {
    /// Already (or newly) connected.
    #[must_use]
    pub fn connected(phone_number: impl Into<String>) -> Self {
        Self {
            success: true,
            connected: Some(true),
            phone_number: Some(phone_number.into()),
            ..Self::default()
        }
    }

    /// Waiting for the user to scan `qr_code`.
    #[must_use]
    pub fn qr(qr_code: impl Into<String>) -> Self {
        Self {
            success: true,
            qr_code: Some(qr_code.into()),
            ..Self::default()
        }
    }

    /// Failed with `error`.
    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

impl From<ConnectOutcome> for ConnectResponse {
    fn from(outcome: ConnectOutcome) -> Self {
        match outcome {
            ConnectOutcome::Qr(qr) => Self::qr(qr),
            ConnectOutcome::Connected { phone_number } => Self::connected(phone_number),
            ConnectOutcome::TimedOut => Self::failed(TIMEOUT_ERROR),
            ConnectOutcome::Failed(error) => Self::failed(error),
        }
    }
}

/// Response of `get_status`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qr_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StatusResponse {
    /// Live authenticated connection.
    #[must_use]
    pub fn connected(phone_number: impl Into<String>) -> Self {
        Self {
            connected: true,
            phone_number: Some(phone_number.into()),
            ..Self::default()
        }
    }

    /// A pairing challenge is waiting to be scanned.
    #[must_use]
    pub fn waiting_scan(qr_code: impl Into<String>) -> Self {
        Self {
            connected: false,
            qr_code: Some(qr_code.into()),
            status: Some("waiting_scan".to_string()),
            ..Self::default()
        }
    }

    /// Previously connected; a reconnect is underway.
    #[must_use]
    pub fn reconnecting(phone_number: impl Into<String>) -> Self {
        Self {
            connected: true,
            phone_number: Some(phone_number.into()),
            message: Some("reconnecting".to_string()),
            ..Self::default()
        }
    }

    /// Automatic reconnects gave up; a new connect is needed.
    #[must_use]
    pub fn reconnect_failed(reason: impl Into<String>) -> Self {
        Self {
            connected: false,
            phone_number: Some(String::new()),
            status: Some("reconnect_failed".to_string()),
            message: Some(reason.into()),
            ..Self::default()
        }
    }

    /// Nothing known about this tenant.
    #[must_use]
    pub fn disconnected() -> Self {
        Self {
            connected: false,
            phone_number: Some(String::new()),
            ..Self::default()
        }
    }
}

/// Response of `disconnect`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl DisconnectResponse {
    #[must_use]
    pub fn ok() -> Self {
        Self {
            success: true,
            message: Some("Disconnected successfully".to_string()),
        }
    }

    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
        }
    }
}

/// Response of `send_message`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SendResponse {
    #[must_use]
    pub fn sent(message_id: impl Into<String>) -> Self {
        Self {
            success: true,
            message_id: Some(message_id.into()),
            error: None,
        }
    }

    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            message_id: None,
            error: Some(error.into()),
        }
    }

    #[must_use]
    pub fn not_connected() -> Self {
        Self::failed(NOT_CONNECTED_ERROR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_outcome_maps_to_error() {
        let response = ConnectResponse::from(ConnectOutcome::TimedOut);
        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some(TIMEOUT_ERROR));
    }

    #[test]
    fn test_qr_response_omits_absent_fields() {
        let json = serde_json::to_value(ConnectResponse::qr("data:image/svg+xml;base64,AA")).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["qrCode"], "data:image/svg+xml;base64,AA");
        assert!(json.get("connected").is_none());
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_disconnected_status_shape() {
        let json = serde_json::to_value(StatusResponse::disconnected()).unwrap();
        assert_eq!(json, serde_json::json!({"connected": false, "phoneNumber": ""}));
    }
}
