//! Events and values exchanged with the external protocol library.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::Credentials;

/// Protocol version advertised by the messaging service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ProtocolVersion {
    #[must_use]
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Link state carried by a connection update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Connecting,
    Open,
    Close,
}

/// Why the protocol closed a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    /// The account unlinked this device. Terminal.
    LoggedOut,
    /// The service asked for a fresh socket (common right after pairing).
    RestartRequired,
    ConnectionLost,
    ConnectionReplaced,
    ConnectionClosed,
    Other(u16),
}

impl DisconnectReason {
    /// Map the protocol's numeric close code.
    #[must_use]
    pub const fn from_status_code(code: u16) -> Self {
        match code {
            401 => Self::LoggedOut,
            515 => Self::RestartRequired,
            408 => Self::ConnectionLost,
            440 => Self::ConnectionReplaced,
            428 => Self::ConnectionClosed,
            other => Self::Other(other),
        }
    }

    /// Whether the pairing is gone and retrying is pointless.
    #[must_use]
    pub const fn is_logged_out(self) -> bool {
        matches!(self, Self::LoggedOut)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LoggedOut => f.write_str("logged out"),
            Self::RestartRequired => f.write_str("restart required"),
            Self::ConnectionLost => f.write_str("connection lost"),
            Self::ConnectionReplaced => f.write_str("connection replaced"),
            Self::ConnectionClosed => f.write_str("connection closed"),
            Self::Other(code) => write!(f, "closed with status {code}"),
        }
    }
}

/// A connection status update emitted by a socket.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionUpdate {
    /// Raw pairing challenge, when one was issued.
    pub qr: Option<String>,
    pub state: Option<LinkState>,
    pub close_reason: Option<DisconnectReason>,
}

impl ConnectionUpdate {
    #[must_use]
    pub fn qr(challenge: impl Into<String>) -> Self {
        Self {
            qr: Some(challenge.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn open() -> Self {
        Self {
            state: Some(LinkState::Open),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn closed(reason: DisconnectReason) -> Self {
        Self {
            state: Some(LinkState::Close),
            close_reason: Some(reason),
            ..Self::default()
        }
    }
}

/// Event emitted by a live socket.
#[derive(Debug)]
pub enum SocketEvent {
    /// Credentials rotated. If `persisted` is set, the emitter waits on it
    /// until the new credentials have been written through.
    CredentialsUpdated {
        credentials: Credentials,
        persisted: Option<oneshot::Sender<()>>,
    },
    Connection(ConnectionUpdate),
}

/// Phone number portion of a paired identity.
///
/// `"923001234567:12@s.whatsapp.net"` yields `"923001234567"`.
#[must_use]
pub fn phone_number_from_identity(identity: &str) -> String {
    identity
        .split([':', '@'])
        .next()
        .unwrap_or_default()
        .to_string()
}
