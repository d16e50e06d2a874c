//! Core abstractions for per-tenant messaging sessions.
//!
//! This crate provides the fundamental building blocks:
//! - `TenantId` - Identifies an isolated tenant (a school)
//! - `Credentials` / `AuthKey` - Protocol auth state addressing
//! - `MessagingSettings` - Connection status visible to the rest of the system
//! - Storage and protocol capability traits
//! - Result shapes returned to the HTTP layer

pub mod api;
pub mod auth;
pub mod config;
pub mod protocol;
pub mod settings;
pub mod tenant;
pub mod traits;

#[cfg(feature = "testing")]
pub mod testing;

pub use api::{ConnectOutcome, ConnectResponse, DisconnectResponse, SendResponse, StatusResponse};
pub use auth::{AuthKey, Credentials, KeyUpdate};
pub use config::{ConfigError, MessagingConfig, ReconnectPolicy};
pub use protocol::{
    ConnectionUpdate, DisconnectReason, LinkState, ProtocolVersion, SocketEvent,
    phone_number_from_identity,
};
pub use settings::MessagingSettings;
pub use tenant::TenantId;
pub use traits::{
    IdentityGenerator, KeyStore, OpenedSocket, ProtocolClient, ProtocolError, ProtocolSocket,
    SessionRecord, SessionStorage, SettingsStorage, SocketConfig, StorageError,
};
