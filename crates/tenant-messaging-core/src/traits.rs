//! Core traits for storage and the protocol capability.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::{Credentials, KeyUpdate, MessagingSettings, ProtocolVersion, SocketEvent, TenantId};

/// Persisted session record, one per tenant.
///
/// Created lazily on the first write, mutated on every credential rotation
/// and key-store change, deleted on logout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub tenant_id: TenantId,
    pub credentials: Option<Credentials>,
    /// Protocol keys by `"{category}-{id}"`.
    #[serde(default)]
    pub keys: BTreeMap<String, Value>,
    /// Creation timestamp (Unix epoch seconds).
    pub created_at: i64,
    /// Last update timestamp.
    pub updated_at: i64,
}

/// Storage error.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Session not found: {0}")]
    NotFound(TenantId),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Storage error: {0}")]
    Internal(String),
}

/// Trait for session record backends.
///
/// A session record holds one credentials blob and an unbounded map of
/// protocol keys addressed by composite `"{category}-{id}"` strings. Every
/// write is a single-field upsert.
#[async_trait]
pub trait SessionStorage: Send + Sync {
    /// Load the credentials blob, if a record exists and has one.
    async fn load_credentials(&self, tenant: &TenantId)
    -> Result<Option<Credentials>, StorageError>;

    /// Replace the credentials blob, creating the record if needed.
    async fn save_credentials(
        &self,
        tenant: &TenantId,
        credentials: &Credentials,
    ) -> Result<(), StorageError>;

    /// Load one protocol key.
    async fn load_key(&self, tenant: &TenantId, key: &str) -> Result<Option<Value>, StorageError>;

    /// Upsert one protocol key, creating the record if needed.
    async fn save_key(&self, tenant: &TenantId, key: &str, value: &Value)
    -> Result<(), StorageError>;

    /// Unset one protocol key. Never removes the record itself.
    async fn remove_key(&self, tenant: &TenantId, key: &str) -> Result<(), StorageError>;

    /// Whether a session record exists for the tenant.
    async fn exists(&self, tenant: &TenantId) -> Result<bool, StorageError>;

    /// Delete the whole session record.
    async fn delete(&self, tenant: &TenantId) -> Result<(), StorageError>;
}

/// Trait for the messaging settings collaborator.
#[async_trait]
pub trait SettingsStorage: Send + Sync {
    /// Get the tenant's settings record.
    async fn get_settings(&self, tenant: &TenantId)
    -> Result<Option<MessagingSettings>, StorageError>;

    /// Replace the tenant's settings record.
    async fn put_settings(
        &self,
        tenant: &TenantId,
        settings: &MessagingSettings,
    ) -> Result<(), StorageError>;
}

/// Protocol error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Failed to fetch protocol version: {0}")]
    Version(String),
    #[error("Failed to open socket: {0}")]
    Open(String),
    #[error("Identity generation failed: {0}")]
    Identity(String),
    #[error("Send failed: {0}")]
    Send(String),
    #[error("Socket closed")]
    Closed,
}

/// Per-tenant key store handed to the protocol library.
///
/// Both operations are infallible from the library's point of view:
/// persistence failures degrade to "absent".
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Fetch the keys of `category` among `ids`; missing ids are omitted.
    async fn get(&self, category: &str, ids: &[String]) -> HashMap<String, Value>;

    /// Apply a batch of mutations in order.
    async fn set(&self, updates: Vec<KeyUpdate>);
}

/// Everything needed to open a socket for one tenant.
pub struct SocketConfig {
    pub version: ProtocolVersion,
    pub credentials: Credentials,
    pub key_store: Arc<dyn KeyStore>,
}

/// An opened socket plus its event stream.
pub struct OpenedSocket {
    pub socket: Arc<dyn ProtocolSocket>,
    pub events: mpsc::UnboundedReceiver<SocketEvent>,
}

/// A live protocol socket.
#[async_trait]
pub trait ProtocolSocket: Send + Sync {
    /// The paired identity (`"<digits>:<device>@<server>"`), once known.
    fn identity(&self) -> Option<String>;

    /// Submit a text message; returns the protocol message id.
    async fn send_text(&self, destination: &str, text: &str) -> Result<String, ProtocolError>;

    /// Close the socket. Idempotent.
    async fn terminate(&self);
}

/// Fresh identity generation, used only when no credentials are persisted.
pub trait IdentityGenerator: Send + Sync {
    /// Produce an initial, unpaired credentials value.
    ///
    /// # Errors
    /// Returns error if key generation fails.
    fn generate_initial_identity(&self) -> Result<Credentials, ProtocolError>;
}

/// The external protocol library as an injected capability set.
#[async_trait]
pub trait ProtocolClient: IdentityGenerator {
    /// Fetch the current protocol version.
    async fn fetch_version(&self) -> Result<ProtocolVersion, ProtocolError>;

    /// Open a socket with the given auth state.
    async fn open_socket(&self, config: SocketConfig) -> Result<OpenedSocket, ProtocolError>;
}
