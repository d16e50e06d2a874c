//! In-memory session and settings storage.

use std::{
    collections::{BTreeMap, HashMap},
    sync::RwLock,
    time::{SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use serde_json::Value;
use tenant_messaging_core::{
    Credentials, MessagingSettings, SessionRecord, SessionStorage, SettingsStorage, StorageError,
    TenantId,
};

/// In-memory storage implementation.
///
/// Useful for development and single-process deployments.
/// Data is lost on restart.
pub struct MemoryStorage {
    sessions: RwLock<HashMap<TenantId, SessionRecord>>,
    settings: RwLock<HashMap<TenantId, MessagingSettings>>,
}

impl MemoryStorage {
    /// Create a new in-memory storage.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            settings: RwLock::new(HashMap::new()),
        }
    }

    /// Snapshot of a tenant's session record.
    ///
    /// # Errors
    /// Returns error if the lock is poisoned.
    pub fn record(&self, tenant: &TenantId) -> Result<Option<SessionRecord>, StorageError> {
        Ok(self
            .sessions
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .get(tenant)
            .cloned())
    }

    fn upsert<F>(&self, tenant: &TenantId, mutate: F) -> Result<(), StorageError>
    where
        F: FnOnce(&mut SessionRecord),
    {
        let timestamp = now();
        let mut sessions = self
            .sessions
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        let record = sessions
            .entry(tenant.clone())
            .or_insert_with(|| SessionRecord {
                tenant_id: tenant.clone(),
                credentials: None,
                keys: BTreeMap::new(),
                created_at: timestamp,
                updated_at: timestamp,
            });

        mutate(record);
        record.updated_at = timestamp;

        Ok(())
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

#[async_trait]
impl SessionStorage for MemoryStorage {
    async fn load_credentials(
        &self,
        tenant: &TenantId,
    ) -> Result<Option<Credentials>, StorageError> {
        Ok(self
            .sessions
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .get(tenant)
            .and_then(|record| record.credentials.clone()))
    }

    async fn save_credentials(
        &self,
        tenant: &TenantId,
        credentials: &Credentials,
    ) -> Result<(), StorageError> {
        self.upsert(tenant, |record| {
            record.credentials = Some(credentials.clone());
        })
    }

    async fn load_key(&self, tenant: &TenantId, key: &str) -> Result<Option<Value>, StorageError> {
        Ok(self
            .sessions
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .get(tenant)
            .and_then(|record| record.keys.get(key).cloned()))
    }

    async fn save_key(
        &self,
        tenant: &TenantId,
        key: &str,
        value: &Value,
    ) -> Result<(), StorageError> {
        self.upsert(tenant, |record| {
            record.keys.insert(key.to_string(), value.clone());
        })
    }

    async fn remove_key(&self, tenant: &TenantId, key: &str) -> Result<(), StorageError> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        if let Some(record) = sessions.get_mut(tenant) {
            if record.keys.remove(key).is_some() {
                record.updated_at = now();
            }
        }

        Ok(())
    }

    async fn exists(&self, tenant: &TenantId) -> Result<bool, StorageError> {
        Ok(self
            .sessions
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .contains_key(tenant))
    }

    async fn delete(&self, tenant: &TenantId) -> Result<(), StorageError> {
        self.sessions
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .remove(tenant);

        Ok(())
    }
}

#[async_trait]
impl SettingsStorage for MemoryStorage {
    async fn get_settings(
        &self,
        tenant: &TenantId,
    ) -> Result<Option<MessagingSettings>, StorageError> {
        Ok(self
            .settings
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .get(tenant)
            .cloned())
    }

    async fn put_settings(
        &self,
        tenant: &TenantId,
        settings: &MessagingSettings,
    ) -> Result<(), StorageError> {
        self.settings
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .insert(tenant.clone(), settings.clone());

        Ok(())
    }
}
