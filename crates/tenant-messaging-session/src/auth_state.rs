//! Auth-state adapter between the protocol library and session storage.
//!
//! Every operation here is non-fatal: storage failures are logged and
//! degrade to "absent", so a transient storage hiccup never blocks pairing.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use serde_json::Value;
use tenant_messaging_core::{
    AuthKey, Credentials, IdentityGenerator, KeyStore, KeyUpdate, SessionStorage, TenantId,
};
use tracing::{debug, error, warn};

/// Says whether a key store may still write. Once it returns `false`
/// the store drops every later write.
pub type WriteGate = Arc<dyn Fn() -> bool + Send + Sync>;

/// Auth state loaded for one connect attempt.
pub struct AuthState {
    pub credentials: Credentials,
    pub key_store: Arc<dyn KeyStore>,
    /// Whether the credentials came from storage rather than a fresh identity.
    pub restored: bool,
}

/// Adapts credentials and protocol keys to a per-tenant session record.
pub struct SessionStore<S> {
    storage: Arc<S>,
}

impl<S> Clone for SessionStore<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
        }
    }
}

impl<S> SessionStore<S>
where
    S: SessionStorage + 'static,
{
    #[must_use]
    pub const fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }

    /// Read one field; `None` on absence or any storage error.
    pub async fn read(&self, tenant: &TenantId, key: &AuthKey) -> Option<Value> {
        let result = match key.storage_key() {
            None => self
                .storage
                .load_credentials(tenant)
                .await
                .map(|c| c.map(Credentials::into_value)),
            Some(composite) => self.storage.load_key(tenant, &composite).await,
        };

        result.unwrap_or_else(|e| {
            warn!(%tenant, %key, "Failed to read auth state: {e}");
            None
        })
    }

    /// Upsert one field. Idempotent; failures are logged, not raised.
    pub async fn write(&self, tenant: &TenantId, key: &AuthKey, value: &Value) {
        let result = match key.storage_key() {
            None => {
                self.storage
                    .save_credentials(tenant, &Credentials::new(value.clone()))
                    .await
            }
            Some(composite) => self.storage.save_key(tenant, &composite, value).await,
        };

        if let Err(e) = result {
            error!(%tenant, %key, "Failed to write auth state: {e}");
        }
    }

    /// Unset one protocol key. The credentials slot is never removed this way.
    pub async fn remove(&self, tenant: &TenantId, key: &AuthKey) {
        let Some(composite) = key.storage_key() else {
            warn!(%tenant, "Refusing to remove credentials slot; use purge");
            return;
        };

        if let Err(e) = self.storage.remove_key(tenant, &composite).await {
            error!(%tenant, %key, "Failed to remove auth key: {e}");
        }
    }

    /// Persist rotated credentials (write-through).
    pub async fn write_credentials(&self, tenant: &TenantId, credentials: &Credentials) {
        if let Err(e) = self.storage.save_credentials(tenant, credentials).await {
            error!(%tenant, "Failed to persist credentials: {e}");
        }
    }

    /// Persisted credentials, or a fresh empty identity.
    ///
    /// Never fails: if identity generation itself fails, returns an empty
    /// credentials object.
    pub async fn bootstrap_credentials<G>(&self, tenant: &TenantId, generator: &G) -> Credentials
    where
        G: IdentityGenerator + ?Sized,
    {
        self.load_or_bootstrap(tenant, generator).await.0
    }

    async fn load_or_bootstrap<G>(&self, tenant: &TenantId, generator: &G) -> (Credentials, bool)
    where
        G: IdentityGenerator + ?Sized,
    {
        if let Some(value) = self.read(tenant, &AuthKey::Credentials).await {
            let credentials = Credentials::new(value);
            if !credentials.is_empty() {
                return (credentials, true);
            }
        }

        match generator.generate_initial_identity() {
            Ok(credentials) => (credentials, false),
            Err(e) => {
                error!(%tenant, "Failed to generate initial identity: {e}");
                (Credentials::empty(), false)
            }
        }
    }

    /// Load credentials (bootstrapping if absent) plus the tenant's key
    /// store, writing only while `gate` (if any) allows it.
    pub async fn load_auth_state<G>(
        &self,
        tenant: &TenantId,
        generator: &G,
        gate: Option<WriteGate>,
    ) -> AuthState
    where
        G: IdentityGenerator + ?Sized,
    {
        let (credentials, restored) = self.load_or_bootstrap(tenant, generator).await;
        let key_store = match gate {
            Some(gate) => self.gated_key_store(tenant.clone(), gate),
            None => self.key_store(tenant.clone()),
        };
        AuthState {
            credentials,
            key_store: Arc::new(key_store),
            restored,
        }
    }

    /// Key store bound to one tenant.
    #[must_use]
    pub fn key_store(&self, tenant: TenantId) -> TenantKeyStore<S> {
        TenantKeyStore {
            store: self.clone(),
            tenant,
            gate: None,
        }
    }

    /// Key store bound to one tenant that stops writing once `gate` closes.
    #[must_use]
    pub fn gated_key_store(&self, tenant: TenantId, gate: WriteGate) -> TenantKeyStore<S> {
        TenantKeyStore {
            store: self.clone(),
            tenant,
            gate: Some(gate),
        }
    }

    /// Whether non-empty pairing credentials are persisted; `false` on
    /// storage errors. Protocol keys alone do not count.
    pub async fn has_session(&self, tenant: &TenantId) -> bool {
        self.read(tenant, &AuthKey::Credentials)
            .await
            .map(Credentials::new)
            .is_some_and(|credentials| !credentials.is_empty())
    }

    /// Delete the whole session record.
    pub async fn purge(&self, tenant: &TenantId) {
        if let Err(e) = self.storage.delete(tenant).await {
            error!(%tenant, "Failed to purge session record: {e}");
        }
    }
}

/// [`KeyStore`] view of one tenant's session record.
pub struct TenantKeyStore<S> {
    store: SessionStore<S>,
    tenant: TenantId,
    gate: Option<WriteGate>,
}

impl<S> TenantKeyStore<S> {
    fn is_open(&self) -> bool {
        self.gate.as_ref().is_none_or(|gate| gate())
    }
}

#[async_trait]
impl<S> KeyStore for TenantKeyStore<S>
where
    S: SessionStorage + 'static,
{
    async fn get(&self, category: &str, ids: &[String]) -> HashMap<String, Value> {
        let mut found = HashMap::with_capacity(ids.len());
        for id in ids {
            let key = AuthKey::protocol(category, id.as_str());
            if let Some(value) = self.store.read(&self.tenant, &key).await {
                found.insert(id.clone(), value);
            }
        }
        debug!(tenant = %self.tenant, category, requested = ids.len(), found = found.len(), "Key store get");
        found
    }

    async fn set(&self, updates: Vec<KeyUpdate>) {
        if !self.is_open() {
            debug!(
                tenant = %self.tenant,
                count = updates.len(),
                "Dropping key writes from a stale connection"
            );
            return;
        }
        debug!(tenant = %self.tenant, count = updates.len(), "Key store set");
        for update in updates {
            let key = update.key();
            match update.value {
                Some(value) => self.store.write(&self.tenant, &key, &value).await,
                None => self.store.remove(&self.tenant, &key).await,
            }
        }
    }
}
