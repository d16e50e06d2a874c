//! SQLite session and settings storage (feature-gated).
//!
//! Keys live one row each in `messaging_session_keys`, so a key-store write
//! during a live session is a single-row upsert rather than a rewrite of the
//! whole record.

use std::{
    str::FromStr,
    time::{SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tenant_messaging_core::{
    Credentials, MessagingSettings, SessionStorage, SettingsStorage, StorageError, TenantId,
};
use tracing::info;

const CURRENT_VERSION: i64 = 1;

/// SQLite storage implementation.
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (creating if missing) the database at `database_url` and migrate it.
    ///
    /// # Errors
    /// Returns error if database connection or migration fails.
    pub async fn new(database_url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(db_err)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal);

        // An in-memory database exists per connection; keep exactly one.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(db_err)?;

        Self::from_pool(pool).await
    }

    /// Wrap an existing pool and migrate it.
    ///
    /// # Errors
    /// Returns error if migration fails.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StorageError> {
        run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// Number of protocol keys stored for a tenant.
    ///
    /// # Errors
    /// Returns error if the query fails.
    pub async fn key_count(&self, tenant: &TenantId) -> Result<i64, StorageError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM messaging_session_keys WHERE tenant_id = ?")
                .bind(tenant.as_str())
                .fetch_one(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(count)
    }

    async fn touch_session(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        tenant: &TenantId,
    ) -> Result<(), StorageError> {
        let timestamp = now();
        sqlx::query(
            r"
            INSERT INTO messaging_sessions (tenant_id, credentials, created_at, updated_at)
            VALUES (?, NULL, ?, ?)
            ON CONFLICT(tenant_id) DO UPDATE SET updated_at = excluded.updated_at
            ",
        )
        .bind(tenant.as_str())
        .bind(timestamp)
        .bind(timestamp)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}

fn db_err(e: sqlx::Error) -> StorageError {
    StorageError::Internal(e.to_string())
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

async fn run_migrations(pool: &SqlitePool) -> Result<(), StorageError> {
    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS schema_versions (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        ",
    )
    .execute(pool)
    .await
    .map_err(db_err)?;

    let (current,): (Option<i64>,) = sqlx::query_as("SELECT MAX(version) FROM schema_versions")
        .fetch_one(pool)
        .await
        .map_err(db_err)?;
    let current = current.unwrap_or(0);

    if current > CURRENT_VERSION {
        return Err(StorageError::Internal(format!(
            "database schema version ({current}) is newer than supported ({CURRENT_VERSION})"
        )));
    }

    for version in (current + 1)..=CURRENT_VERSION {
        let mut tx = pool.begin().await.map_err(db_err)?;
        for statement in migration(version) {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        sqlx::query("INSERT INTO schema_versions (version) VALUES (?)")
            .bind(version)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        info!("Applied messaging storage migration v{version}");
    }

    Ok(())
}

fn migration(version: i64) -> &'static [&'static str] {
    match version {
        1 => &[
            r"
            CREATE TABLE messaging_sessions (
                tenant_id TEXT PRIMARY KEY,
                credentials TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            ",
            r"
            CREATE TABLE messaging_session_keys (
                tenant_id TEXT NOT NULL
                    REFERENCES messaging_sessions(tenant_id) ON DELETE CASCADE,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (tenant_id, key)
            )
            ",
            r"
            CREATE TABLE messaging_settings (
                tenant_id TEXT PRIMARY KEY,
                connected INTEGER NOT NULL,
                phone_number TEXT NOT NULL DEFAULT '',
                last_connected TEXT
            )
            ",
        ],
        _ => &[],
    }
}

#[async_trait]
impl SessionStorage for SqliteStorage {
    async fn load_credentials(
        &self,
        tenant: &TenantId,
    ) -> Result<Option<Credentials>, StorageError> {
        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT credentials FROM messaging_sessions WHERE tenant_id = ?")
                .bind(tenant.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;

        match row.and_then(|(raw,)| raw) {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn save_credentials(
        &self,
        tenant: &TenantId,
        credentials: &Credentials,
    ) -> Result<(), StorageError> {
        let raw = serde_json::to_string(credentials)?;
        let timestamp = now();
        sqlx::query(
            r"
            INSERT INTO messaging_sessions (tenant_id, credentials, created_at, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(tenant_id) DO UPDATE SET
                credentials = excluded.credentials,
                updated_at = excluded.updated_at
            ",
        )
        .bind(tenant.as_str())
        .bind(raw)
        .bind(timestamp)
        .bind(timestamp)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn load_key(&self, tenant: &TenantId, key: &str) -> Result<Option<Value>, StorageError> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT value FROM messaging_session_keys WHERE tenant_id = ? AND key = ?",
        )
        .bind(tenant.as_str())
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match row {
            Some((raw,)) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn save_key(
        &self,
        tenant: &TenantId,
        key: &str,
        value: &Value,
    ) -> Result<(), StorageError> {
        let raw = serde_json::to_string(value)?;
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        Self::touch_session(&mut tx, tenant).await?;
        sqlx::query(
            r"
            INSERT INTO messaging_session_keys (tenant_id, key, value) VALUES (?, ?, ?)
            ON CONFLICT(tenant_id, key) DO UPDATE SET value = excluded.value
            ",
        )
        .bind(tenant.as_str())
        .bind(key)
        .bind(raw)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn remove_key(&self, tenant: &TenantId, key: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM messaging_session_keys WHERE tenant_id = ? AND key = ?")
            .bind(tenant.as_str())
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn exists(&self, tenant: &TenantId) -> Result<bool, StorageError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM messaging_sessions WHERE tenant_id = ?")
                .bind(tenant.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(row.is_some())
    }

    async fn delete(&self, tenant: &TenantId) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query("DELETE FROM messaging_session_keys WHERE tenant_id = ?")
            .bind(tenant.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query("DELETE FROM messaging_sessions WHERE tenant_id = ?")
            .bind(tenant.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl SettingsStorage for SqliteStorage {
    async fn get_settings(
        &self,
        tenant: &TenantId,
    ) -> Result<Option<MessagingSettings>, StorageError> {
        let row: Option<(bool, String, Option<String>)> = sqlx::query_as(
            "SELECT connected, phone_number, last_connected FROM messaging_settings WHERE tenant_id = ?",
        )
        .bind(tenant.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.map(|(connected, phone_number, last_connected)| MessagingSettings {
            connected,
            phone_number,
            last_connected: last_connected
                .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
                .map(|at| at.with_timezone(&Utc)),
        }))
    }

    async fn put_settings(
        &self,
        tenant: &TenantId,
        settings: &MessagingSettings,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r"
            INSERT INTO messaging_settings (tenant_id, connected, phone_number, last_connected)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(tenant_id) DO UPDATE SET
                connected = excluded.connected,
                phone_number = excluded.phone_number,
                last_connected = excluded.last_connected
            ",
        )
        .bind(tenant.as_str())
        .bind(settings.connected)
        .bind(&settings.phone_number)
        .bind(settings.last_connected.map(|at| at.to_rfc3339()))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}
