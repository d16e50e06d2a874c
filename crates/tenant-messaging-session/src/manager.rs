//! Connection manager: per-tenant lifecycle of protocol sockets.
//!
//! `connect`, `get_status` and `disconnect` never fail; they return the
//! result shapes the HTTP layer serializes. Socket events are turned into
//! [`Event`]s, run through the tenant's [`SessionMachine`], and the resulting
//! [`Effect`]s are applied here in order.

use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use futures::{FutureExt, future::BoxFuture};
use tenant_messaging_core::{
    ConnectOutcome, ConnectResponse, ConnectionUpdate, DisconnectReason, DisconnectResponse,
    LinkState, MessagingConfig, MessagingSettings, OpenedSocket, ProtocolClient, ProtocolError,
    ProtocolSocket, SessionStorage, SettingsStorage, SocketConfig, SocketEvent, StatusResponse,
    StorageError, TenantId, phone_number_from_identity,
};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tracing::{debug, error, info, warn};

use crate::{
    auth_state::{SessionStore, WriteGate},
    backoff,
    machine::{Effect, Event, SessionMachine},
    qr::{QrRenderer, SvgDataUrlRenderer},
    registry::{ConnectTicket, ConnectionEntry, ConnectionRegistry, OpenMode, StartedConnect},
};

/// Which socket (if any) a batch of effects belongs to.
struct SocketContext {
    tenant: TenantId,
    epoch: u64,
    connection: Option<u64>,
}

/// Connection manager for many independent tenants.
pub struct ConnectionManager<S, M, P> {
    sessions: SessionStore<S>,
    settings: Arc<M>,
    protocol: Arc<P>,
    registry: Arc<ConnectionRegistry>,
    qr_renderer: Arc<dyn QrRenderer>,
    config: MessagingConfig,
    /// Serializes effect application and teardown per tenant.
    tenant_locks: parking_lot::Mutex<HashMap<TenantId, Arc<AsyncMutex<()>>>>,
}

impl<S, M, P> ConnectionManager<S, M, P>
where
    S: SessionStorage + 'static,
    M: SettingsStorage + 'static,
    P: ProtocolClient + 'static,
{
    /// Create a manager rendering QR codes as SVG data URLs.
    #[must_use]
    pub fn new(
        storage: Arc<S>,
        settings: Arc<M>,
        protocol: Arc<P>,
        registry: Arc<ConnectionRegistry>,
        config: MessagingConfig,
    ) -> Arc<Self> {
        let renderer = Arc::new(SvgDataUrlRenderer::new(config.qr_size));
        Self::with_renderer(storage, settings, protocol, registry, config, renderer)
    }

    /// Create a manager with a custom QR renderer.
    #[must_use]
    pub fn with_renderer(
        storage: Arc<S>,
        settings: Arc<M>,
        protocol: Arc<P>,
        registry: Arc<ConnectionRegistry>,
        config: MessagingConfig,
        qr_renderer: Arc<dyn QrRenderer>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions: SessionStore::new(storage),
            settings,
            protocol,
            registry,
            qr_renderer,
            config,
            tenant_locks: parking_lot::Mutex::new(HashMap::new()),
        })
    }

    #[must_use]
    pub const fn config(&self) -> &MessagingConfig {
        &self.config
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    #[must_use]
    pub const fn session_store(&self) -> &SessionStore<S> {
        &self.sessions
    }

    /// The tenant's socket, once paired and open.
    #[must_use]
    pub fn authenticated_socket(&self, tenant: &TenantId) -> Option<Arc<dyn ProtocolSocket>> {
        self.registry
            .connection(tenant)
            .filter(ConnectionEntry::is_authenticated)
            .map(|entry| entry.socket)
    }

    /// Whether pairing credentials are persisted for the tenant.
    pub async fn has_persisted_session(&self, tenant: &TenantId) -> bool {
        self.sessions.has_session(tenant).await
    }

    fn tenant_lock(&self, tenant: &TenantId) -> Arc<AsyncMutex<()>> {
        Arc::clone(self.tenant_locks.lock().entry(tenant.clone()).or_default())
    }

    /// Drop the tenant's lock once nobody but the map holds it. Callers
    /// must have dropped their own handle first.
    fn release_tenant_lock(&self, tenant: &TenantId) {
        let mut locks = self.tenant_locks.lock();
        if locks
            .get(tenant)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(tenant);
        }
    }

    /// Drop all in-memory state of a tenant that has nothing left running.
    fn release_if_idle(&self, tenant: &TenantId) {
        if self.registry.release_if_idle(tenant) {
            debug!(%tenant, "Released idle tenant state");
        }
        self.release_tenant_lock(tenant);
    }

    /// Number of tenants holding a teardown lock.
    #[must_use]
    pub fn locked_tenants(&self) -> usize {
        self.tenant_locks.lock().len()
    }

    /// Connect the tenant, or join the attempt already in flight.
    ///
    /// Resolves on the first of: a pairing challenge, the link opening, or
    /// the configured timeout. On timeout the socket keeps running; a later
    /// challenge or open still updates state but no longer reaches this
    /// caller.
    pub async fn connect(self: &Arc<Self>, tenant: &TenantId) -> ConnectResponse {
        match self.registry.begin_connect(tenant) {
            ConnectTicket::Connected { phone_number } => {
                debug!(%tenant, "Already connected");
                ConnectResponse::connected(phone_number)
            }
            ConnectTicket::Joined(outcome) => {
                debug!(%tenant, "Joining in-flight connect attempt");
                outcome.await.into()
            }
            ConnectTicket::Started(started) => {
                info!(%tenant, attempt = started.attempt, "Starting connect attempt");
                let outcome = started.outcome.clone();
                tokio::spawn(Arc::clone(self).supervise_attempt(tenant.clone(), started));
                outcome.await.into()
            }
        }
    }

    /// Bound one connect attempt and settle it exactly once.
    async fn supervise_attempt(self: Arc<Self>, tenant: TenantId, started: StartedConnect) {
        let StartedConnect {
            attempt,
            epoch,
            resolution,
            settle,
            ..
        } = started;

        tokio::spawn(
            Arc::clone(&self).run_attempt(tenant.clone(), epoch, OpenMode::Fresh),
        );

        let outcome = match tokio::time::timeout(self.config.connect_timeout(), resolution).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => ConnectOutcome::Failed("Connection attempt cancelled".to_string()),
            Err(_) => {
                warn!(%tenant, attempt, "Connect attempt timed out; socket left running");
                ConnectOutcome::TimedOut
            }
        };

        self.registry.finish_connect(&tenant, attempt);
        let _ = settle.send(outcome);
    }

    /// Open a socket under `epoch` and start handling its events.
    fn run_attempt(
        self: Arc<Self>,
        tenant: TenantId,
        epoch: u64,
        mode: OpenMode,
    ) -> BoxFuture<'static, ()> {
        async move {
            if !self.registry.try_begin_open(&tenant, epoch, mode) {
                debug!(%tenant, ?mode, "Socket open superseded");
                return;
            }
            self.registry.clear_qr(&tenant);

            let OpenedSocket { socket, events } = match self.open_socket(&tenant, epoch).await {
                Ok(opened) => opened,
                Err(e) => {
                    self.registry.abort_open(&tenant, epoch);
                    error!(%tenant, ?mode, "Protocol initialization failed: {e}");
                    self.handle_open_failure(&tenant, epoch, mode, &e).await;
                    return;
                }
            };

            let Some((id, replaced)) =
                self.registry
                    .install_connection(&tenant, epoch, Arc::clone(&socket))
            else {
                info!(%tenant, "Tenant disconnected while socket was opening");
                socket.terminate().await;
                return;
            };
            if let Some(old) = replaced {
                debug!(%tenant, old = old.id, new = id, "Replacing unpaired socket");
                old.socket.terminate().await;
            }

            let machine = SessionMachine::new(
                self.registry.reconnect_attempts(&tenant),
                self.config.reconnect.max_attempts,
            );
            tokio::spawn(self.drive_socket(tenant, epoch, id, socket, events, machine));
        }
        .boxed()
    }

    async fn open_socket(
        &self,
        tenant: &TenantId,
        epoch: u64,
    ) -> Result<OpenedSocket, ProtocolError> {
        let version = self.protocol.fetch_version().await?;
        let registry = Arc::clone(&self.registry);
        let owner = tenant.clone();
        let gate: WriteGate = Arc::new(move || registry.epoch(&owner) == epoch);
        let auth = self
            .sessions
            .load_auth_state(tenant, self.protocol.as_ref(), Some(gate))
            .await;
        info!(%tenant, %version, restored = auth.restored, "Opening socket");

        self.protocol
            .open_socket(SocketConfig {
                version,
                credentials: auth.credentials,
                key_store: auth.key_store,
            })
            .await
    }

    async fn handle_open_failure(
        self: &Arc<Self>,
        tenant: &TenantId,
        epoch: u64,
        mode: OpenMode,
        error: &ProtocolError,
    ) {
        match mode {
            OpenMode::Fresh => {
                self.registry
                    .resolve_pending(tenant, ConnectOutcome::Failed(error.to_string()));
            }
            OpenMode::Reconnect => {
                // A failed reconnect counts against the cap like a drop would.
                let lock = self.tenant_lock(tenant);
                let _guard = lock.lock().await;
                if self.registry.epoch(tenant) != epoch {
                    return;
                }
                let mut machine = SessionMachine::new(
                    self.registry.reconnect_attempts(tenant),
                    self.config.reconnect.max_attempts,
                );
                let effects = machine.handle(Event::Closed(DisconnectReason::ConnectionLost));
                let ctx = SocketContext {
                    tenant: tenant.clone(),
                    epoch,
                    connection: None,
                };
                self.apply_effects(&ctx, effects).await;
            }
        }
    }

    /// Handle one socket's events until it closes or is superseded.
    async fn drive_socket(
        self: Arc<Self>,
        tenant: TenantId,
        epoch: u64,
        id: u64,
        socket: Arc<dyn ProtocolSocket>,
        mut events: mpsc::UnboundedReceiver<SocketEvent>,
        mut machine: SessionMachine,
    ) {
        let ctx = SocketContext {
            tenant,
            epoch,
            connection: Some(id),
        };
        let lock = self.tenant_lock(&ctx.tenant);

        loop {
            let next = events.recv().await;
            let guard = lock.lock().await;

            if !self.registry.is_current(&ctx.tenant, epoch, id) {
                drop(guard);
                debug!(tenant = %ctx.tenant, connection = id, "Socket superseded; stopping");
                socket.terminate().await;
                break;
            }

            let update = match next {
                Some(SocketEvent::CredentialsUpdated {
                    credentials,
                    persisted,
                }) => {
                    let effects = machine.handle(Event::CredentialsUpdated(credentials));
                    self.apply_effects(&ctx, effects).await;
                    if let Some(ack) = persisted {
                        let _ = ack.send(());
                    }
                    continue;
                }
                Some(SocketEvent::Connection(update)) => update,
                None => {
                    warn!(tenant = %ctx.tenant, connection = id, "Socket event stream ended");
                    ConnectionUpdate::closed(DisconnectReason::ConnectionLost)
                }
            };

            for event in translate(update, socket.as_ref()) {
                let effects = machine.handle(event);
                self.apply_effects(&ctx, effects).await;
            }

            if machine.is_terminal() {
                break;
            }
        }

        drop(lock);
        self.release_if_idle(&ctx.tenant);
    }

    async fn apply_effects(self: &Arc<Self>, ctx: &SocketContext, effects: Vec<Effect>) {
        let tenant = &ctx.tenant;
        for effect in effects {
            match effect {
                Effect::PersistCredentials(credentials) => {
                    self.sessions.write_credentials(tenant, &credentials).await;
                }
                Effect::PublishQr(raw) => {
                    let image = self.render_qr(tenant, &raw);
                    self.registry.set_qr(tenant, image.clone());
                    let delivered = self.registry.resolve_pending(tenant, ConnectOutcome::Qr(image));
                    info!(%tenant, delivered, "Pairing challenge ready");
                }
                Effect::ClearQr => self.registry.clear_qr(tenant),
                Effect::RecordConnected { phone_number } => {
                    info!(%tenant, %phone_number, "Connected");
                    let settings = MessagingSettings::connected(phone_number, Utc::now());
                    if let Err(e) = self.settings.put_settings(tenant, &settings).await {
                        error!(%tenant, "Failed to record connection: {e}");
                    }
                }
                Effect::ResetReconnectAttempts => self.registry.set_reconnect_attempts(tenant, 0),
                Effect::ResolvePending(outcome) => {
                    self.registry.resolve_pending(tenant, outcome);
                }
                Effect::RemoveConnection => {
                    if let Some(id) = ctx.connection {
                        self.registry.remove_connection(tenant, id);
                    }
                }
                Effect::PurgeSession => {
                    info!(%tenant, "Logged out; purging session");
                    self.sessions.purge(tenant).await;
                }
                Effect::RecordLoggedOut => {
                    if let Err(e) = self.update_settings(tenant, MessagingSettings::cleared).await {
                        error!(%tenant, "Failed to record logout: {e}");
                    }
                }
                Effect::ScheduleReconnect { attempt } => {
                    self.registry.set_reconnect_attempts(tenant, attempt);
                    let delay = backoff::jittered_delay(&self.config.reconnect, attempt);
                    warn!(%tenant, attempt, ?delay, "Connection dropped; reconnecting");
                    tokio::spawn(Arc::clone(self).reconnect_after(
                        tenant.clone(),
                        ctx.epoch,
                        delay,
                    ));
                }
                Effect::MarkReconnectFailed { reason } => {
                    warn!(%tenant, "{reason}");
                    self.registry.set_failure(tenant, reason);
                    if let Err(e) = self.update_settings(tenant, MessagingSettings::offline).await {
                        error!(%tenant, "Failed to record reconnect failure: {e}");
                    }
                }
            }
        }
    }

    async fn reconnect_after(
        self: Arc<Self>,
        tenant: TenantId,
        epoch: u64,
        delay: std::time::Duration,
    ) {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.registry.epoch(&tenant) != epoch {
            debug!(%tenant, "Reconnect cancelled");
            return;
        }
        self.run_attempt(tenant, epoch, OpenMode::Reconnect).await;
    }

    fn render_qr(&self, tenant: &TenantId, raw: &str) -> String {
        self.qr_renderer.render(raw).unwrap_or_else(|e| {
            warn!(%tenant, "Failed to render QR, caching raw challenge: {e}");
            raw.to_string()
        })
    }

    async fn update_settings(
        &self,
        tenant: &TenantId,
        update: impl FnOnce(MessagingSettings) -> MessagingSettings,
    ) -> Result<(), StorageError> {
        let current = self.read_settings(tenant).await.unwrap_or_default();
        self.settings.put_settings(tenant, &update(current)).await
    }

    /// Current status, from memory first and persisted settings second.
    ///
    /// A tenant whose settings say connected but who has no socket in this
    /// process (e.g. after a restart) gets a background reconnect, unless it
    /// was disconnected while the settings were being read.
    pub async fn get_status(self: &Arc<Self>, tenant: &TenantId) -> StatusResponse {
        let mark = self.registry.mark(tenant);
        if let Some(phone_number) = self.registry.authenticated_phone(tenant) {
            return StatusResponse::connected(phone_number);
        }
        if let Some(qr) = self.registry.qr(tenant) {
            return StatusResponse::waiting_scan(qr);
        }
        if let Some(reason) = self.registry.failure(tenant) {
            return StatusResponse::reconnect_failed(reason);
        }

        let Some(settings) = self.read_settings(tenant).await.filter(|s| s.connected) else {
            return StatusResponse::disconnected();
        };
        if self.registry.connection(tenant).is_some() || self.registry.is_connecting(tenant) {
            return StatusResponse::reconnecting(settings.phone_number);
        }

        match self.registry.begin_connect_at(tenant, mark) {
            Some(ConnectTicket::Started(started)) => {
                info!(%tenant, "Previously connected; reconnecting in background");
                tokio::spawn(Arc::clone(self).supervise_attempt(tenant.clone(), started));
                StatusResponse::reconnecting(settings.phone_number)
            }
            Some(ConnectTicket::Connected { phone_number }) => {
                StatusResponse::connected(phone_number)
            }
            Some(ConnectTicket::Joined(_)) => StatusResponse::reconnecting(settings.phone_number),
            None => {
                debug!(%tenant, "Tenant torn down during status read; not reconnecting");
                self.read_settings(tenant)
                    .await
                    .filter(|s| s.connected)
                    .map_or_else(StatusResponse::disconnected, |s| {
                        StatusResponse::reconnecting(s.phone_number)
                    })
            }
        }
    }

    async fn read_settings(&self, tenant: &TenantId) -> Option<MessagingSettings> {
        self.settings.get_settings(tenant).await.unwrap_or_else(|e| {
            warn!(%tenant, "Failed to read settings: {e}");
            None
        })
    }

    /// Tear the tenant down completely; the only way to force re-pairing.
    ///
    /// Wins over any pending connect or reconnect: those are cancelled and
    /// their sockets terminated.
    pub async fn disconnect(&self, tenant: &TenantId) -> DisconnectResponse {
        let lock = self.tenant_lock(tenant);
        let guard = lock.lock().await;
        let response = self.teardown(tenant).await;
        drop(guard);
        drop(lock);

        self.release_if_idle(tenant);
        response
    }

    async fn teardown(&self, tenant: &TenantId) -> DisconnectResponse {
        let cancelled = self.registry.cancel(tenant);
        if let Some(pending) = cancelled.pending {
            let _ = pending.send(ConnectOutcome::Failed("Disconnected".to_string()));
        }
        if let Some(entry) = cancelled.connection {
            info!(%tenant, connection = entry.id, "Terminating socket");
            entry.socket.terminate().await;
        }

        self.sessions.purge(tenant).await;

        match self.update_settings(tenant, MessagingSettings::cleared).await {
            Ok(()) => {
                info!(%tenant, "Disconnected");
                DisconnectResponse::ok()
            }
            Err(e) => {
                error!(%tenant, "Failed to record disconnect: {e}");
                DisconnectResponse::failed(format!("Failed to update settings: {e}"))
            }
        }
    }
}

/// Map one connection update to machine events.
fn translate(update: ConnectionUpdate, socket: &dyn ProtocolSocket) -> Vec<Event> {
    let mut events = Vec::with_capacity(2);
    if let Some(qr) = update.qr {
        events.push(Event::QrReceived(qr));
    }
    match update.state {
        Some(LinkState::Open) => {
            let phone_number = socket
                .identity()
                .map(|identity| phone_number_from_identity(&identity))
                .unwrap_or_default();
            events.push(Event::Opened { phone_number });
        }
        Some(LinkState::Close) => events.push(Event::Closed(
            update
                .close_reason
                .unwrap_or(DisconnectReason::ConnectionClosed),
        )),
        Some(LinkState::Connecting) | None => {}
    }
    events
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicBool, Ordering},
        time::Duration,
    };

    use async_trait::async_trait;
    use serde_json::json;
    use tenant_messaging_core::{
        Credentials, KeyUpdate,
        testing::{AutoScript, ScriptedProtocol},
    };
    use tokio::sync::Notify;

    use super::*;
    use crate::{qr::QrError, storage::MemoryStorage};

    const IDENTITY: &str = "923001234567:12@s.whatsapp.net";

    type TestManager = ConnectionManager<MemoryStorage, MemoryStorage, ScriptedProtocol>;

    struct Harness {
        storage: Arc<MemoryStorage>,
        protocol: Arc<ScriptedProtocol>,
        manager: Arc<TestManager>,
        tenant: TenantId,
    }

    fn test_config() -> MessagingConfig {
        let mut config = MessagingConfig::default();
        config.reconnect.base_delay_ms = 1_000;
        config.reconnect.max_delay_ms = 10_000;
        config.reconnect.jitter_percent = 0;
        config
    }

    fn harness(script: AutoScript) -> Harness {
        harness_with(script, test_config())
    }

    fn harness_with(script: AutoScript, config: MessagingConfig) -> Harness {
        let storage = Arc::new(MemoryStorage::new());
        let protocol = Arc::new(ScriptedProtocol::new().with_script(script));
        let manager = ConnectionManager::new(
            Arc::clone(&storage),
            Arc::clone(&storage),
            Arc::clone(&protocol),
            Arc::new(ConnectionRegistry::new()),
            config,
        );
        Harness {
            storage,
            protocol,
            manager,
            tenant: TenantId::from("school-1"),
        }
    }

    fn open_script() -> AutoScript {
        AutoScript::Open {
            identity: IDENTITY.to_string(),
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition never became true");
    }

    async fn status_eventually(h: &Harness, check: impl Fn(&StatusResponse) -> bool) -> StatusResponse {
        for _ in 0..500 {
            let status = h.manager.get_status(&h.tenant).await;
            if check(&status) {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("status never matched");
    }

    /// Settings storage that parks its first armed read until released.
    #[derive(Default)]
    struct GatedSettings {
        inner: MemoryStorage,
        armed: AtomicBool,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl SettingsStorage for GatedSettings {
        async fn get_settings(
            &self,
            tenant: &TenantId,
        ) -> Result<Option<MessagingSettings>, StorageError> {
            let current = self.inner.get_settings(tenant).await;
            if self.armed.swap(false, Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            current
        }

        async fn put_settings(
            &self,
            tenant: &TenantId,
            settings: &MessagingSettings,
        ) -> Result<(), StorageError> {
            self.inner.put_settings(tenant, settings).await
        }
    }

    async fn settings(h: &Harness) -> MessagingSettings {
        h.storage
            .get_settings(&h.tenant)
            .await
            .unwrap()
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn test_connect_returns_rendered_qr() {
        let h = harness(AutoScript::Qr("2@ref,key".to_string()));

        let response = h.manager.connect(&h.tenant).await;

        assert!(response.success);
        let qr = response.qr_code.unwrap();
        assert!(qr.starts_with("data:image/svg+xml;base64,"));

        let status = h.manager.get_status(&h.tenant).await;
        assert!(!status.connected);
        assert_eq!(status.status.as_deref(), Some("waiting_scan"));
        assert_eq!(status.qr_code, Some(qr));
    }

    #[tokio::test]
    async fn test_concurrent_connects_share_one_socket() {
        let h = harness(AutoScript::Qr("2@ref".to_string()));

        let (a, b) = tokio::join!(h.manager.connect(&h.tenant), h.manager.connect(&h.tenant));

        assert_eq!(a, b);
        assert!(a.qr_code.is_some());
        assert_eq!(h.protocol.sockets_opened(), 1);
    }

    #[tokio::test]
    async fn test_connect_when_connected_short_circuits() {
        let h = harness(open_script());

        let first = h.manager.connect(&h.tenant).await;
        assert_eq!(first, ConnectResponse::connected("923001234567"));

        let second = h.manager.connect(&h.tenant).await;
        assert_eq!(second, ConnectResponse::connected("923001234567"));
        assert_eq!(h.protocol.sockets_opened(), 1);

        let recorded = settings(&h).await;
        assert!(recorded.connected);
        assert_eq!(recorded.phone_number, "923001234567");
        assert!(recorded.last_connected.is_some());
    }

    #[tokio::test]
    async fn test_open_after_qr_clears_cached_qr() {
        let h = harness(AutoScript::Qr("2@ref".to_string()));
        h.manager.connect(&h.tenant).await;

        h.protocol.socket(0).emit_open(IDENTITY);

        let status = status_eventually(&h, |s| s.connected).await;
        assert_eq!(status.phone_number.as_deref(), Some("923001234567"));
        assert!(status.qr_code.is_none());
        assert!(h.manager.registry().qr(&h.tenant).is_none());
    }

    #[tokio::test]
    async fn test_failed_render_falls_back_to_raw_challenge() {
        struct Broken;
        impl QrRenderer for Broken {
            fn render(&self, _: &str) -> Result<String, QrError> {
                Err(QrError::Encode("broken".to_string()))
            }
        }

        let storage = Arc::new(MemoryStorage::new());
        let manager = ConnectionManager::with_renderer(
            Arc::clone(&storage),
            storage,
            Arc::new(ScriptedProtocol::new().with_script(AutoScript::Qr("raw-ref".to_string()))),
            Arc::new(ConnectionRegistry::new()),
            test_config(),
            Arc::new(Broken),
        );

        let response = manager.connect(&TenantId::from("t")).await;
        assert_eq!(response.qr_code.as_deref(), Some("raw-ref"));
    }

    #[tokio::test]
    async fn test_persisted_session_reused_without_new_identity() {
        let h = harness(AutoScript::Qr("2@ref".to_string()));
        h.manager.connect(&h.tenant).await;
        assert_eq!(h.protocol.identity_generations(), 1);

        let rotated = Credentials::new(json!({"registrationId": 1, "registered": true}));
        assert!(h.protocol.socket(0).emit_credentials(rotated.clone()).await);
        // Write-through: persisted before the socket saw the ack.
        assert_eq!(
            h.manager
                .session_store()
                .read(&h.tenant, &tenant_messaging_core::AuthKey::Credentials)
                .await,
            Some(rotated.as_value().clone())
        );

        // A fresh process over the same storage.
        let restarted: Arc<TestManager> = ConnectionManager::new(
            Arc::clone(&h.storage),
            Arc::clone(&h.storage),
            Arc::clone(&h.protocol),
            Arc::new(ConnectionRegistry::new()),
            test_config(),
        );
        h.protocol.set_script(open_script());
        let response = restarted.connect(&h.tenant).await;

        assert!(response.success);
        assert_eq!(h.protocol.identity_generations(), 1);
        assert_eq!(h.protocol.opened_with()[1], rotated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_times_out_but_late_open_is_honored() {
        let h = harness(AutoScript::Idle);

        let response = h.manager.connect(&h.tenant).await;
        assert_eq!(response, ConnectResponse::failed("Connection timed out"));
        assert!(!h.manager.registry().is_connecting(&h.tenant));

        // The socket was left running.
        let socket = h.protocol.socket(0);
        assert!(!socket.is_terminated());
        socket.emit_open(IDENTITY);

        let status = status_eventually(&h, |s| s.connected).await;
        assert_eq!(status.phone_number.as_deref(), Some("923001234567"));
    }

    #[tokio::test]
    async fn test_protocol_init_failure_reports_error_without_state() {
        let h = harness(open_script());
        h.protocol.fail_version(true);

        let response = h.manager.connect(&h.tenant).await;

        assert!(!response.success);
        assert!(response.error.unwrap().contains("protocol version"));
        assert_eq!(h.protocol.sockets_opened(), 0);
        assert!(h.storage.get_settings(&h.tenant).await.unwrap().is_none());
        assert!(!h.manager.has_persisted_session(&h.tenant).await);

        // Recovers once the version fetch works again.
        h.protocol.fail_version(false);
        assert!(h.manager.connect(&h.tenant).await.success);
    }

    #[tokio::test]
    async fn test_disconnect_tears_everything_down() {
        let h = harness(open_script());
        h.manager.connect(&h.tenant).await;
        let socket = h.protocol.socket(0);
        assert!(
            socket
                .emit_credentials(Credentials::new(json!({"registered": true})))
                .await
        );
        assert!(h.manager.has_persisted_session(&h.tenant).await);

        let response = h.manager.disconnect(&h.tenant).await;

        assert_eq!(response, DisconnectResponse::ok());
        assert!(socket.is_terminated());
        assert!(!h.manager.has_persisted_session(&h.tenant).await);
        assert_eq!(
            h.manager.get_status(&h.tenant).await,
            StatusResponse::disconnected()
        );
        let recorded = settings(&h).await;
        assert!(!recorded.connected);
        assert_eq!(recorded.phone_number, "");

        // Idempotent.
        assert_eq!(h.manager.disconnect(&h.tenant).await, DisconnectResponse::ok());
    }

    #[tokio::test]
    async fn test_disconnect_settles_pending_connect() {
        let h = harness(AutoScript::Idle);
        let manager = Arc::clone(&h.manager);
        let tenant = h.tenant.clone();
        let pending = tokio::spawn(async move { manager.connect(&tenant).await });

        eventually(|| h.protocol.sockets_opened() == 1).await;
        h.manager.disconnect(&h.tenant).await;

        let response = pending.await.unwrap();
        assert_eq!(response, ConnectResponse::failed("Disconnected"));
        assert!(h.protocol.socket(0).is_terminated());
    }

    #[tokio::test]
    async fn test_logout_purges_session_without_reconnect() {
        let h = harness(open_script());
        h.manager.connect(&h.tenant).await;
        let socket = h.protocol.socket(0);
        socket
            .emit_credentials(Credentials::new(json!({"registered": true})))
            .await;

        socket.emit_close(DisconnectReason::LoggedOut);

        let status = status_eventually(&h, |s| !s.connected).await;
        assert_eq!(status, StatusResponse::disconnected());
        assert!(!h.manager.has_persisted_session(&h.tenant).await);
        let recorded = settings(&h).await;
        assert!(!recorded.connected);
        assert_eq!(recorded.phone_number, "");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.protocol.sockets_opened(), 1);
    }

    #[tokio::test]
    async fn test_transient_drop_reconnects_immediately() {
        let h = harness(open_script());
        h.manager.connect(&h.tenant).await;

        h.protocol
            .socket(0)
            .emit_close(DisconnectReason::RestartRequired);

        eventually(|| h.protocol.sockets_opened() == 2).await;
        let status = status_eventually(&h, |s| s.connected).await;
        assert_eq!(status.phone_number.as_deref(), Some("923001234567"));
        assert_eq!(h.manager.registry().reconnect_attempts(&h.tenant), 0);
    }

    #[tokio::test]
    async fn test_dropped_event_stream_counts_as_transient() {
        let h = harness(open_script());
        h.manager.connect(&h.tenant).await;

        h.protocol.socket(0).drop_events();

        eventually(|| h.protocol.sockets_opened() == 2).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_wins_over_scheduled_reconnect() {
        let h = harness(open_script());
        h.manager.connect(&h.tenant).await;
        h.protocol.set_script(AutoScript::Idle);

        h.protocol.socket(0).emit_close(DisconnectReason::ConnectionLost);
        eventually(|| h.protocol.sockets_opened() == 2).await;
        // Second drop in a row waits out the backoff.
        h.protocol.socket(1).emit_close(DisconnectReason::ConnectionLost);
        eventually(|| h.manager.registry().reconnect_attempts(&h.tenant) == 2).await;

        h.manager.disconnect(&h.tenant).await;
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(h.protocol.sockets_opened(), 2);
        assert_eq!(
            h.manager.get_status(&h.tenant).await,
            StatusResponse::disconnected()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_capped_keep_pairing() {
        let mut config = test_config();
        config.reconnect.max_attempts = 2;
        let h = harness_with(open_script(), config);
        h.manager.connect(&h.tenant).await;
        h.protocol
            .socket(0)
            .emit_credentials(Credentials::new(json!({"registered": true})))
            .await;
        h.protocol.set_script(AutoScript::Idle);

        for n in 0..3 {
            eventually(|| h.protocol.sockets_opened() == n + 1).await;
            h.protocol.socket(n).emit_close(DisconnectReason::ConnectionLost);
        }

        let status =
            status_eventually(&h, |s| s.status.as_deref() == Some("reconnect_failed")).await;
        assert!(!status.connected);
        assert_eq!(h.protocol.sockets_opened(), 3);
        assert!(h.manager.has_persisted_session(&h.tenant).await);
        let recorded = settings(&h).await;
        assert!(!recorded.connected);
        assert_eq!(recorded.phone_number, "923001234567");

        // An explicit connect starts over.
        h.protocol.set_script(open_script());
        assert!(h.manager.connect(&h.tenant).await.success);
        assert!(h.manager.get_status(&h.tenant).await.connected);
    }

    #[tokio::test]
    async fn test_status_after_restart_triggers_background_reconnect() {
        let h = harness(open_script());
        h.storage
            .put_settings(
                &h.tenant,
                &MessagingSettings::connected("923001234567", Utc::now()),
            )
            .await
            .unwrap();

        let status = h.manager.get_status(&h.tenant).await;

        assert_eq!(status, StatusResponse::reconnecting("923001234567"));
        eventually(|| h.protocol.sockets_opened() == 1).await;
        status_eventually(&h, |s| s.connected && s.message.is_none()).await;
    }

    #[tokio::test]
    async fn test_tenants_are_isolated() {
        let h = harness(open_script());
        let other = TenantId::from("school-2");
        h.manager.connect(&h.tenant).await;

        assert_eq!(
            h.manager.get_status(&other).await,
            StatusResponse::disconnected()
        );
        h.manager.disconnect(&other).await;
        assert!(h.manager.get_status(&h.tenant).await.connected);
    }

    #[tokio::test]
    async fn test_disconnect_during_status_read_prevents_background_reconnect() {
        let settings = Arc::new(GatedSettings::default());
        let protocol = Arc::new(ScriptedProtocol::new().with_script(open_script()));
        let manager = ConnectionManager::new(
            Arc::new(MemoryStorage::new()),
            Arc::clone(&settings),
            Arc::clone(&protocol),
            Arc::new(ConnectionRegistry::new()),
            test_config(),
        );
        let tenant = TenantId::from("school-1");
        settings
            .inner
            .put_settings(&tenant, &MessagingSettings::connected("923001234567", Utc::now()))
            .await
            .unwrap();
        settings.armed.store(true, Ordering::SeqCst);

        let racing = {
            let manager = Arc::clone(&manager);
            let tenant = tenant.clone();
            tokio::spawn(async move { manager.get_status(&tenant).await })
        };
        settings.entered.notified().await;
        assert_eq!(manager.disconnect(&tenant).await, DisconnectResponse::ok());
        settings.release.notify_one();

        assert_eq!(racing.await.unwrap(), StatusResponse::disconnected());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.get_status(&tenant).await, StatusResponse::disconnected());
        assert_eq!(protocol.sockets_opened(), 0);
        assert_eq!(protocol.identity_generations(), 0);
    }

    #[tokio::test]
    async fn test_late_key_write_after_disconnect_is_dropped() {
        let h = harness(open_script());
        h.manager.connect(&h.tenant).await;
        let socket = h.protocol.socket(0);
        socket
            .emit_credentials(Credentials::new(json!({"registered": true})))
            .await;
        socket
            .key_store()
            .set(vec![KeyUpdate::set("pre-key", "1", json!("a"))])
            .await;
        assert!(h.storage.exists(&h.tenant).await.unwrap());

        h.manager.disconnect(&h.tenant).await;
        socket
            .key_store()
            .set(vec![KeyUpdate::set("pre-key", "9", json!({"late": true}))])
            .await;

        assert!(!h.manager.has_persisted_session(&h.tenant).await);
        assert!(!h.storage.exists(&h.tenant).await.unwrap());
    }

    #[tokio::test]
    async fn test_disconnect_and_logout_release_tenant_state() {
        let h = harness(open_script());
        h.manager.connect(&h.tenant).await;
        assert!(h.manager.registry().is_tracked(&h.tenant));

        h.manager.disconnect(&h.tenant).await;
        eventually(|| {
            !h.manager.registry().is_tracked(&h.tenant) && h.manager.locked_tenants() == 0
        })
        .await;

        assert!(h.manager.connect(&h.tenant).await.success);
        h.protocol.socket(1).emit_close(DisconnectReason::LoggedOut);
        eventually(|| {
            !h.manager.registry().is_tracked(&h.tenant) && h.manager.locked_tenants() == 0
        })
        .await;
        assert_eq!(
            h.manager.get_status(&h.tenant).await,
            StatusResponse::disconnected()
        );
    }
}
