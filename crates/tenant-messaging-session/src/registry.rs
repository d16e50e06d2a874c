//! Process-wide in-memory connection state, keyed by tenant.
//!
//! Holds the active connection handle, the pending-QR cache and the
//! in-flight connect cache for every tenant. Every method takes the lock
//! once, so each check-and-mutate is atomic per tenant. Nothing here is
//! persisted; it is rebuilt from session records after a restart.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use parking_lot::Mutex;
use tenant_messaging_core::{ConnectOutcome, ProtocolSocket, TenantId, phone_number_from_identity};
use tokio::sync::oneshot;

/// Future shared by every caller coalesced onto one connect attempt.
pub type SharedConnect = Shared<BoxFuture<'static, ConnectOutcome>>;

/// An installed socket.
#[derive(Clone)]
pub struct ConnectionEntry {
    pub id: u64,
    pub socket: Arc<dyn ProtocolSocket>,
}

impl ConnectionEntry {
    /// True once the socket knows its paired identity.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.socket.identity().is_some()
    }

    /// Phone number of the paired identity, once known.
    #[must_use]
    pub fn phone_number(&self) -> Option<String> {
        self.socket
            .identity()
            .map(|identity| phone_number_from_identity(&identity))
    }
}

/// How a socket open was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// A caller asked to connect; an unpaired socket may be replaced.
    Fresh,
    /// Automatic reconnect; yields to any socket already installed.
    Reconnect,
}

/// Result of [`ConnectionRegistry::begin_connect`].
pub enum ConnectTicket {
    /// An authenticated connection already exists.
    Connected { phone_number: String },
    /// Another attempt is in flight; await its outcome.
    Joined(SharedConnect),
    /// This caller started a new attempt and must drive it.
    Started(StartedConnect),
}

/// A newly registered connect attempt.
pub struct StartedConnect {
    pub attempt: u64,
    pub epoch: u64,
    /// Receives the first resolution (QR, open, or failure).
    pub resolution: oneshot::Receiver<ConnectOutcome>,
    /// Publishes the settled outcome to every coalesced caller.
    pub settle: oneshot::Sender<ConnectOutcome>,
    pub outcome: SharedConnect,
}

/// Snapshot of a tenant's epoch, taken before a slow read.
///
/// Epochs are drawn from a registry-wide counter, so a slot that is
/// dropped and created again never reuses one. A tenant with no slot is
/// tracked by the registry's cancel count instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochMark {
    epoch: Option<u64>,
    cancels: u64,
}

/// Everything `cancel` tore down for a tenant.
pub struct Cancelled {
    pub connection: Option<ConnectionEntry>,
    pub pending: Option<oneshot::Sender<ConnectOutcome>>,
}

struct InFlight {
    attempt: u64,
    outcome: SharedConnect,
}

struct Pending {
    attempt: u64,
    resolver: oneshot::Sender<ConnectOutcome>,
}

struct TenantSlot {
    /// Replaced by `cancel`; work started under an older epoch is stale.
    epoch: u64,
    connection: Option<ConnectionEntry>,
    opening: bool,
    qr: Option<String>,
    in_flight: Option<InFlight>,
    pending: Option<Pending>,
    reconnect_attempts: u32,
    failure: Option<String>,
}

impl TenantSlot {
    const fn new(epoch: u64) -> Self {
        Self {
            epoch,
            connection: None,
            opening: false,
            qr: None,
            in_flight: None,
            pending: None,
            reconnect_attempts: 0,
            failure: None,
        }
    }

    const fn is_idle(&self) -> bool {
        self.connection.is_none()
            && !self.opening
            && self.qr.is_none()
            && self.in_flight.is_none()
            && self.pending.is_none()
            && self.reconnect_attempts == 0
            && self.failure.is_none()
    }
}

/// In-memory connection registry.
pub struct ConnectionRegistry {
    slots: Mutex<HashMap<TenantId, TenantSlot>>,
    next_id: AtomicU64,
    cancels: AtomicU64,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            cancels: AtomicU64::new(0),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn with_slot<R>(&self, tenant: &TenantId, f: impl FnOnce(&mut TenantSlot) -> R) -> R {
        let mut slots = self.slots.lock();
        f(slots
            .entry(tenant.clone())
            .or_insert_with(|| TenantSlot::new(self.next_id())))
    }

    fn read_slot<R>(&self, tenant: &TenantId, f: impl FnOnce(&TenantSlot) -> R) -> Option<R> {
        self.slots.lock().get(tenant).map(f)
    }

    /// Atomically join an in-flight attempt, short-circuit on a live
    /// authenticated connection, or register a new attempt.
    ///
    /// Starting an attempt clears the cached QR and any failure marker.
    pub fn begin_connect(&self, tenant: &TenantId) -> ConnectTicket {
        let attempt = self.next_id();
        self.with_slot(tenant, |slot| Self::start_or_join(slot, attempt))
    }

    /// Like [`Self::begin_connect`], but refuses with `None` if the tenant
    /// was cancelled since `mark` was taken.
    pub fn begin_connect_at(&self, tenant: &TenantId, mark: EpochMark) -> Option<ConnectTicket> {
        let attempt = self.next_id();
        let mut slots = self.slots.lock();
        let unchanged = match (slots.get(tenant), mark.epoch) {
            (Some(slot), Some(epoch)) => slot.epoch == epoch,
            (None, Some(_)) => false,
            (_, None) => self.cancels.load(Ordering::SeqCst) == mark.cancels,
        };
        if !unchanged {
            return None;
        }
        let slot = slots
            .entry(tenant.clone())
            .or_insert_with(|| TenantSlot::new(self.next_id()));
        Some(Self::start_or_join(slot, attempt))
    }

    fn start_or_join(slot: &mut TenantSlot, attempt: u64) -> ConnectTicket {
        if let Some(in_flight) = &slot.in_flight {
            return ConnectTicket::Joined(in_flight.outcome.clone());
        }
        if let Some(phone_number) = slot
            .connection
            .as_ref()
            .and_then(ConnectionEntry::phone_number)
        {
            return ConnectTicket::Connected { phone_number };
        }

        let (resolver, resolution) = oneshot::channel();
        let (settle, settled) = oneshot::channel();
        let outcome = settled
            .map(|result| {
                result.unwrap_or_else(|_| {
                    ConnectOutcome::Failed("Connection attempt abandoned".to_string())
                })
            })
            .boxed()
            .shared();

        slot.qr = None;
        slot.failure = None;
        slot.pending = Some(Pending { attempt, resolver });
        slot.in_flight = Some(InFlight {
            attempt,
            outcome: outcome.clone(),
        });

        ConnectTicket::Started(StartedConnect {
            attempt,
            epoch: slot.epoch,
            resolution,
            settle,
            outcome,
        })
    }

    /// Drop the in-flight entry (and any unresolved pending resolver) of
    /// `attempt`. A later attempt's entries are left alone. The slot itself
    /// is dropped if nothing else is left in it.
    pub fn finish_connect(&self, tenant: &TenantId, attempt: u64) {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(tenant) else {
            return;
        };
        if slot.in_flight.as_ref().is_some_and(|f| f.attempt == attempt) {
            slot.in_flight = None;
        }
        if slot.pending.as_ref().is_some_and(|p| p.attempt == attempt) {
            slot.pending = None;
        }
        if slot.is_idle() {
            slots.remove(tenant);
        }
    }

    /// Drop the tenant's slot if it holds no connection, attempt, QR,
    /// reconnect or failure. Returns whether it was dropped.
    pub fn release_if_idle(&self, tenant: &TenantId) -> bool {
        let mut slots = self.slots.lock();
        if slots.get(tenant).is_some_and(TenantSlot::is_idle) {
            slots.remove(tenant);
            return true;
        }
        false
    }

    /// Whether the registry holds any state for the tenant.
    #[must_use]
    pub fn is_tracked(&self, tenant: &TenantId) -> bool {
        self.slots.lock().contains_key(tenant)
    }

    /// Whether a connect attempt is in flight.
    #[must_use]
    pub fn is_connecting(&self, tenant: &TenantId) -> bool {
        self.read_slot(tenant, |slot| slot.in_flight.is_some())
            .unwrap_or(false)
    }

    /// Resolve the pending connect, if any. Returns whether one was waiting.
    pub fn resolve_pending(&self, tenant: &TenantId, outcome: ConnectOutcome) -> bool {
        let pending = self.with_slot(tenant, |slot| slot.pending.take());
        pending.is_some_and(|p| p.resolver.send(outcome).is_ok())
    }

    /// Claim the right to open a socket under `epoch`.
    ///
    /// Fails if the epoch is stale or another open is underway; a reconnect
    /// also yields to an already installed connection.
    pub fn try_begin_open(&self, tenant: &TenantId, epoch: u64, mode: OpenMode) -> bool {
        self.with_slot(tenant, |slot| {
            if slot.epoch != epoch || slot.opening {
                return false;
            }
            if mode == OpenMode::Reconnect && slot.connection.is_some() {
                return false;
            }
            slot.opening = true;
            true
        })
    }

    /// Release an open claim made under `epoch` without installing
    /// anything. A claim made under a newer epoch is left alone.
    pub fn abort_open(&self, tenant: &TenantId, epoch: u64) {
        self.with_slot(tenant, |slot| {
            if slot.epoch == epoch {
                slot.opening = false;
            }
        });
    }

    /// Install `socket` as the tenant's connection.
    ///
    /// Returns the new connection id and any replaced entry, or `None` if
    /// the epoch went stale while the socket was opening.
    pub fn install_connection(
        &self,
        tenant: &TenantId,
        epoch: u64,
        socket: Arc<dyn ProtocolSocket>,
    ) -> Option<(u64, Option<ConnectionEntry>)> {
        let id = self.next_id();
        self.with_slot(tenant, |slot| {
            if slot.epoch != epoch {
                return None;
            }
            slot.opening = false;
            let replaced = slot.connection.replace(ConnectionEntry { id, socket });
            Some((id, replaced))
        })
    }

    /// Whether connection `id` is still the tenant's current one under `epoch`.
    #[must_use]
    pub fn is_current(&self, tenant: &TenantId, epoch: u64, id: u64) -> bool {
        self.read_slot(tenant, |slot| {
            slot.epoch == epoch && slot.connection.as_ref().is_some_and(|c| c.id == id)
        })
        .unwrap_or(false)
    }

    /// Remove connection `id` if it is still installed.
    pub fn remove_connection(&self, tenant: &TenantId, id: u64) -> Option<ConnectionEntry> {
        self.with_slot(tenant, |slot| {
            if slot.connection.as_ref().is_some_and(|c| c.id == id) {
                slot.connection.take()
            } else {
                None
            }
        })
    }

    /// The tenant's connection, authenticated or not.
    #[must_use]
    pub fn connection(&self, tenant: &TenantId) -> Option<ConnectionEntry> {
        self.read_slot(tenant, |slot| slot.connection.clone())
            .flatten()
    }

    /// Phone number of the tenant's authenticated connection.
    #[must_use]
    pub fn authenticated_phone(&self, tenant: &TenantId) -> Option<String> {
        self.connection(tenant)
            .and_then(|entry| entry.phone_number())
    }

    pub fn set_qr(&self, tenant: &TenantId, image: String) {
        self.with_slot(tenant, |slot| slot.qr = Some(image));
    }

    pub fn clear_qr(&self, tenant: &TenantId) {
        self.with_slot(tenant, |slot| slot.qr = None);
    }

    #[must_use]
    pub fn qr(&self, tenant: &TenantId) -> Option<String> {
        self.read_slot(tenant, |slot| slot.qr.clone()).flatten()
    }

    /// The tenant's current epoch; `0` (never issued) if it has no slot.
    #[must_use]
    pub fn epoch(&self, tenant: &TenantId) -> u64 {
        self.read_slot(tenant, |slot| slot.epoch).unwrap_or(0)
    }

    /// Snapshot the tenant's epoch for a later [`Self::begin_connect_at`].
    #[must_use]
    pub fn mark(&self, tenant: &TenantId) -> EpochMark {
        let slots = self.slots.lock();
        EpochMark {
            epoch: slots.get(tenant).map(|slot| slot.epoch),
            cancels: self.cancels.load(Ordering::SeqCst),
        }
    }

    #[must_use]
    pub fn reconnect_attempts(&self, tenant: &TenantId) -> u32 {
        self.read_slot(tenant, |slot| slot.reconnect_attempts)
            .unwrap_or(0)
    }

    pub fn set_reconnect_attempts(&self, tenant: &TenantId, attempts: u32) {
        self.with_slot(tenant, |slot| slot.reconnect_attempts = attempts);
    }

    /// Record that automatic reconnects gave up.
    pub fn set_failure(&self, tenant: &TenantId, reason: String) {
        self.with_slot(tenant, |slot| {
            slot.failure = Some(reason);
            slot.reconnect_attempts = 0;
        });
    }

    #[must_use]
    pub fn failure(&self, tenant: &TenantId) -> Option<String> {
        self.read_slot(tenant, |slot| slot.failure.clone()).flatten()
    }

    /// Invalidate all work for the tenant and take what must be torn down.
    ///
    /// The in-flight entry stays until its attempt settles, which happens
    /// as soon as the returned pending resolver is used or dropped.
    pub fn cancel(&self, tenant: &TenantId) -> Cancelled {
        self.with_slot(tenant, |slot| {
            self.cancels.fetch_add(1, Ordering::SeqCst);
            slot.epoch = self.next_id();
            slot.opening = false;
            slot.qr = None;
            slot.reconnect_attempts = 0;
            slot.failure = None;
            Cancelled {
                connection: slot.connection.take(),
                pending: slot.pending.take().map(|p| p.resolver),
            }
        })
    }
}
