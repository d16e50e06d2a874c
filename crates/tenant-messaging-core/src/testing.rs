//! Scripted in-process protocol (feature `testing`).
//!
//! Stands in for the external protocol library in tests and the demo server:
//! records every socket it opens and lets the caller emit the events a real
//! socket would.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};

use crate::{
    ConnectionUpdate, Credentials, DisconnectReason, IdentityGenerator, KeyStore, OpenedSocket,
    ProtocolClient, ProtocolError, ProtocolSocket, ProtocolVersion, SocketConfig, SocketEvent,
};

/// What a freshly opened socket does on its own.
#[derive(Debug, Clone, Default)]
pub enum AutoScript {
    /// Nothing; the test drives every event.
    #[default]
    Idle,
    /// Issue a pairing challenge immediately.
    Qr(String),
    /// Open immediately as `identity` (an already-paired session).
    Open { identity: String },
    /// Issue a challenge, then open as `identity` after `after`.
    QrThenOpen {
        qr: String,
        identity: String,
        after: Duration,
    },
}

/// Scripted protocol capability.
pub struct ScriptedProtocol {
    version: ProtocolVersion,
    script: Mutex<AutoScript>,
    fail_version: AtomicBool,
    fail_identity: AtomicBool,
    identity_generations: AtomicUsize,
    sockets: Mutex<Vec<Arc<ScriptedSocket>>>,
    opened_with: Mutex<Vec<Credentials>>,
}

impl Default for ScriptedProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedProtocol {
    #[must_use]
    pub fn new() -> Self {
        Self {
            version: ProtocolVersion::new(2, 3000, 1),
            script: Mutex::new(AutoScript::Idle),
            fail_version: AtomicBool::new(false),
            fail_identity: AtomicBool::new(false),
            identity_generations: AtomicUsize::new(0),
            sockets: Mutex::new(Vec::new()),
            opened_with: Mutex::new(Vec::new()),
        }
    }

    /// Builder: behavior of every socket opened from now on.
    #[must_use]
    pub fn with_script(self, script: AutoScript) -> Self {
        self.set_script(script);
        self
    }

    pub fn set_script(&self, script: AutoScript) {
        *self.script.lock() = script;
    }

    /// Make `fetch_version` fail.
    pub fn fail_version(&self, fail: bool) {
        self.fail_version.store(fail, Ordering::SeqCst);
    }

    /// Make identity generation fail.
    pub fn fail_identity(&self, fail: bool) {
        self.fail_identity.store(fail, Ordering::SeqCst);
    }

    /// How many times a fresh identity was generated.
    #[must_use]
    pub fn identity_generations(&self) -> usize {
        self.identity_generations.load(Ordering::SeqCst)
    }

    /// How many sockets have been opened.
    #[must_use]
    pub fn sockets_opened(&self) -> usize {
        self.sockets.lock().len()
    }

    /// The `index`-th opened socket.
    ///
    /// # Panics
    /// Panics if fewer sockets were opened.
    #[must_use]
    pub fn socket(&self, index: usize) -> Arc<ScriptedSocket> {
        Arc::clone(&self.sockets.lock()[index])
    }

    /// The most recently opened socket, if any.
    #[must_use]
    pub fn last_socket(&self) -> Option<Arc<ScriptedSocket>> {
        self.sockets.lock().last().cloned()
    }

    /// Credentials each socket was opened with, in order.
    #[must_use]
    pub fn opened_with(&self) -> Vec<Credentials> {
        self.opened_with.lock().clone()
    }
}

impl IdentityGenerator for ScriptedProtocol {
    fn generate_initial_identity(&self) -> Result<Credentials, ProtocolError> {
        if self.fail_identity.load(Ordering::SeqCst) {
            return Err(ProtocolError::Identity("scripted failure".to_string()));
        }
        let n = self.identity_generations.fetch_add(1, Ordering::SeqCst);
        Ok(Credentials::new(json!({
            "registrationId": n + 1,
            "registered": false,
        })))
    }
}

#[async_trait]
impl ProtocolClient for ScriptedProtocol {
    async fn fetch_version(&self) -> Result<ProtocolVersion, ProtocolError> {
        if self.fail_version.load(Ordering::SeqCst) {
            return Err(ProtocolError::Version("scripted failure".to_string()));
        }
        Ok(self.version)
    }

    async fn open_socket(&self, config: SocketConfig) -> Result<OpenedSocket, ProtocolError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let socket = Arc::new(ScriptedSocket {
            identity: Mutex::new(None),
            events: Mutex::new(Some(tx)),
            sent: Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            key_store: config.key_store,
        });

        self.opened_with.lock().push(config.credentials);
        self.sockets.lock().push(Arc::clone(&socket));

        let script = self.script.lock().clone();
        match script {
            AutoScript::Idle => {}
            AutoScript::Qr(qr) => socket.emit_qr(qr),
            AutoScript::Open { identity } => socket.emit_open(identity),
            AutoScript::QrThenOpen {
                qr,
                identity,
                after,
            } => {
                socket.emit_qr(qr);
                let delayed = Arc::clone(&socket);
                tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    delayed.emit_open(identity);
                });
            }
        }

        Ok(OpenedSocket {
            socket: socket as Arc<dyn ProtocolSocket>,
            events: rx,
        })
    }
}

/// A socket opened by [`ScriptedProtocol`].
pub struct ScriptedSocket {
    identity: Mutex<Option<String>>,
    events: Mutex<Option<mpsc::UnboundedSender<SocketEvent>>>,
    sent: Mutex<Vec<(String, String)>>,
    fail_sends: AtomicBool,
    terminated: AtomicBool,
    key_store: Arc<dyn KeyStore>,
}

impl ScriptedSocket {
    fn emit(&self, event: SocketEvent) {
        if let Some(tx) = self.events.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    /// Issue a raw pairing challenge.
    pub fn emit_qr(&self, raw: impl Into<String>) {
        self.emit(SocketEvent::Connection(ConnectionUpdate::qr(raw)));
    }

    /// Become authenticated as `identity` and report the link open.
    pub fn emit_open(&self, identity: impl Into<String>) {
        *self.identity.lock() = Some(identity.into());
        self.emit(SocketEvent::Connection(ConnectionUpdate::open()));
    }

    /// Report the link closed.
    pub fn emit_close(&self, reason: DisconnectReason) {
        self.emit(SocketEvent::Connection(ConnectionUpdate::closed(reason)));
    }

    /// Rotate credentials and wait until the receiver has persisted them.
    ///
    /// Returns `false` if the event was dropped unacknowledged.
    pub async fn emit_credentials(&self, credentials: Credentials) -> bool {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.emit(SocketEvent::CredentialsUpdated {
            credentials,
            persisted: Some(ack_tx),
        });
        ack_rx.await.is_ok()
    }

    /// Drop the event stream without a close event, as a crashed socket would.
    pub fn drop_events(&self) {
        self.events.lock().take();
    }

    /// Make `send_text` fail.
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Messages submitted so far, as `(destination, text)`.
    #[must_use]
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().clone()
    }

    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// The key store this socket was opened with.
    #[must_use]
    pub fn key_store(&self) -> Arc<dyn KeyStore> {
        Arc::clone(&self.key_store)
    }
}

#[async_trait]
impl ProtocolSocket for ScriptedSocket {
    fn identity(&self) -> Option<String> {
        self.identity.lock().clone()
    }

    async fn send_text(&self, destination: &str, text: &str) -> Result<String, ProtocolError> {
        if self.is_terminated() {
            return Err(ProtocolError::Closed);
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(ProtocolError::Send("scripted failure".to_string()));
        }
        let mut sent = self.sent.lock();
        sent.push((destination.to_string(), text.to_string()));
        Ok(format!("MSG{:04}", sent.len()))
    }

    async fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        self.events.lock().take();
    }
}
