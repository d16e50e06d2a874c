//! Outbound text delivery.

use std::sync::Arc;

use tenant_messaging_core::{
    ProtocolClient, ProtocolSocket, SendResponse, SessionStorage, SettingsStorage, TenantId,
};
use tenant_messaging_session::ConnectionManager;
use tracing::{debug, error, info, warn};

use crate::phone::PhoneNormalizer;

/// Sends text messages through whatever connection a tenant has, or can get.
pub struct MessageDispatcher<S, M, P> {
    manager: Arc<ConnectionManager<S, M, P>>,
    normalizer: PhoneNormalizer,
}

impl<S, M, P> MessageDispatcher<S, M, P>
where
    S: SessionStorage + 'static,
    M: SettingsStorage + 'static,
    P: ProtocolClient + 'static,
{
    /// Create a dispatcher normalizing numbers per the manager's config.
    #[must_use]
    pub fn new(manager: Arc<ConnectionManager<S, M, P>>) -> Self {
        let normalizer = PhoneNormalizer::from_config(manager.config());
        Self {
            manager,
            normalizer,
        }
    }

    #[must_use]
    pub const fn normalizer(&self) -> &PhoneNormalizer {
        &self.normalizer
    }

    /// Send `text` to `raw_number` on behalf of `tenant`.
    ///
    /// A tenant with a persisted session but no live connection is
    /// reconnected first. Never fails; errors are reported in the response.
    pub async fn send_message(&self, tenant: &TenantId, raw_number: &str, text: &str) -> SendResponse {
        let Some(socket) = self.usable_socket(tenant).await else {
            warn!(%tenant, "Send refused: not connected");
            return SendResponse::not_connected();
        };

        let destination = self.normalizer.normalize(raw_number);
        match socket.send_text(&destination, text).await {
            Ok(message_id) => {
                info!(%tenant, %destination, %message_id, "Message sent");
                SendResponse::sent(message_id)
            }
            Err(e) => {
                error!(%tenant, %destination, "Failed to send message: {e}");
                SendResponse::failed(e.to_string())
            }
        }
    }

    async fn usable_socket(&self, tenant: &TenantId) -> Option<Arc<dyn ProtocolSocket>> {
        if let Some(socket) = self.manager.authenticated_socket(tenant) {
            return Some(socket);
        }
        if !self.manager.has_persisted_session(tenant).await {
            return None;
        }

        info!(%tenant, "No live connection; reconnecting before send");
        let response = self.manager.connect(tenant).await;
        debug!(%tenant, ?response, "Reconnect before send settled");
        tokio::time::sleep(self.manager.config().send_reconnect_grace()).await;

        self.manager.authenticated_socket(tenant)
    }
}
