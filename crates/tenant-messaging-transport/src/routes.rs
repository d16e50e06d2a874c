//! HTTP routes for tenant messaging.
//!
//! Every route answers `200` with the operation's result shape; only a
//! malformed send request is rejected up front.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tenant_messaging_core::{
    ConnectResponse, DisconnectResponse, ProtocolClient, SendResponse, SessionStorage,
    SettingsStorage, StatusResponse, TenantId,
};
use tenant_messaging_dispatch::MessageDispatcher;
use tenant_messaging_session::ConnectionManager;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::debug;

/// Shared handler state.
pub struct MessagingState<S, M, P> {
    pub manager: Arc<ConnectionManager<S, M, P>>,
    pub dispatcher: Arc<MessageDispatcher<S, M, P>>,
}

impl<S, M, P> Clone for MessagingState<S, M, P> {
    fn clone(&self) -> Self {
        Self {
            manager: Arc::clone(&self.manager),
            dispatcher: Arc::clone(&self.dispatcher),
        }
    }
}

impl<S, M, P> MessagingState<S, M, P>
where
    S: SessionStorage + 'static,
    M: SettingsStorage + 'static,
    P: ProtocolClient + 'static,
{
    #[must_use]
    pub fn new(manager: Arc<ConnectionManager<S, M, P>>) -> Self {
        let dispatcher = Arc::new(MessageDispatcher::new(Arc::clone(&manager)));
        Self {
            manager,
            dispatcher,
        }
    }
}

/// Body of `POST /tenants/{tenant_id}/messaging/messages`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub phone: String,
    pub message: String,
}

/// Create the messaging router.
///
/// # Example
/// ```ignore
/// let app = Router::new().merge(create_messaging_router(manager));
/// ```
#[must_use]
pub fn create_messaging_router<S, M, P>(manager: Arc<ConnectionManager<S, M, P>>) -> Router
where
    S: SessionStorage + 'static,
    M: SettingsStorage + 'static,
    P: ProtocolClient + 'static,
{
    Router::new()
        .route(
            "/tenants/{tenant_id}/messaging/connect",
            post(connect_handler::<S, M, P>),
        )
        .route(
            "/tenants/{tenant_id}/messaging/status",
            get(status_handler::<S, M, P>),
        )
        .route(
            "/tenants/{tenant_id}/messaging/disconnect",
            post(disconnect_handler::<S, M, P>),
        )
        .route(
            "/tenants/{tenant_id}/messaging/messages",
            post(send_handler::<S, M, P>),
        )
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(MessagingState::new(manager))
}

async fn connect_handler<S, M, P>(
    State(state): State<MessagingState<S, M, P>>,
    Path(tenant_id): Path<String>,
) -> Json<ConnectResponse>
where
    S: SessionStorage + 'static,
    M: SettingsStorage + 'static,
    P: ProtocolClient + 'static,
{
    Json(state.manager.connect(&TenantId::new(tenant_id)).await)
}

async fn status_handler<S, M, P>(
    State(state): State<MessagingState<S, M, P>>,
    Path(tenant_id): Path<String>,
) -> Json<StatusResponse>
where
    S: SessionStorage + 'static,
    M: SettingsStorage + 'static,
    P: ProtocolClient + 'static,
{
    Json(state.manager.get_status(&TenantId::new(tenant_id)).await)
}

async fn disconnect_handler<S, M, P>(
    State(state): State<MessagingState<S, M, P>>,
    Path(tenant_id): Path<String>,
) -> Json<DisconnectResponse>
where
    S: SessionStorage + 'static,
    M: SettingsStorage + 'static,
    P: ProtocolClient + 'static,
{
    Json(state.manager.disconnect(&TenantId::new(tenant_id)).await)
}

async fn send_handler<S, M, P>(
    State(state): State<MessagingState<S, M, P>>,
    Path(tenant_id): Path<String>,
    Json(request): Json<SendMessageRequest>,
) -> (StatusCode, Json<SendResponse>)
where
    S: SessionStorage + 'static,
    M: SettingsStorage + 'static,
    P: ProtocolClient + 'static,
{
    if request.phone.trim().is_empty() || request.message.is_empty() {
        debug!(%tenant_id, "Rejected send with empty phone or message");
        return (
            StatusCode::BAD_REQUEST,
            Json(SendResponse::failed("phone and message are required")),
        );
    }

    let response = state
        .dispatcher
        .send_message(&TenantId::new(tenant_id), &request.phone, &request.message)
        .await;
    (StatusCode::OK, Json(response))
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{Body, to_bytes},
        http::{Request, header},
    };
    use serde_json::{Value, json};
    use tenant_messaging_core::{
        MessagingConfig,
        testing::{AutoScript, ScriptedProtocol},
    };
    use tenant_messaging_session::{ConnectionRegistry, storage::MemoryStorage};
    use tower::ServiceExt;

    use super::*;

    fn router(script: AutoScript) -> (Router, Arc<ScriptedProtocol>) {
        let storage = Arc::new(MemoryStorage::new());
        let protocol = Arc::new(ScriptedProtocol::new().with_script(script));
        let manager = ConnectionManager::new(
            Arc::clone(&storage),
            storage,
            Arc::clone(&protocol),
            Arc::new(ConnectionRegistry::new()),
            MessagingConfig::default(),
        );
        (create_messaging_router(manager), protocol)
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .unwrap();

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_connect_then_status_then_send() {
        let (app, protocol) = router(AutoScript::Open {
            identity: "923001234567:1@s.whatsapp.net".to_string(),
        });

        let (status, body) = call(&app, "POST", "/tenants/s1/messaging/connect", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({"success": true, "connected": true, "phoneNumber": "923001234567"})
        );

        let (_, body) = call(&app, "GET", "/tenants/s1/messaging/status", None).await;
        assert_eq!(body, json!({"connected": true, "phoneNumber": "923001234567"}));

        let (status, body) = call(
            &app,
            "POST",
            "/tenants/s1/messaging/messages",
            Some(json!({"phone": "0300-7654321", "message": "Hello"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"success": true, "messageId": "MSG0001"}));
        assert_eq!(protocol.socket(0).sent()[0].0, "923007654321@s.whatsapp.net");
    }

    #[tokio::test]
    async fn test_disconnect_without_connection() {
        let (app, _) = router(AutoScript::Idle);

        let (status, body) = call(&app, "POST", "/tenants/s1/messaging/disconnect", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({"success": true, "message": "Disconnected successfully"})
        );

        let (_, body) = call(&app, "GET", "/tenants/s1/messaging/status", None).await;
        assert_eq!(body, json!({"connected": false, "phoneNumber": ""}));
    }

    #[tokio::test]
    async fn test_send_not_connected() {
        let (app, _) = router(AutoScript::Idle);

        let (status, body) = call(
            &app,
            "POST",
            "/tenants/s1/messaging/messages",
            Some(json!({"phone": "3001234567", "message": "Hi"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({"success": false, "error": "WhatsApp not connected"})
        );
    }

    #[tokio::test]
    async fn test_send_rejects_empty_fields() {
        let (app, _) = router(AutoScript::Idle);

        let (status, body) = call(
            &app,
            "POST",
            "/tenants/s1/messaging/messages",
            Some(json!({"phone": " ", "message": "Hi"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], json!(false));
    }
}
