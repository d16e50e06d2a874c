//! Example web server driving tenant messaging sessions.
//!
//! Uses the scripted in-process protocol: every connect shows a QR code,
//! and the "phone" pairs itself a few seconds later.
//!
//! Run with: cargo run -p web-server-example
//!
//! Then open http://localhost:3000 in your browser.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{Router, response::Html, routing::get};
use tenant_messaging_core::{
    MessagingConfig,
    testing::{AutoScript, ScriptedProtocol},
};
use tenant_messaging_session::{ConnectionManager, ConnectionRegistry, storage::MemoryStorage};
use tenant_messaging_transport::create_messaging_router;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = MessagingConfig::from_env()?;
    let storage = Arc::new(MemoryStorage::new());
    let protocol = Arc::new(ScriptedProtocol::new().with_script(AutoScript::QrThenOpen {
        qr: "2@demo-pairing-ref,demo-key,demo-identity,1".to_string(),
        identity: "923001234567:1@s.whatsapp.net".to_string(),
        after: Duration::from_secs(5),
    }));

    let manager = ConnectionManager::new(
        Arc::clone(&storage),
        storage,
        protocol,
        Arc::new(ConnectionRegistry::new()),
        config,
    );

    // Build router
    let app = Router::new()
        .route("/", get(index_handler))
        .merge(create_messaging_router(manager));

    // Start server
    let addr = SocketAddr::from(([127, 0, 0, 1], 3000));
    tracing::info!("Server listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <title>Tenant Messaging</title>
    <style>
        body { font-family: sans-serif; background: #1e1e1e; color: #d4d4d4; margin: 2rem; }
        button, input { margin: 0.25rem; padding: 0.4rem 0.8rem; }
        #qr img { width: 256px; height: 256px; background: #fff; }
        pre { background: #252526; padding: 1rem; }
    </style>
</head>
<body>
    <h1>Tenant Messaging</h1>
    <label>Tenant <input id="tenant" value="school-1"></label>
    <div>
        <button onclick="call('POST', 'connect')">Connect</button>
        <button onclick="call('GET', 'status')">Status</button>
        <button onclick="call('POST', 'disconnect')">Disconnect</button>
    </div>
    <div>
        <input id="phone" placeholder="0300-1234567">
        <input id="message" placeholder="Message">
        <button onclick="send()">Send</button>
    </div>
    <div id="qr"></div>
    <pre id="out"></pre>
    <script>
        const base = () => `/tenants/${encodeURIComponent(document.getElementById('tenant').value)}/messaging`;

        function show(body) {
            document.getElementById('out').textContent = JSON.stringify(body, null, 2);
            const qr = document.getElementById('qr');
            qr.innerHTML = body.qrCode ? `<img src="${body.qrCode}" alt="QR code">` : '';
        }

        async function call(method, action) {
            const res = await fetch(`${base()}/${action}`, { method });
            show(await res.json());
        }

        async function send() {
            const res = await fetch(`${base()}/messages`, {
                method: 'POST',
                headers: { 'Content-Type': 'application/json' },
                body: JSON.stringify({
                    phone: document.getElementById('phone').value,
                    message: document.getElementById('message').value,
                }),
            });
            show(await res.json());
        }
    </script>
</body>
</html>
"#;
