//! Session lifecycle and storage for per-tenant messaging.
//!
//! Provides:
//! - `SessionStore` - Tenant-scoped auth state over a storage backend
//! - `ConnectionRegistry` - In-memory connection, QR and in-flight caches
//! - `ConnectionManager` - Connect / status / disconnect per tenant
//! - Storage implementations (memory, SQLite)

pub mod auth_state;
pub mod backoff;
pub mod machine;
pub mod manager;
pub mod qr;
pub mod registry;
pub mod storage;

pub use auth_state::{AuthState, SessionStore, TenantKeyStore, WriteGate};
pub use machine::{ConnectionState, Effect, Event, SessionMachine};
pub use manager::ConnectionManager;
pub use qr::{QrError, QrRenderer, SvgDataUrlRenderer};
pub use registry::{ConnectionEntry, ConnectionRegistry, EpochMark};
