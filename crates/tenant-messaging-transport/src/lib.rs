//! Transport layer for tenant messaging.
//!
//! Exposes the connection manager and message dispatcher over HTTP.

#[cfg(feature = "http")]
pub mod routes;

#[cfg(feature = "http")]
pub use routes::{MessagingState, SendMessageRequest, create_messaging_router};
