//! Outbound messaging for tenant sessions.
//!
//! - `PhoneNormalizer` - Raw phone numbers to protocol destination ids
//! - `MessageDispatcher` - Send text through a tenant's active connection

pub mod dispatcher;
pub mod phone;

pub use dispatcher::MessageDispatcher;
pub use phone::PhoneNormalizer;
