//! Authentication gateway and session lifecycle engine.
//!
//! Coordinates rate limiting, account lockout, credential verification,
//! second-factor enforcement, token issuance/rotation/revocation, and
//! external-identity linking, all under concurrent access from many
//! callers. HTTP transport, user-record persistence, notification
//! delivery, and audit storage live outside this crate and are reached
//! through the traits in [`services`].

pub mod config;
pub mod models;
pub mod services;
pub mod utils;

pub use config::GatewayConfig;
pub use models::{AuditEvent, AuditEventKind, Identity, LockoutState, TokenPair};
pub use services::{
    AuthGateway, AuthStore, GatewayError, LoginOutcome, LoginRequest, MemoryStore,
};
