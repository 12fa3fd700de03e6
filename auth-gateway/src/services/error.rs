//! Gateway error type.

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the gateway.
///
/// `InvalidCredentials` and `AccountLocked` render to the same message on
/// purpose: callers relay the display string to clients, and a lockout
/// must not be distinguishable from a wrong password on the wire. The
/// structured variant is still available for internal handling (the audit
/// trail records the real cause).
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("too many requests")]
    RateLimited { retry_after: std::time::Duration },

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("invalid credentials")]
    AccountLocked { locked_until: DateTime<Utc> },

    #[error("invalid two-factor code")]
    InvalidTwoFactorCode,

    #[error("invalid token")]
    InvalidToken,

    #[error("token expired")]
    TokenExpired,

    #[error("token replay detected")]
    TokenReplayDetected,

    #[error("provider identity already linked")]
    OAuthAlreadyLinked,

    #[error("provider link requires confirmation")]
    OAuthNeedsConfirmation { existing_identity: Uuid },

    #[error("backing store unavailable")]
    BackingStoreUnavailable(#[source] anyhow::Error),

    #[error("configuration error: {0}")]
    Config(anyhow::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}
